use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_client::testing::{MockFactory, MockHost, MockHub};
use tether_client::{ConnectionManager, Refresh, RpcError};
use tether_config::ClientConfig;
use tether_types::ConnectionState;
use tokio::time::sleep;

const PROBE: &str = "system.ping";

struct NoteRefresher {
    name: String,
    hub: Arc<MockHub>,
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl Refresh for NoteRefresher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hub.note(format!("refresh:{}", self.name));
        if self.fail {
            anyhow::bail!("refresh rejected");
        }
        Ok(())
    }
}

fn refresher(hub: &Arc<MockHub>, name: &str, fail: bool) -> Arc<NoteRefresher> {
    Arc::new(NoteRefresher {
        name: name.to_string(),
        hub: Arc::clone(hub),
        calls: AtomicUsize::new(0),
        fail,
    })
}

fn weak(refresher: &Arc<NoteRefresher>) -> Weak<dyn Refresh> {
    let weak: Weak<NoteRefresher> = Arc::downgrade(refresher);
    weak
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        visibility_debounce_ms: Some(10),
        probe_timeout_ms: Some(200),
        ..Default::default()
    }
}

async fn bound() -> (Arc<MockFactory>, ConnectionManager, Arc<MockHost>) {
    let factory = Arc::new(MockFactory::new());
    factory.hub().respond(PROBE, json!({ "ok": true }));
    let manager = ConnectionManager::new(factory.clone(), fast_config());
    manager.get_hub().await.unwrap();
    let host = Arc::new(MockHost::new());
    manager.bind_host(host.clone());
    (factory, manager, host)
}

async fn settle() {
    sleep(Duration::from_millis(80)).await;
}

#[tokio::test]
async fn resume_probes_then_resubscribes_then_refreshes() {
    let (factory, manager, host) = bound().await;
    let hub = factory.hub();
    let global = refresher(&hub, "global", false);
    manager.register_refresher(weak(&global));

    host.set_visible(false);
    host.set_visible(true);
    settle().await;

    assert_eq!(
        hub.log(),
        vec![
            "reset_backoff".to_string(),
            format!("call:{PROBE}"),
            "resubscribe".to_string(),
            "refresh:global".to_string(),
        ]
    );
    assert_eq!(global.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_probe_forces_reconnect_and_skips_refresh() {
    let (factory, manager, host) = bound().await;
    let hub = factory.hub();
    hub.queue(PROBE, Err(RpcError::Server("stale socket".into())));
    let global = refresher(&hub, "global", false);
    manager.register_refresher(weak(&global));

    host.set_visible(true);
    settle().await;

    assert_eq!(
        hub.log(),
        vec![
            "reset_backoff".to_string(),
            format!("call:{PROBE}"),
            "force_reconnect".to_string(),
        ]
    );
    assert_eq!(hub.resubscribe_count(), 0);
    assert_eq!(global.calls.load(Ordering::SeqCst), 0);
    assert_eq!(factory.transport().unwrap().force_reconnect_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn page_hide_cancels_pending_revalidation() {
    let (factory, _manager, host) = bound().await;

    host.set_visible(true);
    host.page_hide();
    settle().await;

    assert!(factory.hub().calls_to(PROBE).is_empty());
}

#[tokio::test]
async fn rapid_visibility_changes_are_debounced() {
    let (factory, _manager, host) = bound().await;

    host.set_visible(true);
    host.set_visible(true);
    host.set_visible(true);
    settle().await;

    assert_eq!(factory.hub().calls_to(PROBE).len(), 1);
}

#[tokio::test]
async fn resume_without_channel_reconnects() {
    let factory = Arc::new(MockFactory::new());
    let manager = ConnectionManager::new(factory.clone(), fast_config());
    let host = Arc::new(MockHost::new());
    manager.bind_host(host.clone());

    host.set_visible(true);
    settle().await;

    assert_eq!(factory.connect_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(factory.hub().calls_to(PROBE).is_empty());
}

#[tokio::test]
async fn failing_refresher_does_not_stop_the_others() {
    let (factory, manager, host) = bound().await;
    let hub = factory.hub();
    let failing = refresher(&hub, "settings", true);
    let ok = refresher(&hub, "sessions", false);
    manager.register_refresher(weak(&failing));
    let ok_id = manager.register_refresher(weak(&ok));

    host.set_visible(true);
    settle().await;
    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ok.calls.load(Ordering::SeqCst), 1);

    assert!(manager.unregister_refresher(ok_id));
    assert_eq!(manager.refresh_registered().await, 1);
    assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn host_listeners_follow_the_connection() {
    let (factory, manager, host) = bound().await;
    assert_eq!(host.listener_count(), 2);

    manager.bind_host(host.clone());
    assert_eq!(host.listener_count(), 2);

    manager.disconnect().await;
    assert_eq!(host.listener_count(), 0);

    host.set_visible(true);
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(factory.connect_attempts(), 1);

    manager.get_hub().await.unwrap();
    assert_eq!(host.listener_count(), 2);

    host.set_visible(true);
    settle().await;
    assert_eq!(factory.hub().calls_to(PROBE).len(), 1);
}

#[tokio::test]
async fn unbound_host_is_not_reattached_on_connect() {
    let (_factory, manager, host) = bound().await;
    manager.unbind_host();
    manager.disconnect().await;

    manager.get_hub().await.unwrap();
    assert_eq!(host.listener_count(), 0);
}

#[tokio::test]
async fn disconnect_during_health_check_abandons_revalidation() {
    let (factory, manager, host) = bound().await;
    let hub = factory.hub();
    hub.delay(PROBE, Duration::from_millis(100));
    hub.queue(PROBE, Err(RpcError::Server("stale socket".into())));
    let global = refresher(&hub, "global", false);
    manager.register_refresher(weak(&global));

    host.set_visible(true);
    sleep(Duration::from_millis(40)).await;
    assert_eq!(hub.calls_to(PROBE).len(), 1);

    manager.disconnect().await;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(factory.transport().unwrap().force_reconnect_count(), 0);
    assert_eq!(hub.resubscribe_count(), 0);
    assert_eq!(global.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disconnect_during_slow_health_check_skips_refresh() {
    let (factory, manager, host) = bound().await;
    let hub = factory.hub();
    hub.delay(PROBE, Duration::from_millis(100));
    let global = refresher(&hub, "global", false);
    manager.register_refresher(weak(&global));

    host.set_visible(true);
    sleep(Duration::from_millis(40)).await;
    manager.disconnect().await;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(hub.resubscribe_count(), 0);
    assert_eq!(global.calls.load(Ordering::SeqCst), 0);
}
