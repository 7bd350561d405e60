use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_client::testing::MockFactory;
use tether_client::{
    ChannelError, ConnectionManager, RpcError, StateChannel, StateChannelOptions,
};
use tether_config::ClientConfig;
use tether_types::{Delta, GlobalSnapshot, Session, Snapshot};
use tokio::time::sleep;

const GLOBAL: &str = "state.global";
const SESSIONS_DELTA: &str = "state.sessions.delta";

struct Recorder {
    snapshots: Mutex<Vec<i64>>,
    deltas: Mutex<Vec<Delta<Session>>>,
}

fn recorder() -> Arc<Recorder> {
    Arc::new(Recorder {
        snapshots: Mutex::new(Vec::new()),
        deltas: Mutex::new(Vec::new()),
    })
}

fn global_channel(
    manager: &ConnectionManager,
    recorder: &Arc<Recorder>,
    params: serde_json::Value,
) -> StateChannel<GlobalSnapshot, Delta<Session>> {
    let on_snapshot = Arc::clone(recorder);
    let on_delta = Arc::clone(recorder);
    StateChannel::new(
        manager.clone(),
        StateChannelOptions::new(GLOBAL, Duration::from_secs(1))
            .with_delta_channel(SESSIONS_DELTA)
            .with_params(params),
        Arc::new(move |snapshot: Snapshot<GlobalSnapshot>| {
            on_snapshot.snapshots.lock().push(snapshot.timestamp)
        }),
        Arc::new(move |delta: Delta<Session>| on_delta.deltas.lock().push(delta)),
    )
}

async fn connected() -> (Arc<MockFactory>, ConnectionManager) {
    let factory = Arc::new(MockFactory::new());
    factory
        .hub()
        .respond(GLOBAL, json!({ "timestamp": 1000, "sessions": [] }));
    let manager = ConnectionManager::new(factory.clone(), ClientConfig::default());
    manager.get_hub().await.unwrap();
    (factory, manager)
}

async fn settle() {
    sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn start_fetches_snapshot_without_cursor_and_subscribes() {
    let (factory, manager) = connected().await;
    let hub = factory.hub();
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({ "since": 99, "scope": "all" }));

    channel.start().await.unwrap();

    let calls = hub.calls_to(GLOBAL);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params, json!({ "scope": "all" }));
    assert_eq!(channel.last_sync(), Some(1000));
    assert!(channel.is_running());
    assert_eq!(hub.subscription_count(SESSIONS_DELTA), 1);
    assert_eq!(*recorder.snapshots.lock(), vec![1000]);

    channel.start().await.unwrap();
    assert_eq!(hub.calls_to(GLOBAL).len(), 1);
}

#[tokio::test]
async fn pushed_deltas_are_forwarded_in_order() {
    let (factory, manager) = connected().await;
    let hub = factory.hub();
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({}));
    channel.start().await.unwrap();

    hub.push(SESSIONS_DELTA, json!({ "removed": ["a"] }));
    hub.push(SESSIONS_DELTA, json!({ "removed": ["b"] }));
    hub.push(SESSIONS_DELTA, json!({ "removed": 42 }));

    let deltas = recorder.deltas.lock();
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0].removed, vec!["a".to_string()]);
    assert_eq!(deltas[1].removed, vec!["b".to_string()]);
}

#[tokio::test]
async fn reconnect_triggers_full_refetch_without_cursor() {
    let (factory, manager) = connected().await;
    let hub = factory.hub();
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({}));
    channel.start().await.unwrap();

    hub.respond(GLOBAL, json!({ "timestamp": 2000, "sessions": [] }));
    factory.transport().unwrap().bounce();
    settle().await;

    let calls = hub.calls_to(GLOBAL);
    assert_eq!(calls.len(), 2);
    assert!(calls
        .iter()
        .all(|call| call.params.get("since").is_none()));
    assert_eq!(channel.last_sync(), Some(2000));
    assert_eq!(hub.subscription_count(SESSIONS_DELTA), 1);
}

#[tokio::test]
async fn new_connection_moves_delta_subscription() {
    let (factory, manager) = connected().await;
    let hub = factory.hub();
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({}));
    channel.start().await.unwrap();

    manager.disconnect().await;
    manager.get_hub().await.unwrap();
    settle().await;

    assert_eq!(hub.calls_to(GLOBAL).len(), 2);
    assert_eq!(hub.subscription_count(SESSIONS_DELTA), 1);
}

#[tokio::test]
async fn failed_snapshot_propagates_without_retry() {
    let (factory, manager) = connected().await;
    let hub = factory.hub();
    hub.queue(GLOBAL, Err(RpcError::Server("snapshot unavailable".into())));
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({}));

    let error = channel.start().await.unwrap_err();
    assert_eq!(
        error,
        ChannelError::Rpc(RpcError::Server("snapshot unavailable".into()))
    );
    assert!(!channel.is_running());
    assert_eq!(hub.calls_to(GLOBAL).len(), 1);
    assert_eq!(channel.last_sync(), None);
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_subscription() {
    let (factory, manager) = connected().await;
    let hub = factory.hub();
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({}));
    channel.start().await.unwrap();

    channel.stop().unwrap();
    channel.stop().unwrap();
    assert!(!channel.is_running());
    assert_eq!(hub.subscription_count(SESSIONS_DELTA), 0);
    assert_eq!(hub.push(SESSIONS_DELTA, json!({})), 0);

    factory.transport().unwrap().bounce();
    settle().await;
    assert_eq!(hub.calls_to(GLOBAL).len(), 1);
}

#[tokio::test]
async fn refresh_before_start_makes_no_calls() {
    let (factory, manager) = connected().await;
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({}));

    channel.refresh().await.unwrap();
    assert!(factory.hub().calls_to(GLOBAL).is_empty());

    channel.start().await.unwrap();
    channel.refresh().await.unwrap();
    assert_eq!(factory.hub().calls_to(GLOBAL).len(), 2);
}

#[tokio::test]
async fn reconnect_during_initial_snapshot_triggers_refetch() {
    let (factory, manager) = connected().await;
    let hub = factory.hub();
    hub.delay(GLOBAL, Duration::from_millis(50));
    let transport = factory.transport().unwrap();
    let recorder = recorder();
    let channel = global_channel(&manager, &recorder, json!({}));

    let (started, ()) = tokio::join!(channel.start(), async {
        sleep(Duration::from_millis(10)).await;
        transport.bounce();
    });
    started.unwrap();
    sleep(Duration::from_millis(150)).await;

    assert_eq!(hub.calls_to(GLOBAL).len(), 2);
    assert_eq!(recorder.snapshots.lock().len(), 2);
}
