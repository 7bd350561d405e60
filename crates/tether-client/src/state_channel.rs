//! Snapshot-plus-delta mirror of one server collection.
//!
//! A snapshot is fetched on `start()` and again after every reconnect; deltas
//! arriving in between are forwarded as they come. Snapshot requests never
//! carry a `since` cursor.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_types::{ConnectionState, Snapshot};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::error::ChannelError;
use crate::handle::ChannelHandle;
use crate::manager::ConnectionManager;
use crate::transport::{PushHandler, Subscription};

pub type SnapshotHandler<S> = Arc<dyn Fn(Snapshot<S>) + Send + Sync>;
pub type DeltaHandler<D> = Arc<dyn Fn(D) + Send + Sync>;

const CURSOR_PARAM: &str = "since";

#[derive(Debug, Clone)]
pub struct StateChannelOptions {
    pub channel: String,
    pub delta_channel: Option<String>,
    pub params: Value,
    pub timeout: Duration,
}

impl StateChannelOptions {
    pub fn new(channel: impl Into<String>, timeout: Duration) -> Self {
        Self {
            channel: channel.into(),
            delta_channel: None,
            params: Value::Object(Default::default()),
            timeout,
        }
    }

    pub fn with_delta_channel(mut self, channel: impl Into<String>) -> Self {
        self.delta_channel = Some(channel.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Default)]
struct ChannelState {
    running: bool,
    /// Delta subscription plus the id of the handle it was made on.
    subscription: Option<(u64, Subscription)>,
    watcher: Option<JoinHandle<()>>,
    last_sync: Option<i64>,
}

struct Shared<S, D> {
    manager: ConnectionManager,
    options: StateChannelOptions,
    on_snapshot: SnapshotHandler<S>,
    on_delta: DeltaHandler<D>,
    state: Mutex<ChannelState>,
    _marker: PhantomData<fn() -> (S, D)>,
}

pub struct StateChannel<S, D> {
    shared: Arc<Shared<S, D>>,
}

impl<S, D> StateChannel<S, D>
where
    S: DeserializeOwned + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    pub fn new(
        manager: ConnectionManager,
        options: StateChannelOptions,
        on_snapshot: SnapshotHandler<S>,
        on_delta: DeltaHandler<D>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                options,
                on_snapshot,
                on_delta,
                state: Mutex::new(ChannelState::default()),
                _marker: PhantomData,
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.shared.options.channel
    }

    /// Fetches the initial snapshot, subscribes to deltas and starts
    /// watching for reconnects. Calling it on a running channel is a no-op.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.is_running() {
            return Ok(());
        }
        let handle = self.shared.manager.get_hub().await?;
        // Subscribed before the first fetch so a reconnect during it is seen.
        let transitions = self.shared.manager.subscribe_transitions();
        self.shared.sync(&handle).await?;

        let watcher = spawn_reconnect_watcher(&self.shared, transitions);
        let mut state = self.shared.state.lock();
        state.running = true;
        if let Some(previous) = state.watcher.replace(watcher) {
            previous.abort();
        }
        tracing::debug!(channel = %self.shared.options.channel, "state channel started");
        Ok(())
    }

    /// Full refetch, same as after a reconnect. Does nothing unless started.
    pub async fn refresh(&self) -> Result<(), ChannelError> {
        if !self.is_running() {
            return Ok(());
        }
        let handle = self.shared.manager.get_hub_or_err()?;
        self.shared.sync(&handle).await
    }

    /// Releases the delta subscription and the reconnect watcher.
    /// Idempotent.
    pub fn stop(&self) -> Result<(), ChannelError> {
        let (subscription, watcher) = {
            let mut state = self.shared.state.lock();
            state.running = false;
            (state.subscription.take(), state.watcher.take())
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        match subscription {
            Some((_, subscription)) => subscription.unsubscribe().map_err(ChannelError::from),
            None => Ok(()),
        }
    }

    /// Server timestamp of the last applied snapshot.
    pub fn last_sync(&self) -> Option<i64> {
        self.shared.state.lock().last_sync
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

impl<S, D> Drop for StateChannel<S, D> {
    fn drop(&mut self) {
        if let Some(watcher) = self.shared.state.lock().watcher.take() {
            watcher.abort();
        }
    }
}

impl<S, D> Shared<S, D>
where
    S: DeserializeOwned + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    fn snapshot_params(&self) -> Value {
        let mut params = self.options.params.clone();
        if let Value::Object(map) = &mut params {
            map.remove(CURSOR_PARAM);
        }
        params
    }

    /// Snapshot first, then make sure deltas flow from `handle`.
    async fn sync(&self, handle: &ChannelHandle) -> Result<(), ChannelError> {
        let snapshot: Snapshot<S> = handle
            .call(
                &self.options.channel,
                self.snapshot_params(),
                self.options.timeout,
            )
            .await?;
        let timestamp = snapshot.timestamp;
        (self.on_snapshot)(snapshot);
        self.state.lock().last_sync = Some(timestamp);
        tracing::debug!(channel = %self.options.channel, timestamp, "snapshot applied");

        self.ensure_subscribed(handle).await
    }

    async fn ensure_subscribed(&self, handle: &ChannelHandle) -> Result<(), ChannelError> {
        let Some(delta_channel) = &self.options.delta_channel else {
            return Ok(());
        };
        let current = self
            .state
            .lock()
            .subscription
            .as_ref()
            .is_some_and(|(id, _)| *id == handle.id());
        if current {
            return Ok(());
        }

        let on_delta = Arc::clone(&self.on_delta);
        let channel = delta_channel.clone();
        let handler: PushHandler = Arc::new(move |value: Value| {
            match serde_json::from_value::<D>(value) {
                Ok(delta) => on_delta(delta),
                Err(error) => {
                    tracing::warn!(channel = %channel, %error, "dropping malformed delta")
                }
            }
        });
        let subscription = handle
            .hub()
            .subscribe(delta_channel, self.options.params.clone(), handler)
            .await?;

        let previous = self
            .state
            .lock()
            .subscription
            .replace((handle.id(), subscription));
        if let Some((_, previous)) = previous {
            if let Err(error) = previous.unsubscribe() {
                tracing::debug!(channel = %delta_channel, %error, "stale delta subscription");
            }
        }
        Ok(())
    }

    async fn refetch_after_reconnect(&self) {
        let Some(handle) = self.manager.get_hub_if_connected() else {
            return;
        };
        tracing::debug!(channel = %self.options.channel, "refetching after reconnect");
        if let Err(error) = self.sync(&handle).await {
            tracing::warn!(channel = %self.options.channel, %error, "refetch after reconnect failed");
        }
    }
}

fn spawn_reconnect_watcher<S, D>(
    shared: &Arc<Shared<S, D>>,
    mut transitions: broadcast::Receiver<ConnectionState>,
) -> JoinHandle<()>
where
    S: DeserializeOwned + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    let weak: Weak<Shared<S, D>> = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            let resync = match transitions.recv().await {
                // Transitions are deduplicated, so any `connected` seen here
                // follows some other state.
                Ok(ConnectionState::Connected) => true,
                Ok(_) => false,
                Err(RecvError::Lagged(_)) => true,
                Err(RecvError::Closed) => break,
            };
            if !resync {
                continue;
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };
            shared.refetch_after_reconnect().await;
        }
    })
}
