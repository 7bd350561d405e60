//! Connection lifecycle: one shared channel handle, event-driven waits and
//! resume revalidation.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_config::ClientConfig;
use tether_types::ConnectionState;
use tether_util::{duration_ms, with_timeout, CancellableTimer, Defer};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::ConnectionError;
use crate::handle::ChannelHandle;
use crate::handlers::{self, ConnectedHandlers, HandlerRegistration};
use crate::refresh::{self, Refresh, RefresherId, RefresherRegistry};
use crate::transport::{HubFactory, Transport, TransportEvent};
use crate::visibility::{HostBinding, HostEnvironment, HostEvent, HostListener};

type ConnectFuture = Shared<BoxFuture<'static, Result<ChannelHandle, ConnectionError>>>;

const TRANSITION_CAPACITY: usize = 64;

struct PendingConnection {
    generation: u64,
    future: ConnectFuture,
    task: AbortHandle,
}

struct Inner {
    factory: Arc<dyn HubFactory>,
    config: ClientConfig,
    /// Bumped by every connect attempt and every `disconnect()`. Work
    /// tagged with an older value is stale.
    generation: AtomicU64,
    next_handle_id: AtomicU64,
    handle: Mutex<Option<ChannelHandle>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    pending: Mutex<Option<PendingConnection>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    handlers: Arc<Mutex<ConnectedHandlers>>,
    refreshers: Mutex<RefresherRegistry>,
    /// Host to revalidate against; stays set across `disconnect()`.
    host: Mutex<Option<Arc<dyn HostEnvironment>>>,
    host_binding: Mutex<Option<HostBinding>>,
    revalidation: CancellableTimer,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.revalidation.cancel();
        if let Some(pending) = self.pending.get_mut().take() {
            pending.task.abort();
        }
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
        if let Some(binding) = self.host_binding.get_mut().take() {
            binding.unbind();
        }
    }
}

/// Owns the transport and hands out the single shared [`ChannelHandle`].
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn HubFactory>, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                factory,
                config,
                generation: AtomicU64::new(0),
                next_handle_id: AtomicU64::new(0),
                handle: Mutex::new(None),
                transport: Mutex::new(None),
                pending: Mutex::new(None),
                listener: Mutex::new(None),
                handlers: Arc::new(Mutex::new(ConnectedHandlers::default())),
                refreshers: Mutex::new(RefresherRegistry::default()),
                host: Mutex::new(None),
                host_binding: Mutex::new(None),
                revalidation: CancellableTimer::new(),
                state,
                transitions,
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // State observation
    // ------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Every distinct transition, in order. Unlike [`Self::watch_state`]
    /// intermediate states are never coalesced away (unless the receiver
    /// lags).
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn pending_handlers(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "connection state changed");
            let _ = self.inner.transitions.send(next);
        }
    }

    fn record_error(&self, error: Option<String>) {
        *self.inner.last_error.lock() = error;
    }

    // ------------------------------------------------------------------
    // Handle accessors
    // ------------------------------------------------------------------

    /// Never blocks. `Some` only when the transport is ready and the hub
    /// reports connected.
    pub fn get_hub_if_connected(&self) -> Option<ChannelHandle> {
        self.inner
            .handle
            .lock()
            .as_ref()
            .filter(|handle| handle.is_usable())
            .cloned()
    }

    pub fn get_hub_or_err(&self) -> Result<ChannelHandle, ConnectionError> {
        self.get_hub_if_connected().ok_or(ConnectionError::NotReady)
    }

    /// Returns the connected handle, joining or starting the connect
    /// attempt as needed. Concurrent callers share one attempt.
    pub async fn get_hub(&self) -> Result<ChannelHandle, ConnectionError> {
        if let Some(handle) = self.get_hub_if_connected() {
            return Ok(handle);
        }

        let installed = self.inner.handle.lock().is_some();
        if installed {
            // Transport is recovering on its own; wait for it instead of
            // opening a second socket.
            if self.state() == ConnectionState::Failed {
                return Err(ConnectionError::NotReady);
            }
            self.on_connected(self.inner.config.connect_timeout())
                .await?;
            return self.get_hub_or_err();
        }

        let future = self.pending_or_start();
        future.await
    }

    fn pending_or_start(&self) -> ConnectFuture {
        let mut pending = self.inner.pending.lock();
        if let Some(existing) = pending.as_ref() {
            return existing.future.clone();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.connect(generation).await });
        let abort = task.abort_handle();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(error) if error.is_cancelled() => Err(ConnectionError::Closed),
                Err(error) => Err(ConnectionError::Transport(format!(
                    "connect task failed: {error}"
                ))),
            }
        }
        .boxed()
        .shared();

        *pending = Some(PendingConnection {
            generation,
            future: future.clone(),
            task: abort,
        });
        future
    }

    async fn connect(&self, generation: u64) -> Result<ChannelHandle, ConnectionError> {
        let result = self.establish(generation).await;
        if let Err(error) = &result {
            tracing::error!(%error, "connection attempt failed");
            if self.is_current(generation) {
                self.record_error(Some(error.to_string()));
                self.set_state(ConnectionState::Error);
            }
            let mut pending = self.inner.pending.lock();
            if pending
                .as_ref()
                .is_some_and(|p| p.generation == generation)
            {
                *pending = None;
            }
        }
        result
    }

    async fn establish(&self, generation: u64) -> Result<ChannelHandle, ConnectionError> {
        let (hub, transport) = self.inner.factory.create();
        let mut events = transport.subscribe_state();
        *self.inner.transport.lock() = Some(Arc::clone(&transport));
        self.spawn_listener(transport.subscribe_state(), generation);
        self.set_state(ConnectionState::Connecting);
        tracing::info!(attempt = generation, "connecting");

        if let Err(error) = transport.initialize().await {
            self.abandon(generation, &transport).await;
            return Err(error.into());
        }

        let timeout = self.inner.config.connect_timeout();
        let wait = async {
            if transport.is_ready() && hub.is_connected() {
                return Ok(());
            }
            loop {
                match events.recv().await {
                    Ok(TransportEvent { state, .. }) => match state {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Error | ConnectionState::Failed => {
                            return Err(ConnectionError::NotReady)
                        }
                        _ => {}
                    },
                    Err(RecvError::Lagged(_)) => {
                        if transport.is_ready() && hub.is_connected() {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => return Err(ConnectionError::Closed),
                }
            }
        };

        let outcome = with_timeout(timeout, wait).await.unwrap_or(Err(
            ConnectionError::Timeout {
                timeout_ms: duration_ms(timeout),
            },
        ));
        if let Err(error) = outcome {
            self.abandon(generation, &transport).await;
            return Err(error);
        }
        if !self.is_current(generation) {
            transport.close().await;
            return Err(ConnectionError::Closed);
        }

        let id = self.inner.next_handle_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ChannelHandle::new(id, hub, transport);
        *self.inner.handle.lock() = Some(handle.clone());
        self.record_error(None);
        self.set_state(ConnectionState::Connected);
        tracing::info!(handle_id = id, "connected");
        self.attach_host_listeners();
        self.fire_connected_handlers();
        Ok(handle)
    }

    /// Tears down a transport whose connect attempt failed.
    async fn abandon(&self, generation: u64, transport: &Arc<dyn Transport>) {
        if self.is_current(generation) {
            if let Some(listener) = self.inner.listener.lock().take() {
                listener.abort();
            }
            let mut slot = self.inner.transport.lock();
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, transport))
            {
                *slot = None;
            }
        }
        transport.close().await;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn spawn_listener(&self, mut events: broadcast::Receiver<TransportEvent>, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "transport state listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = ConnectionManager { inner };
                if !manager.is_current(generation) {
                    break;
                }
                manager.apply_transport_event(event);
            }
        });
        if let Some(previous) = self.inner.listener.lock().replace(task) {
            previous.abort();
        }
    }

    fn apply_transport_event(&self, event: TransportEvent) {
        if let Some(error) = &event.error {
            tracing::warn!(state = %event.state, %error, "transport reported error");
            self.record_error(Some(error.clone()));
        }

        match event.state {
            ConnectionState::Connected => {
                // Until a handle is installed, `establish` owns the
                // transition into `connected`.
                if self.inner.handle.lock().is_none() {
                    return;
                }
                self.record_error(None);
                self.set_state(ConnectionState::Connected);
                self.fire_connected_handlers();
            }
            state => self.set_state(state),
        }
    }

    fn fire_connected_handlers(&self) {
        let drained = self.inner.handlers.lock().drain();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "firing connected handlers");
            handlers::fire(drained);
        }
    }

    // ------------------------------------------------------------------
    // Connected notifications
    // ------------------------------------------------------------------

    /// Resolves once connected. Never polls; the handler it parks is
    /// removed whether it fires, times out or the caller is dropped.
    pub async fn on_connected(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut handlers = self.inner.handlers.lock();
            if self.get_hub_if_connected().is_some() {
                return Ok(());
            }
            handlers.register(Box::new(move || {
                let _ = tx.send(());
            }))
        };

        let registry = Arc::clone(&self.inner.handlers);
        let _cleanup = Defer::new(move || {
            registry.lock().remove(id);
        });

        match with_timeout(timeout, rx).await {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(ConnectionError::Closed),
            None => {
                tracing::debug!(timeout_ms = duration_ms(timeout), "on_connected timed out");
                Err(ConnectionError::Timeout {
                    timeout_ms: duration_ms(timeout),
                })
            }
        }
    }

    /// Runs `callback` now if connected, otherwise exactly once on the next
    /// transition into `connected`.
    pub fn once_connected<F>(&self, callback: F) -> HandlerRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handlers = self.inner.handlers.lock();
        if self.get_hub_if_connected().is_some() {
            drop(handlers);
            callback();
            return HandlerRegistration::fired();
        }
        let id = handlers.register(Box::new(callback));
        HandlerRegistration::new(&self.inner.handlers, id)
    }

    // ------------------------------------------------------------------
    // Teardown and reconnect
    // ------------------------------------------------------------------

    /// Idempotent.
    pub async fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.revalidation.cancel();
        self.detach_host_listeners();

        if let Some(pending) = self.inner.pending.lock().take() {
            pending.task.abort();
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        let had_handle = self.inner.handle.lock().take().is_some();
        let transport = self.inner.transport.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.inner.handlers.lock().clear();
        self.record_error(None);
        self.set_state(ConnectionState::Disconnected);
        if had_handle {
            tracing::info!("disconnected");
        }
    }

    /// Manual retry. Resets backoff, then either kicks the existing
    /// transport or connects from scratch.
    pub async fn reconnect(&self) -> Result<ChannelHandle, ConnectionError> {
        let transport = self.inner.transport.lock().clone();
        if let Some(transport) = &transport {
            transport.reset_reconnect_state();
        }

        let installed = self.inner.handle.lock().is_some();
        match transport {
            Some(transport) if installed => {
                tracing::info!("forcing reconnect");
                self.set_state(ConnectionState::Reconnecting);
                transport.force_reconnect().await?;
                self.on_connected(self.inner.config.connect_timeout())
                    .await?;
                self.get_hub_or_err()
            }
            _ => self.get_hub().await,
        }
    }

    // ------------------------------------------------------------------
    // Resume revalidation
    // ------------------------------------------------------------------

    pub fn register_refresher(&self, refresher: Weak<dyn Refresh>) -> RefresherId {
        self.inner.refreshers.lock().register(refresher)
    }

    pub fn unregister_refresher(&self, id: RefresherId) -> bool {
        self.inner.refreshers.lock().unregister(id)
    }

    /// Refreshes every registered target concurrently. Returns how many
    /// failed.
    pub async fn refresh_registered(&self) -> usize {
        let live = self.inner.refreshers.lock().live();
        refresh::refresh_all(live).await
    }

    /// Installs the visibility-change and page-hide listeners, replacing
    /// any previous host. The listeners are removed by `disconnect()` and
    /// installed again on the next successful connect.
    pub fn bind_host(&self, host: Arc<dyn HostEnvironment>) {
        self.detach_host_listeners();
        *self.inner.host.lock() = Some(host);
        self.attach_host_listeners();
    }

    pub fn unbind_host(&self) {
        self.inner.host.lock().take();
        self.detach_host_listeners();
    }

    fn attach_host_listeners(&self) {
        let Some(host) = self.inner.host.lock().clone() else {
            return;
        };
        let mut slot = self.inner.host_binding.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let listener: HostListener = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.handle_host_event(event);
            }
        });
        *slot = Some(HostBinding::bind(host, listener));
    }

    fn detach_host_listeners(&self) {
        let binding = self.inner.host_binding.lock().take();
        if let Some(binding) = binding {
            binding.unbind();
        }
    }

    fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::VisibilityChange { visible: true } => {
                let weak = Arc::downgrade(&self.inner);
                self.inner
                    .revalidation
                    .start(self.inner.config.visibility_debounce(), move || async move {
                        if let Some(inner) = weak.upgrade() {
                            ConnectionManager { inner }.revalidate().await;
                        }
                    });
            }
            HostEvent::VisibilityChange { visible: false } | HostEvent::PageHide => {
                if self.inner.revalidation.cancel() {
                    tracing::debug!("pending revalidation cancelled");
                }
            }
        }
    }

    /// Checks that the channel survived a suspension: reset backoff, probe,
    /// resubscribe, then refresh registered state. A failed probe forces a
    /// transport reconnect instead. Abandoned as soon as a `disconnect()` or
    /// new connect attempt supersedes it.
    pub async fn revalidate(&self) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let handle = self.inner.handle.lock().clone();
        let Some(handle) = handle else {
            tracing::debug!("no channel to revalidate, reconnecting");
            if let Err(error) = self.reconnect().await {
                tracing::warn!(%error, "reconnect after resume failed");
            }
            return;
        };

        handle.transport().reset_reconnect_state();

        let method = self.inner.config.health_probe_method().to_string();
        let timeout = self.inner.config.probe_timeout();
        let probe = with_timeout(timeout, handle.call_value(&method, Value::Null, timeout)).await;
        let healthy = match probe {
            Some(Ok(_)) => true,
            Some(Err(error)) => {
                tracing::warn!(%error, method = %method, "health probe failed");
                false
            }
            None => {
                tracing::warn!(timeout_ms = duration_ms(timeout), method = %method, "health probe timed out");
                false
            }
        };
        if !self.is_current(generation) {
            tracing::debug!("connection replaced during probe, revalidation abandoned");
            return;
        }

        if !healthy {
            self.set_state(ConnectionState::Reconnecting);
            if let Err(error) = handle.transport().force_reconnect().await {
                tracing::warn!(%error, "forced reconnect failed");
            }
            return;
        }

        if let Err(error) = handle.hub().force_resubscribe().await {
            tracing::warn!(%error, "resubscribe after resume failed");
        }
        if !self.is_current(generation) {
            return;
        }
        let failures = self.refresh_registered().await;
        tracing::debug!(failures, "revalidation complete");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("handle", &*self.inner.handle.lock())
            .finish()
    }
}
