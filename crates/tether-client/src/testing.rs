//! In-memory transport, hub and host for exercising the sync layer without
//! a daemon.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_types::ConnectionState;
use tokio::sync::broadcast;

use crate::error::{RpcError, SubscriptionError, TransportError};
use crate::transport::{Hub, HubFactory, PushHandler, Subscription, Transport, TransportEvent};
use crate::visibility::{HostEnvironment, HostEvent, HostEventKind, HostListener, ListenerId};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// What `initialize()` does once its delay has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Becomes ready and reports `connected`.
    Connect,
    /// Reports `error` and stays down.
    Error(String),
    /// Never reports anything.
    Hang,
    /// `initialize()` itself fails.
    FailInit(String),
}

pub struct MockTransport {
    ready: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    behavior: ConnectBehavior,
    delay: Duration,
    initialize_calls: AtomicUsize,
    close_calls: AtomicUsize,
    force_reconnect_calls: AtomicUsize,
    reset_calls: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new(behavior: ConnectBehavior, delay: Duration) -> Self {
        Self::with_log(behavior, delay, Arc::new(Mutex::new(Vec::new())))
    }

    fn with_log(behavior: ConnectBehavior, delay: Duration, log: Arc<Mutex<Vec<String>>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            ready: AtomicBool::new(false),
            events,
            behavior,
            delay,
            initialize_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            force_reconnect_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
            log,
        }
    }

    /// Reports `state`; readiness follows `connected`.
    pub fn emit(&self, state: ConnectionState) {
        self.ready
            .store(state == ConnectionState::Connected, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::new(state));
    }

    pub fn emit_error(&self, state: ConnectionState, error: &str) {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::with_error(state, error));
    }

    /// Simulates a drop and recovery of the socket.
    pub fn bounce(&self) {
        self.emit(ConnectionState::Reconnecting);
        self.emit(ConnectionState::Connected);
    }

    pub fn initialize_count(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn force_reconnect_count(&self) -> usize {
        self.force_reconnect_calls.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            ConnectBehavior::Connect => self.emit(ConnectionState::Connected),
            ConnectBehavior::Error(error) => self.emit_error(ConnectionState::Error, error),
            ConnectBehavior::Hang => {}
            ConnectBehavior::FailInit(error) => return Err(TransportError::Init(error.clone())),
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.emit(ConnectionState::Disconnected);
    }

    async fn force_reconnect(&self) -> Result<(), TransportError> {
        self.force_reconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("force_reconnect".to_string());
        self.bounce();
        Ok(())
    }

    fn reset_reconnect_state(&self) {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("reset_backoff".to_string());
    }

    fn subscribe_state(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// MockHub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub channel: String,
    pub params: Value,
}

struct MockSubscription {
    channel: String,
    handler: PushHandler,
}

/// Scripted hub. Its transport is swapped in by [`MockFactory`] on every
/// connect attempt, so scripts and recordings survive reconnects.
#[derive(Default)]
pub struct MockHub {
    transport: Mutex<Option<Arc<MockTransport>>>,
    defaults: Mutex<HashMap<String, Value>>,
    queued: Mutex<HashMap<String, VecDeque<Result<Value, RpcError>>>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    subscriptions: Arc<Mutex<BTreeMap<u64, MockSubscription>>>,
    next_subscription: AtomicU64,
    failing_unsubscribes: Arc<Mutex<HashSet<String>>>,
    resubscribe_calls: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, transport: Arc<MockTransport>) {
        *self.transport.lock() = Some(transport);
    }

    /// Response for every call to `channel` with no queued result.
    pub fn respond(&self, channel: &str, value: Value) {
        self.defaults.lock().insert(channel.to_string(), value);
    }

    /// One-off result for the next call to `channel`.
    pub fn queue(&self, channel: &str, result: Result<Value, RpcError>) {
        self.queued
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push_back(result);
    }

    /// Calls to `channel` take `delay` before answering.
    pub fn delay(&self, channel: &str, delay: Duration) {
        self.latency.lock().insert(channel.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, channel: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.channel == channel)
            .cloned()
            .collect()
    }

    /// Delivers a push to every subscriber of `channel`. Returns the number
    /// of handlers invoked.
    pub fn push(&self, channel: &str, value: Value) -> usize {
        let handlers: Vec<PushHandler> = self
            .subscriptions
            .lock()
            .values()
            .filter(|sub| sub.channel == channel)
            .map(|sub| Arc::clone(&sub.handler))
            .collect();
        for handler in &handlers {
            handler(value.clone());
        }
        handlers.len()
    }

    pub fn subscription_count(&self, channel: &str) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|sub| sub.channel == channel)
            .count()
    }

    /// Unsubscribing from `channel` will report an error (the local
    /// registration is still removed).
    pub fn fail_unsubscribe(&self, channel: &str) {
        self.failing_unsubscribes.lock().insert(channel.to_string());
    }

    pub fn resubscribe_count(&self) -> usize {
        self.resubscribe_calls.load(Ordering::SeqCst)
    }

    /// Ordered record of calls, resubscribes and transport resets.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Appends a test-defined entry to the ordered log.
    pub fn note(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }

    fn register(&self, channel: &str, handler: PushHandler) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscriptions.lock().insert(
            id,
            MockSubscription {
                channel: channel.to_string(),
                handler,
            },
        );

        let subscriptions = Arc::clone(&self.subscriptions);
        let failing = Arc::clone(&self.failing_unsubscribes);
        let name = channel.to_string();
        Subscription::new(channel, move || {
            subscriptions.lock().remove(&id);
            if failing.lock().contains(&name) {
                return Err(SubscriptionError::Unsubscribe {
                    channel: name,
                    message: "scripted failure".to_string(),
                });
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Hub for MockHub {
    fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .is_some_and(|transport| transport.is_ready())
    }

    async fn call(
        &self,
        channel: &str,
        params: Value,
        _timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.calls.lock().push(RecordedCall {
            channel: channel.to_string(),
            params,
        });
        self.log.lock().push(format!("call:{channel}"));
        let latency = self.latency.lock().get(channel).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self
            .queued
            .lock()
            .get_mut(channel)
            .and_then(|queue| queue.pop_front());
        if let Some(result) = queued {
            return result;
        }
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }
        self.defaults
            .lock()
            .get(channel)
            .cloned()
            .ok_or_else(|| RpcError::Server(format!("no response scripted for {channel}")))
    }

    async fn subscribe(
        &self,
        channel: &str,
        _params: Value,
        handler: PushHandler,
    ) -> Result<Subscription, SubscriptionError> {
        if !self.is_connected() {
            return Err(SubscriptionError::NotConnected);
        }
        Ok(self.register(channel, handler))
    }

    fn subscribe_optimistic(
        &self,
        channel: &str,
        _params: Value,
        handler: PushHandler,
    ) -> Subscription {
        self.register(channel, handler)
    }

    async fn force_resubscribe(&self) -> Result<(), SubscriptionError> {
        self.resubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("resubscribe".to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockFactory
// ---------------------------------------------------------------------------

/// Hands out one shared [`MockHub`] and a fresh [`MockTransport`] per
/// connect attempt.
pub struct MockFactory {
    hub: Arc<MockHub>,
    behavior: Mutex<ConnectBehavior>,
    delay: Duration,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::with_behavior(ConnectBehavior::Connect, Duration::ZERO)
    }

    pub fn with_behavior(behavior: ConnectBehavior, delay: Duration) -> Self {
        Self {
            hub: Arc::new(MockHub::new()),
            behavior: Mutex::new(behavior),
            delay,
            transports: Mutex::new(Vec::new()),
        }
    }

    /// Behavior for subsequent connect attempts.
    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn hub(&self) -> Arc<MockHub> {
        Arc::clone(&self.hub)
    }

    /// Transport of the most recent attempt.
    pub fn transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn connect_attempts(&self) -> usize {
        self.transports.lock().len()
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl HubFactory for MockFactory {
    fn create(&self) -> (Arc<dyn Hub>, Arc<dyn Transport>) {
        let behavior = self.behavior.lock().clone();
        let transport = Arc::new(MockTransport::with_log(
            behavior,
            self.delay,
            Arc::clone(&self.hub.log),
        ));
        self.hub.attach(Arc::clone(&transport));
        self.transports.lock().push(Arc::clone(&transport));
        let hub: Arc<dyn Hub> = self.hub.clone();
        let transport: Arc<dyn Transport> = transport;
        (hub, transport)
    }
}

// ---------------------------------------------------------------------------
// MockHost
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockHost {
    listeners: Mutex<Vec<(ListenerId, HostEventKind, HostListener)>>,
    next_id: AtomicU64,
    hidden: AtomicBool,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visible(&self, visible: bool) {
        self.hidden.store(!visible, Ordering::SeqCst);
        self.dispatch(HostEvent::VisibilityChange { visible });
    }

    pub fn page_hide(&self) {
        self.dispatch(HostEvent::PageHide);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn dispatch(&self, event: HostEvent) {
        let kind = event.kind();
        let targets: Vec<HostListener> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in targets {
            listener(event);
        }
    }
}

impl HostEnvironment for MockHost {
    fn add_listener(&self, kind: HostEventKind, listener: HostListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.listeners.lock().push((id, kind, listener));
        id
    }

    fn remove_listener(&self, kind: HostEventKind, id: ListenerId) {
        self.listeners
            .lock()
            .retain(|(existing, k, _)| !(*existing == id && *k == kind));
    }

    fn is_visible(&self) -> bool {
        !self.hidden.load(Ordering::SeqCst)
    }
}
