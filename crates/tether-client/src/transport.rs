use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_types::ConnectionState;
use tokio::sync::broadcast;

use crate::error::{RpcError, SubscriptionError, TransportError};

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A connection-state change reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub state: ConnectionState,
    pub error: Option<String>,
}

impl TransportEvent {
    pub fn new(state: ConnectionState) -> Self {
        Self { state, error: None }
    }

    pub fn with_error(state: ConnectionState, error: impl Into<String>) -> Self {
        Self {
            state,
            error: Some(error.into()),
        }
    }
}

/// The physical socket. Owns framing, heartbeats and its own backoff.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(&self) -> Result<(), TransportError>;

    fn is_ready(&self) -> bool;

    async fn close(&self);

    async fn force_reconnect(&self) -> Result<(), TransportError>;

    /// Clears reconnect attempt counters so the next retry starts from the
    /// shortest delay.
    fn reset_reconnect_state(&self);

    fn subscribe_state(&self) -> broadcast::Receiver<TransportEvent>;
}

// ---------------------------------------------------------------------------
// Hub trait
// ---------------------------------------------------------------------------

pub type PushHandler = Arc<dyn Fn(Value) + Send + Sync>;

type UnsubscribeFn = Box<dyn FnOnce() -> Result<(), SubscriptionError> + Send>;

/// Live server-side subscription. Dropping it unsubscribes; call
/// [`Subscription::unsubscribe`] to observe failures.
pub struct Subscription {
    channel: String,
    unsubscribe: Option<UnsubscribeFn>,
}

impl Subscription {
    pub fn new<F>(channel: impl Into<String>, unsubscribe: F) -> Self
    where
        F: FnOnce() -> Result<(), SubscriptionError> + Send + 'static,
    {
        Self {
            channel: channel.into(),
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn noop(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            unsubscribe: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(mut self) -> Result<(), SubscriptionError> {
        match self.unsubscribe.take() {
            Some(unsubscribe) => unsubscribe(),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            if let Err(error) = unsubscribe() {
                tracing::warn!(channel = %self.channel, %error, "unsubscribe on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Logical RPC and push multiplexer layered over a [`Transport`].
#[async_trait]
pub trait Hub: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn call(&self, channel: &str, params: Value, timeout: Duration)
        -> Result<Value, RpcError>;

    async fn subscribe(
        &self,
        channel: &str,
        params: Value,
        handler: PushHandler,
    ) -> Result<Subscription, SubscriptionError>;

    /// Registers locally and returns at once; the server-side subscribe is
    /// sent in the background and replayed after reconnects.
    fn subscribe_optimistic(&self, channel: &str, params: Value, handler: PushHandler)
        -> Subscription;

    /// Re-sends every live subscription on the current socket.
    async fn force_resubscribe(&self) -> Result<(), SubscriptionError>;
}

/// Builds a hub and the transport it is attached to.
pub trait HubFactory: Send + Sync {
    fn create(&self) -> (Arc<dyn Hub>, Arc<dyn Transport>);
}
