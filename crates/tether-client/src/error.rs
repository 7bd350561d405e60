use thiserror::Error;

/// Failure to obtain a usable channel handle.
///
/// `Clone` because every caller joining a pending attempt receives the same
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection not ready")]
    NotReady,

    #[error("Timed out after {timeout_ms}ms waiting for connection")]
    Timeout { timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    Closed,
}

impl ConnectionError {
    /// Both `NotReady` and `Timeout` can be retried by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectionError::NotReady | ConnectionError::Timeout { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("Not connected")]
    NotConnected,

    #[error("Call to {channel} timed out after {timeout_ms}ms")]
    Timeout { channel: String, timeout_ms: u64 },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid response from {channel}: {message}")]
    InvalidResponse { channel: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Subscription to {channel} rejected: {message}")]
    Rejected { channel: String, message: String },

    #[error("Failed to unsubscribe from {channel}: {message}")]
    Unsubscribe { channel: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport initialization failed: {0}")]
    Init(String),

    #[error("Reconnect failed: {0}")]
    Reconnect(String),

    #[error("Transport closed")]
    Closed,
}

impl From<TransportError> for ConnectionError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Closed => ConnectionError::Closed,
            other => ConnectionError::Transport(other.to_string()),
        }
    }
}

/// Errors surfaced by [`crate::StateChannel`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_carries_duration() {
        let error = ConnectionError::Timeout { timeout_ms: 250 };
        assert_eq!(
            error.to_string(),
            "Timed out after 250ms waiting for connection"
        );
        assert!(error.is_recoverable());
        assert!(!ConnectionError::Transport("boom".into()).is_recoverable());
    }

    #[test]
    fn transport_close_maps_to_closed() {
        assert_eq!(
            ConnectionError::from(TransportError::Closed),
            ConnectionError::Closed
        );
        assert_eq!(
            ConnectionError::from(TransportError::Init("refused".into())),
            ConnectionError::Transport("Transport initialization failed: refused".into())
        );
    }
}
