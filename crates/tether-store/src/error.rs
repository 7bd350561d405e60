use tether_client::{ChannelError, ConnectionError, RpcError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Failed to encode request: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Encode(error.to_string())
    }
}
