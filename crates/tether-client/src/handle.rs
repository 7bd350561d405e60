use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RpcError;
use crate::transport::{Hub, Transport};

/// The single live channel to the daemon. Cloning shares the same
/// underlying hub; two handles are equal only if they come from the same
/// connect attempt.
#[derive(Clone)]
pub struct ChannelHandle {
    id: u64,
    hub: Arc<dyn Hub>,
    transport: Arc<dyn Transport>,
}

impl ChannelHandle {
    pub(crate) fn new(id: u64, hub: Arc<dyn Hub>, transport: Arc<dyn Transport>) -> Self {
        Self { id, hub, transport }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hub(&self) -> &Arc<dyn Hub> {
        &self.hub
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Transport ready and logical channel acknowledged.
    pub fn is_usable(&self) -> bool {
        self.transport.is_ready() && self.hub.is_connected()
    }

    pub async fn call_value(
        &self,
        channel: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.hub.call(channel, params, timeout).await
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        channel: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T, RpcError> {
        let value = self.hub.call(channel, params, timeout).await?;
        serde_json::from_value(value).map_err(|e| RpcError::InvalidResponse {
            channel: channel.to_string(),
            message: e.to_string(),
        })
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.hub, &other.hub)
    }
}

impl Eq for ChannelHandle {}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("ready", &self.transport.is_ready())
            .field("connected", &self.hub.is_connected())
            .finish()
    }
}
