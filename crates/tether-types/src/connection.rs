use serde::{Deserialize, Serialize};

/// Health of the link to the daemon, as seen by the UI.
///
/// `Failed` is terminal until a manual reconnect is issued. Every other state
/// can follow any other one as transport events arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States that usually heal on their own inside the transport backoff
    /// window and must not interrupt the user.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Reconnecting
                | ConnectionState::Disconnected
                | ConnectionState::Error
        )
    }

    pub fn requires_user_action(self) -> bool {
        matches!(self, ConnectionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
