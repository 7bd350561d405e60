use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_VISIBILITY_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_SETTINGS_SAVE_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_RECENT_SESSIONS_LIMIT: usize = 5;
pub const DEFAULT_HEALTH_PROBE_METHOD: &str = "system.ping";

/// Client-side tuning. Every field is optional in the file; accessors fill
/// in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility_debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_save_debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_sessions_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_probe_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelNames>,
}

/// Server channel names. Overridable for daemons that namespace them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelNames {
    pub global: String,
    pub sessions_delta: String,
    pub system: String,
    pub settings: String,
    pub settings_update: String,
    pub session_archive: String,
    pub session_messages: String,
    pub session_messages_delta: String,
    pub session_send: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            global: "state.global".to_string(),
            sessions_delta: "state.sessions.delta".to_string(),
            system: "state.system".to_string(),
            settings: "state.settings".to_string(),
            settings_update: "settings.update".to_string(),
            session_archive: "session.archive".to_string(),
            session_messages: "state.session.messages".to_string(),
            session_messages_delta: "state.session.messages.delta".to_string(),
            session_send: "session.send".to_string(),
        }
    }
}

fn merge_option_replace<T>(target: &mut Option<T>, source: Option<T>) {
    if source.is_some() {
        *target = source;
    }
}

impl ClientConfig {
    pub fn merge(&mut self, other: ClientConfig) {
        merge_option_replace(&mut self.connect_timeout_ms, other.connect_timeout_ms);
        merge_option_replace(&mut self.probe_timeout_ms, other.probe_timeout_ms);
        merge_option_replace(&mut self.rpc_timeout_ms, other.rpc_timeout_ms);
        merge_option_replace(
            &mut self.visibility_debounce_ms,
            other.visibility_debounce_ms,
        );
        merge_option_replace(
            &mut self.settings_save_debounce_ms,
            other.settings_save_debounce_ms,
        );
        merge_option_replace(&mut self.recent_sessions_limit, other.recent_sessions_limit);
        merge_option_replace(&mut self.health_probe_method, other.health_probe_method);
        merge_option_replace(&mut self.log_level, other.log_level);
        merge_option_replace(&mut self.channels, other.channels);
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms.unwrap_or(DEFAULT_RPC_TIMEOUT_MS))
    }

    pub fn visibility_debounce(&self) -> Duration {
        Duration::from_millis(
            self.visibility_debounce_ms
                .unwrap_or(DEFAULT_VISIBILITY_DEBOUNCE_MS),
        )
    }

    pub fn settings_save_debounce(&self) -> Duration {
        Duration::from_millis(
            self.settings_save_debounce_ms
                .unwrap_or(DEFAULT_SETTINGS_SAVE_DEBOUNCE_MS),
        )
    }

    pub fn recent_sessions_limit(&self) -> usize {
        self.recent_sessions_limit
            .unwrap_or(DEFAULT_RECENT_SESSIONS_LIMIT)
    }

    pub fn health_probe_method(&self) -> &str {
        self.health_probe_method
            .as_deref()
            .unwrap_or(DEFAULT_HEALTH_PROBE_METHOD)
    }

    pub fn channels(&self) -> ChannelNames {
        self.channels.clone().unwrap_or_default()
    }
}
