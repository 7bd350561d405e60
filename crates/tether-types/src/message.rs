use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SdkMessageKind {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    System,
    Result,
}

/// One entry of a session transcript as emitted by the agent SDK.
///
/// `uuid` is stable across replays and refetches; `timestamp` is the
/// daemon's clock in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdkMessage {
    pub uuid: String,
    pub session_id: String,
    pub timestamp: i64,
    pub kind: SdkMessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SdkMessage {
    pub fn new(
        session_id: impl Into<String>,
        kind: SdkMessageKind,
        timestamp: i64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            timestamp,
            kind,
            payload,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(|v| v.as_str())
    }
}
