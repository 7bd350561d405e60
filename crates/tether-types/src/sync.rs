use serde::{Deserialize, Serialize};

use crate::message::SdkMessage;
use crate::session::Session;
use crate::settings::Settings;
use crate::system::SystemStatus;

/// A keyed entity that can receive partial updates from a [`Delta`].
pub trait Entity: Clone {
    type Patch: Clone + std::fmt::Debug;

    fn key(&self) -> &str;

    fn patch_key(patch: &Self::Patch) -> &str;

    fn apply_patch(&mut self, patch: &Self::Patch);
}

/// Full point-in-time materialization of a collection.
///
/// `timestamp` comes from the daemon and is the only value ever used as a
/// sync cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot<T> {
    pub timestamp: i64,
    #[serde(flatten)]
    pub data: T,
}

/// Incremental change set. Applied remove, then update, then add.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "E: Serialize, E::Patch: Serialize",
    deserialize = "E: Deserialize<'de>, E::Patch: Deserialize<'de>"
))]
pub struct Delta<E: Entity> {
    #[serde(default)]
    pub added: Vec<E>,
    #[serde(default)]
    pub updated: Vec<E::Patch>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl<E: Entity> Delta<E> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

impl<E: Entity> Default for Delta<E> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSnapshot {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub system: SystemStatus,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagesSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<SdkMessage>,
}

/// Live transcript push for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatch {
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<SdkMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_flattens_payload() {
        let snapshot: Snapshot<GlobalSnapshot> = serde_json::from_value(serde_json::json!({
            "timestamp": 1700000000000i64,
            "sessions": [{
                "id": "s1",
                "title": "hello",
                "createdAt": 1,
                "lastActiveAt": 2
            }],
            "settings": { "showArchived": true }
        }))
        .unwrap();

        assert_eq!(snapshot.timestamp, 1700000000000);
        assert_eq!(snapshot.data.sessions.len(), 1);
        assert!(snapshot.data.settings.show_archived);
        assert!(!snapshot.data.system.health.healthy);
    }

    #[test]
    fn delta_sub_lists_default_to_empty() {
        let delta: Delta<Session> =
            serde_json::from_value(serde_json::json!({ "removed": ["2"] })).unwrap();
        assert!(delta.added.is_empty());
        assert!(delta.updated.is_empty());
        assert_eq!(delta.removed, vec!["2".to_string()]);
        assert!(!delta.is_empty());
    }
}
