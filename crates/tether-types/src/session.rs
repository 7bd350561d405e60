use serde::{Deserialize, Serialize};

use crate::sync::Entity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Waiting,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
    #[serde(default)]
    pub archived: bool,
}

impl Session {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            title: title.into(),
            status: SessionStatus::Idle,
            workspace_path: None,
            model: None,
            created_at: now,
            last_active_at: now,
            archived: false,
        }
    }

    /// Archived sessions and sessions whose agent ended are not "active".
    pub fn is_active(&self) -> bool {
        !self.archived && self.status != SessionStatus::Ended
    }
}

/// Partial update for a session. Absent fields are left untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl SessionPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn last_active_at(mut self, at: i64) -> Self {
        self.last_active_at = Some(at);
        self
    }
}

impl Entity for Session {
    type Patch = SessionPatch;

    fn key(&self) -> &str {
        &self.id
    }

    fn patch_key(patch: &SessionPatch) -> &str {
        &patch.id
    }

    fn apply_patch(&mut self, patch: &SessionPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(path) = &patch.workspace_path {
            self.workspace_path = Some(path.clone());
        }
        if let Some(model) = &patch.model {
            self.model = Some(model.clone());
        }
        if let Some(at) = patch.last_active_at {
            self.last_active_at = at;
        }
        if let Some(archived) = patch.archived {
            self.archived = archived;
        }
    }
}
