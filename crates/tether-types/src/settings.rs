use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub show_archived: bool,
    #[serde(default = "default_true")]
    pub auto_scroll: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub max_thinking_tokens: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_model: None,
            show_archived: false,
            auto_scroll: true,
            permission_mode: None,
            max_thinking_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scroll: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self == &SettingsPatch::default()
    }

    /// Later values win. Used to coalesce several edits into one save.
    pub fn merge(&mut self, other: SettingsPatch) {
        if other.default_model.is_some() {
            self.default_model = other.default_model;
        }
        if other.show_archived.is_some() {
            self.show_archived = other.show_archived;
        }
        if other.auto_scroll.is_some() {
            self.auto_scroll = other.auto_scroll;
        }
        if other.permission_mode.is_some() {
            self.permission_mode = other.permission_mode;
        }
        if other.max_thinking_tokens.is_some() {
            self.max_thinking_tokens = other.max_thinking_tokens;
        }
    }
}

impl Settings {
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(model) = &patch.default_model {
            self.default_model = Some(model.clone());
        }
        if let Some(show) = patch.show_archived {
            self.show_archived = show;
        }
        if let Some(auto) = patch.auto_scroll {
            self.auto_scroll = auto;
        }
        if let Some(mode) = &patch.permission_mode {
            self.permission_mode = Some(mode.clone());
        }
        if let Some(tokens) = patch.max_thinking_tokens {
            self.max_thinking_tokens = Some(tokens);
        }
    }
}
