use crate::schema::ClientConfig;
use anyhow::{Context, Result};
use jsonc_parser::{parse_to_serde_value, ParseOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{env:([^}]+)\}").expect("env var pattern is valid"));

/// Layers client config sources. Later loads override earlier ones field by
/// field.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config: ClientConfig,
    config_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_str(&mut self, content: &str) -> Result<()> {
        let content = substitute_env_vars(content);
        let config = parse_jsonc(&content).context("Failed to parse config content")?;
        self.config.merge(config);
        Ok(())
    }

    /// Missing files are skipped silently.
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let content = substitute_env_vars(&content);
        let config = parse_jsonc(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        tracing::debug!(path = %path.display(), "loaded client config");
        self.config.merge(config);
        self.config_paths.push(path.to_path_buf());
        Ok(())
    }

    /// Loads `<config dir>/tether/config.jsonc`, falling back to `.json`.
    pub fn load_global(&mut self) -> Result<()> {
        let base = global_config_path();
        for ext in ["jsonc", "json"] {
            let path = base.with_extension(ext);
            if path.exists() {
                self.load_from_file(&path)?;
                break;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn config_paths(&self) -> &[PathBuf] {
        &self.config_paths
    }

    pub fn into_config(self) -> ClientConfig {
        self.config
    }
}

fn global_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("tether/config")
}

/// Replaces `{env:VAR}` with the variable's value, or nothing when unset.
fn substitute_env_vars(text: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .to_string()
}

fn parse_jsonc(content: &str) -> Result<ClientConfig> {
    let parse_options = ParseOptions {
        allow_trailing_commas: true,
        ..Default::default()
    };
    let parsed = parse_to_serde_value(content, &parse_options)
        .context("Failed to parse JSONC")?
        .context("Config content is empty")?;
    serde_json::from_value(parsed).context("Failed to parse config JSON")
}
