//! Provider settings store.
//!
//! Settings live in `provider_settings.json` under the working directory and
//! fall back to environment-derived config defaults when the file is absent
//! or a field is missing. The file wins over the environment so a user edit
//! takes effect without restarting with new variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;

const SETTINGS_FILE: &str = "provider_settings.json";

/// Completion provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider name; only `openrouter` is currently wired up.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_provider() -> String {
    "openrouter".to_string()
}

impl ProviderSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            provider: default_provider(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
        }
    }

    /// Missing fields fall back to the environment-derived defaults.
    fn merged_with(mut self, defaults: &ProviderSettings) -> Self {
        if self.api_key.is_none() {
            self.api_key = defaults.api_key.clone();
        }
        if self.model.is_empty() {
            self.model = defaults.model.clone();
        }
        if self.base_url.is_none() {
            self.base_url = defaults.base_url.clone();
        }
        self
    }
}

/// On-disk shape of the settings file. Partial files are valid.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(default)]
    model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
}

/// Thread-safe settings store backed by a JSON file.
pub struct SettingsStore {
    path: PathBuf,
    defaults: ProviderSettings,
    current: RwLock<ProviderSettings>,
}

impl SettingsStore {
    /// Load settings from the working directory, falling back to config
    /// defaults. A malformed file is logged and ignored rather than fatal.
    pub async fn load(config: &Config) -> Self {
        let path = config.working_dir.join(SETTINGS_FILE);
        let defaults = ProviderSettings::from_config(config);
        let current = match read_settings_file(&path).await {
            Ok(Some(file)) => {
                debug!(path = %path.display(), "Loaded provider settings file");
                ProviderSettings {
                    provider: file.provider,
                    api_key: file.api_key,
                    model: file.model,
                    base_url: file.base_url,
                }
                .merged_with(&defaults)
            }
            Ok(None) => defaults.clone(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable settings file");
                defaults.clone()
            }
        };
        Self {
            path,
            defaults,
            current: RwLock::new(current),
        }
    }

    /// Current provider settings.
    pub async fn provider(&self) -> ProviderSettings {
        self.current.read().await.clone()
    }

    /// Replace the stored settings and persist them. Missing fields in the
    /// update fall back to the environment defaults.
    pub async fn update(&self, settings: ProviderSettings) -> Result<ProviderSettings> {
        let merged = settings.merged_with(&self.defaults);
        let json = serde_json::to_string_pretty(&merged)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        *self.current.write().await = merged.clone();
        Ok(merged)
    }
}

async fn read_settings_file(path: &Path) -> Result<Option<SettingsFile>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let file = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(Some(file))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> Config {
        Config {
            working_dir: dir.to_path_buf(),
            api_key: Some("env-key".to_string()),
            model: "env/model".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_defaults_when_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(&config_in(dir.path())).await;
        let settings = store.provider().await;
        assert_eq!(settings.provider, "openrouter");
        assert_eq!(settings.api_key.as_deref(), Some("env-key"));
        assert_eq!(settings.model, "env/model");
    }

    #[tokio::test]
    async fn test_file_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"api_key":"file-key","model":"file/model"}"#,
        )
        .unwrap();
        let store = SettingsStore::load(&config_in(dir.path())).await;
        let settings = store.provider().await;
        assert_eq!(settings.api_key.as_deref(), Some("file-key"));
        assert_eq!(settings.model, "file/model");
    }

    #[tokio::test]
    async fn test_partial_file_falls_back_per_field() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"model":"file/model"}"#,
        )
        .unwrap();
        let store = SettingsStore::load(&config_in(dir.path())).await;
        let settings = store.provider().await;
        assert_eq!(settings.api_key.as_deref(), Some("env-key"));
        assert_eq!(settings.model, "file/model");
    }

    #[tokio::test]
    async fn test_malformed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "not json").unwrap();
        let store = SettingsStore::load(&config_in(dir.path())).await;
        assert_eq!(store.provider().await.model, "env/model");
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(&config_in(dir.path())).await;
        store
            .update(ProviderSettings {
                provider: "openrouter".to_string(),
                api_key: Some("new-key".to_string()),
                model: "new/model".to_string(),
                base_url: None,
            })
            .await
            .unwrap();

        let reloaded = SettingsStore::load(&config_in(dir.path())).await;
        let settings = reloaded.provider().await;
        assert_eq!(settings.api_key.as_deref(), Some("new-key"));
        assert_eq!(settings.model, "new/model");
    }
}
