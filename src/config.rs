//! Configuration management for pagelens.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3100`.
//! - `PAGELENS_WORKDIR` - Optional. Working directory for the settings file. Defaults to `.`.
//! - `PAGELENS_API_KEY` - Optional. Provider API key (can also come from the settings file).
//! - `PAGELENS_MODEL` - Optional. Model identifier. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `PAGELENS_BASE_URL` - Optional. OpenAI-compatible endpoint override.
//! - `PAGELENS_AUTH_TOKEN` - Optional. Static token required on WebSocket upgrades when set.
//! - `MAX_SNAPSHOT_VERSIONS` - Optional. Retained versions per page. Defaults to `5`.
//! - `MAX_CONTENT_BYTES` - Optional. Content size cap per snapshot. Defaults to `102400`.
//! - `SNAPSHOT_MAX_AGE_SECS` - Optional. Age cutoff for the cleanup sweep. Defaults to `1800`.
//! - `CLEANUP_INTERVAL_SECS` - Optional. Cleanup sweep period. Defaults to `300`.
//! - `REQUEST_TIMEOUT_SECS` - Optional. Bus request/response timeout. Defaults to `5`.
//! - `MAX_HISTORY_TURNS` - Optional. Conversation turns forwarded to the provider. Defaults to `10`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Working directory (settings file lives under it)
    pub working_dir: PathBuf,

    /// Provider API key (environment default; the settings file wins)
    pub api_key: Option<String>,

    /// Model identifier (OpenRouter format)
    pub model: String,

    /// OpenAI-compatible endpoint override
    pub base_url: Option<String>,

    /// Static bearer token for WebSocket upgrades; auth disabled when unset
    pub auth_token: Option<String>,

    /// Retained snapshot versions per page
    pub max_snapshot_versions: usize,

    /// Snapshot content size cap in bytes
    pub max_content_bytes: usize,

    /// Age cutoff for the periodic snapshot sweep
    pub snapshot_max_age: Duration,

    /// Period of the snapshot sweep
    pub cleanup_interval: Duration,

    /// Timeout for bus request/response calls
    pub request_timeout: Duration,

    /// Conversation turns kept when forwarding history to the provider
    pub max_history_turns: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
            working_dir: PathBuf::from("."),
            api_key: None,
            model: "anthropic/claude-sonnet-4.5".to_string(),
            base_url: None,
            auth_token: None,
            max_snapshot_versions: 5,
            max_content_bytes: 100 * 1024,
            snapshot_max_age: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(5),
            max_history_turns: 10,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;
        }
        if let Ok(dir) = std::env::var("PAGELENS_WORKDIR") {
            config.working_dir = PathBuf::from(dir);
        }
        config.api_key = std::env::var("PAGELENS_API_KEY").ok();
        if let Ok(model) = std::env::var("PAGELENS_MODEL") {
            config.model = model;
        }
        config.base_url = std::env::var("PAGELENS_BASE_URL").ok();
        config.auth_token = std::env::var("PAGELENS_AUTH_TOKEN").ok();

        config.max_snapshot_versions =
            parse_env("MAX_SNAPSHOT_VERSIONS", config.max_snapshot_versions)?;
        config.max_content_bytes = parse_env("MAX_CONTENT_BYTES", config.max_content_bytes)?;
        config.snapshot_max_age = Duration::from_secs(parse_env(
            "SNAPSHOT_MAX_AGE_SECS",
            config.snapshot_max_age.as_secs(),
        )?);
        config.cleanup_interval = Duration::from_secs(parse_env(
            "CLEANUP_INTERVAL_SECS",
            config.cleanup_interval.as_secs(),
        )?);
        config.request_timeout = Duration::from_secs(parse_env(
            "REQUEST_TIMEOUT_SECS",
            config.request_timeout.as_secs(),
        )?);
        config.max_history_turns = parse_env("MAX_HISTORY_TURNS", config.max_history_turns)?;

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 3100);
        assert_eq!(config.max_snapshot_versions, 5);
        assert_eq!(config.max_content_bytes, 102400);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_history_turns, 10);
        assert!(config.auth_token.is_none());
    }
}
