//! Engine configuration.
//!
//! Configuration is read from `~/.config/listmill/config.toml` at startup.
//! A missing file yields the defaults; an invalid file is an error.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::app::{ListmillError, Result};

/// Default delay between two full refetches within an update cycle.
pub const DEFAULT_UPDATE_DELAY_MS: u64 = 120_000;

/// Cycles started with a delay at or below this are considered manual.
pub const MANUAL_UPDATE_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// No-progress fetch timeout, in seconds.
    pub fetch_timeout_secs: u64,
    /// Delay between full refetches within an update cycle, in milliseconds.
    pub update_delay_ms: u64,
    /// Threshold below which a cycle counts as manually triggered.
    pub manual_update_delay_ms: u64,
    /// Fallback refresh TTL, in days, when neither the cache entry nor the
    /// source descriptor carries one.
    pub default_update_after_days: f64,
    /// Root directory resolved against non-external asset URLs.
    pub local_root: PathBuf,
    /// Path of the bundled source dictionary, relative to `local_root`.
    pub assets_json_path: String,
    /// Optional remote location consulted before `assets_json_path` when the
    /// source registry is bootstrapped from an empty state.
    pub bootstrap_url: Option<String>,
    /// Use a second-granular cache-bust token instead of the hourly one.
    pub bust_full: bool,
    /// Reject fetched text that looks like an HTML error page.
    pub html_check: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            update_delay_ms: DEFAULT_UPDATE_DELAY_MS,
            manual_update_delay_ms: MANUAL_UPDATE_DELAY_MS,
            default_update_after_days: 5.0,
            local_root: PathBuf::from("."),
            assets_json_path: "assets/assets.json".to_string(),
            bootstrap_url: None,
            bust_full: false,
            html_check: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default path, falling back to defaults
    /// when no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)?;
        toml::from_str(&content).map_err(|e| {
            ListmillError::Config(format!("{}: {}", config_path.display(), e))
        })
    }

    /// `~/.config/listmill/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ListmillError::Config("Could not find config directory".into()))?;
        Ok(config_dir.join("listmill").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.update_delay_ms, 120_000);
        assert!(config.html_check);
        assert!(config.bootstrap_url.is_none());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("fetch_timeout_secs = 10").unwrap();
        assert_eq!(config.fetch_timeout_secs, 10);
        assert_eq!(config.update_delay_ms, DEFAULT_UPDATE_DELAY_MS);
    }
}
