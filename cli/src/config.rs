// Configuration management for the blerelay CLI
//
// Cross-platform config stored in:
// - Linux: ~/.config/blerelay/config.json
// - macOS: ~/Library/Application Support/blerelay/config.json

use anyhow::{Context, Result};
use blerelay_core::session::RelayConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth adapter used for both roles (e.g. "hci0")
    pub adapter: Option<String>,

    /// Upstream connect deadline in seconds
    pub connect_timeout_secs: u64,

    /// Deadline for each upstream GATT operation in seconds
    pub operation_timeout_secs: u64,

    /// Subscribe to every notifying characteristic when the link comes up
    pub auto_subscribe: bool,

    /// Gate non-mandatory attributes until the victim pairs
    pub require_pairing: bool,

    /// Directory for daily-rolling log files
    pub log_dir: Option<PathBuf>,

    /// Pipeline file used when --pipeline is not given
    pub default_pipeline: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            adapter: None,
            connect_timeout_secs: relay.connect_timeout.as_secs(),
            operation_timeout_secs: relay.operation_timeout.as_secs(),
            auto_subscribe: relay.auto_subscribe,
            require_pairing: relay.require_pairing,
            log_dir: None,
            default_pipeline: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blerelay");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Set a config value; an empty value clears optional keys
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |value: &str| (!value.is_empty()).then(|| value.to_string());
        match key {
            "adapter" => self.adapter = optional(value),
            "connect_timeout_secs" => {
                self.connect_timeout_secs = parse_secs(value)?;
            }
            "operation_timeout_secs" => {
                self.operation_timeout_secs = parse_secs(value)?;
            }
            "auto_subscribe" => {
                self.auto_subscribe = value.parse().context("Invalid boolean value")?;
            }
            "require_pairing" => {
                self.require_pairing = value.parse().context("Invalid boolean value")?;
            }
            "log_dir" => self.log_dir = optional(value).map(PathBuf::from),
            "default_pipeline" => self.default_pipeline = optional(value).map(PathBuf::from),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        };
        vec![
            (
                "adapter".to_string(),
                self.adapter.clone().unwrap_or_else(|| "(default)".to_string()),
            ),
            (
                "connect_timeout_secs".to_string(),
                self.connect_timeout_secs.to_string(),
            ),
            (
                "operation_timeout_secs".to_string(),
                self.operation_timeout_secs.to_string(),
            ),
            ("auto_subscribe".to_string(), self.auto_subscribe.to_string()),
            ("require_pairing".to_string(), self.require_pairing.to_string()),
            ("log_dir".to_string(), path(&self.log_dir)),
            ("default_pipeline".to_string(), path(&self.default_pipeline)),
        ]
    }

    /// Relay settings from this file, before command-line overrides
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::default()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_operation_timeout(Duration::from_secs(self.operation_timeout_secs))
            .with_auto_subscribe(self.auto_subscribe)
            .with_require_pairing(self.require_pairing)
    }
}

fn parse_secs(value: &str) -> Result<u64> {
    let secs: u64 = value.parse().context("Invalid number of seconds")?;
    if secs == 0 {
        anyhow::bail!("Timeout must be at least one second");
    }
    Ok(secs)
}
