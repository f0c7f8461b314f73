//! Agent configuration
//!
//! Handles:
//! - Report endpoint, shared token and node identity
//! - Sampling cadence and sensor lookup
//! - Network interface exclusions
//!
//! Loaded from TOML (`NODEPULSE_AGENT_CONFIG` or the OS config directory),
//! then overridden by `NODEPULSE_*` environment variables.

use crate::metrics::DEFAULT_EXCLUDED_INTERFACES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find a config directory")]
    NoConfigDir,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Kernel report endpoint, e.g. `http://collector:10567/api/report`
    pub report_url: Option<String>,
    /// Explicit node id; the measured hostname is used when absent
    pub node_id: Option<String>,
    pub token: String,
    pub interval_secs: u64,
    /// Read temperatures through lm-sensors
    pub sensors: bool,
    pub exclude_interfaces: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            report_url: None,
            node_id: None,
            token: String::new(),
            interval_secs: 3,
            sensors: true,
            exclude_interfaces: DEFAULT_EXCLUDED_INTERFACES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AgentConfig {
    /// Load config from `NODEPULSE_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var("NODEPULSE_AGENT_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };
        let mut config = Self::load_from(&path).await?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file; a missing file yields the defaults
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("nodepulse-agent");
        path.push("config.toml");
        Ok(path)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("NODEPULSE_REPORT_URL") {
            self.report_url = Some(url);
        }
        if let Some(token) = lookup("NODEPULSE_TOKEN") {
            self.token = token;
        }
        if let Some(node_id) = lookup("NODEPULSE_NODE_ID") {
            self.node_id = Some(node_id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval_secs must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
