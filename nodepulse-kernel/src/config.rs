use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
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
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    /// Shared bearer token expected from agents
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// A node is alive while its last report is younger than this
    #[serde(default = "default_alive_timeout")]
    pub alive_timeout_secs: i64,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub location: String,
    /// Day of month on which the node's history is purged; never when unset
    #[serde(default)]
    pub reset_day: Option<u8>,
}

fn default_listen() -> String {
    "127.0.0.1:10567".into()
}

fn default_database() -> PathBuf {
    PathBuf::from("nodepulse.db")
}

fn default_alive_timeout() -> i64 {
    60
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            listen: default_listen(),
            database: default_database(),
            alive_timeout_secs: default_alive_timeout(),
            nodes: Vec::new(),
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "token must be set (config file or NODEPULSE_TOKEN)".into(),
            ));
        }
        if self.alive_timeout_secs <= 0 {
            return Err(ConfigError::Invalid("alive_timeout_secs must be positive".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(ConfigError::Invalid("node id must not be empty".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id '{}'", node.id)));
            }
            if let Some(day) = node.reset_day {
                if !(1..=31).contains(&day) {
                    return Err(ConfigError::Invalid(format!(
                        "node '{}' reset_day {} is outside 1..=31",
                        node.id, day
                    )));
                }
            }
        }
        Ok(())
    }
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("NODEPULSE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_config_from(Path::new(&path)).await?;
    if let Ok(token) = std::env::var("NODEPULSE_TOKEN") {
        cfg.token = token;
    }
    cfg.validate()?;
    Ok(cfg)
}

pub async fn load_config_from(path: &Path) -> Result<KernelConfig, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "no kernel config file, using defaults");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
