//! Report contract shared by the nodepulse agent and kernel
//!
//! The agent builds a [`Sample`] every tick and POSTs it as JSON to the
//! kernel's `/api/report` endpoint. The kernel decodes the very same type,
//! so both sides stay in lockstep on field names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One measurement snapshot from a node (matches `report@v1`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Node identifier, filled by the reporter (override or hostname)
    #[serde(default)]
    pub node_id: String,
    /// Unix seconds at which the sample was taken
    pub report_time: i64,
    /// Sampling interval in seconds
    pub interval: u64,
    pub percent: Percentages,
    pub load: LoadAverage,
    pub memory: UsageStat,
    pub swap: UsageStat,
    pub disk: DiskStat,
    pub network: NetworkStat,
    pub host: HostFacts,
    /// Sensor name -> degrees Celsius, absent when sensors are disabled or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentages {
    pub cpu: f64,
    pub memory: f64,
    pub swap: f64,
    pub disk: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// Capacity figures in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStat {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl UsageStat {
    /// `used / total * 100`, zero for an empty pool
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

/// Aggregate disk space plus I/O rates in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStat {
    #[serde(flatten)]
    pub usage: UsageStat,
    pub read: u64,
    pub write: u64,
}

/// Network rates (bytes per second) and traffic (bytes)
///
/// `send`/`recv` hold the bytes moved since the previous reading. The
/// kernel overview replaces them with the per-node running total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStat {
    pub rx: u64,
    pub tx: u64,
    pub send: u64,
    pub recv: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub uptime: u64,
    pub platform: String,
    pub version: String,
    pub arch: String,
}
