//! Host metrics sampling for nodepulse agents
//!
//! Turns OS gauges and monotonically increasing counters into a [`Sample`]:
//! - CPU utilisation averaged over the sampling interval
//! - Disk and network I/O rates derived from cumulative byte counters
//! - Load averages, memory/swap usage, aggregate disk space
//! - Host facts and optional sensor temperatures
//!
//! Counter deltas need the previous reading, which lives in an explicitly
//! owned [`SamplerState`]. OS access goes through the [`HostProbe`] trait so
//! the arithmetic can be driven with scripted readings.

mod probe;

pub use probe::SysinfoProbe;

use nodepulse_contracts::{HostFacts, LoadAverage, Sample, UsageStat};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sensors;

/// Interface name prefixes left out of network counters by default
pub const DEFAULT_EXCLUDED_INTERFACES: &[&str] =
    &["lo", "tun", "docker", "veth", "br-", "vmbr", "vnet", "kube"];

/// A metric read failed; the whole sampling call is aborted
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to read {metric}: {reason}")]
    Read { metric: &'static str, reason: String },
    #[error("IO error while reading {metric}: {source}")]
    Io {
        metric: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SampleError {
    pub fn read(metric: &'static str, reason: impl Into<String>) -> Self {
        Self::Read { metric, reason: reason.into() }
    }
}

/// Cumulative block device bytes since boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Cumulative interface bytes since boot (or interface reset)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub recv_bytes: u64,
    pub sent_bytes: u64,
}

/// Everything the sampler needs from the operating system
pub trait HostProbe {
    /// Opens the CPU utilisation window closed by [`HostProbe::cpu_percent`]
    fn begin_cpu_window(&mut self) -> Result<(), SampleError>;
    /// Average CPU utilisation since the window was opened
    fn cpu_percent(&mut self) -> Result<f64, SampleError>;
    /// Current wall clock, Unix seconds
    fn unix_time(&self) -> i64;
    fn disk_counters(&mut self) -> Result<DiskCounters, SampleError>;
    /// Summed over every interface not matching `excluded` prefixes
    fn net_counters(&mut self, excluded: &[String]) -> Result<NetCounters, SampleError>;
    fn load_average(&mut self) -> Result<LoadAverage, SampleError>;
    /// Returns `(memory, swap)`
    fn memory(&mut self) -> Result<(UsageStat, UsageStat), SampleError>;
    /// Space summed across every distinct mounted partition
    fn disk_usage(&mut self) -> Result<UsageStat, SampleError>;
    fn host_facts(&mut self) -> Result<HostFacts, SampleError>;
}

/// Per-second rates derived from two consecutive readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rates {
    pub disk_read: u64,
    pub disk_write: u64,
    pub net_rx: u64,
    pub net_tx: u64,
}

/// Result of feeding one reading into [`SamplerState::advance`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub rates: Rates,
    /// Bytes sent since the previous accepted reading
    pub sent: u64,
    /// Bytes received since the previous accepted reading
    pub recv: u64,
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    timestamp: i64,
    disk: DiskCounters,
    net: NetCounters,
}

/// Prior counters carried between sampling calls
#[derive(Debug, Clone, Default)]
pub struct SamplerState {
    last: Option<Reading>,
    last_rates: Rates,
}

impl SamplerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a new cumulative reading into the state.
    ///
    /// The first reading only primes the state and yields zero rates. A
    /// reading whose elapsed time is not positive leaves the state untouched
    /// and repeats the previous rates, so no division ever happens on it.
    pub fn advance(&mut self, timestamp: i64, disk: DiskCounters, net: NetCounters) -> CounterDelta {
        let current = Reading { timestamp, disk, net };

        let Some(previous) = self.last else {
            self.last = Some(current);
            self.last_rates = Rates::default();
            return CounterDelta::default();
        };

        let elapsed = timestamp - previous.timestamp;
        if elapsed <= 0 {
            debug!(elapsed, "non-positive elapsed time, keeping previous rates");
            return CounterDelta { rates: self.last_rates, sent: 0, recv: 0 };
        }
        let elapsed = elapsed as u64;

        // A counter going backwards means a reset; count it as no traffic
        let disk_read = disk.read_bytes.saturating_sub(previous.disk.read_bytes);
        let disk_write = disk.write_bytes.saturating_sub(previous.disk.write_bytes);
        let recv = net.recv_bytes.saturating_sub(previous.net.recv_bytes);
        let sent = net.sent_bytes.saturating_sub(previous.net.sent_bytes);

        let rates = Rates {
            disk_read: disk_read / elapsed,
            disk_write: disk_write / elapsed,
            net_rx: recv / elapsed,
            net_tx: sent / elapsed,
        };

        self.last = Some(current);
        self.last_rates = rates;
        CounterDelta { rates, sent, recv }
    }

    /// Timestamp of the last accepted reading
    pub fn last_timestamp(&self) -> Option<i64> {
        self.last.map(|r| r.timestamp)
    }
}

/// Stateful sampler owning its probe and counter history
pub struct Sampler<P> {
    probe: P,
    state: SamplerState,
    excluded_interfaces: Vec<String>,
    use_sensors: bool,
}

impl<P: HostProbe> Sampler<P> {
    pub fn new(probe: P, excluded_interfaces: Vec<String>, use_sensors: bool) -> Self {
        Self {
            probe,
            state: SamplerState::new(),
            excluded_interfaces,
            use_sensors,
        }
    }

    pub fn state(&self) -> &SamplerState {
        &self.state
    }

    /// Takes one sample; waits for `interval` while measuring CPU usage.
    ///
    /// Any failing OS read aborts the call. Sensor failures only drop the
    /// temperature mapping.
    pub async fn sample(&mut self, interval: Duration) -> Result<Sample, SampleError> {
        self.probe.begin_cpu_window()?;
        tokio::time::sleep(interval).await;
        let cpu = self.probe.cpu_percent()?;

        let now = self.probe.unix_time();
        let disk_io = self.probe.disk_counters()?;
        let net_io = self.probe.net_counters(&self.excluded_interfaces)?;

        // Counters are only committed once every read below succeeded
        let mut state = self.state.clone();
        let delta = state.advance(now, disk_io, net_io);

        let load = self.probe.load_average()?;
        let (memory, swap) = self.probe.memory()?;
        let disk_usage = self.probe.disk_usage()?;
        let host = self.probe.host_facts()?;

        self.state = state;

        let temperature = if self.use_sensors {
            match sensors::read_temperatures().await {
                Ok(readings) => Some(readings),
                Err(e) => {
                    warn!("sensor lookup failed, reporting without temperatures: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut sample = Sample {
            report_time: now,
            interval: interval.as_secs(),
            load,
            memory,
            swap,
            host,
            temperature,
            ..Sample::default()
        };
        sample.percent.cpu = cpu;
        sample.percent.memory = memory.used_percent();
        sample.percent.swap = swap.used_percent();
        sample.percent.disk = disk_usage.used_percent();
        sample.disk.usage = disk_usage;
        sample.disk.read = delta.rates.disk_read;
        sample.disk.write = delta.rates.disk_write;
        sample.network.rx = delta.rates.net_rx;
        sample.network.tx = delta.rates.net_tx;
        sample.network.send = delta.sent;
        sample.network.recv = delta.recv;

        Ok(sample)
    }
}
