//! Production [`HostProbe`] backed by sysinfo
//!
//! sysinfo has no block-device I/O counters, so on Linux those come straight
//! from `/proc/diskstats`.

use super::{DiskCounters, HostProbe, NetCounters, SampleError};
use chrono::Utc;
use nodepulse_contracts::{HostFacts, LoadAverage, UsageStat};
use std::collections::HashSet;
use sysinfo::{Disks, Networks, System};

pub struct SysinfoProbe {
    sys: System,
    networks: Networks,
    disks: Disks,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            networks: Networks::new(),
            disks: Disks::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn begin_cpu_window(&mut self) -> Result<(), SampleError> {
        self.sys.refresh_cpu_usage();
        Ok(())
    }

    fn cpu_percent(&mut self) -> Result<f64, SampleError> {
        self.sys.refresh_cpu_usage();
        if self.sys.cpus().is_empty() {
            return Err(SampleError::read("cpu", "no CPU reported by the OS"));
        }
        Ok(self.sys.global_cpu_info().cpu_usage() as f64)
    }

    fn unix_time(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn disk_counters(&mut self) -> Result<DiskCounters, SampleError> {
        read_disk_counters()
    }

    fn net_counters(&mut self, excluded: &[String]) -> Result<NetCounters, SampleError> {
        self.networks.refresh_list();
        if self.networks.iter().next().is_none() {
            return Err(SampleError::read("network counters", "no network interface found"));
        }
        Ok(sum_interfaces(
            self.networks
                .iter()
                .map(|(name, data)| (name.as_str(), data.total_received(), data.total_transmitted())),
            excluded,
        ))
    }

    fn load_average(&mut self) -> Result<LoadAverage, SampleError> {
        let load = System::load_average();
        Ok(LoadAverage {
            load1: load.one,
            load5: load.five,
            load15: load.fifteen,
        })
    }

    fn memory(&mut self) -> Result<(UsageStat, UsageStat), SampleError> {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return Err(SampleError::read("memory", "total memory reported as zero"));
        }
        let memory = UsageStat {
            total,
            used: self.sys.used_memory(),
            free: self.sys.free_memory(),
        };
        let swap = UsageStat {
            total: self.sys.total_swap(),
            used: self.sys.used_swap(),
            free: self.sys.free_swap(),
        };
        Ok((memory, swap))
    }

    fn disk_usage(&mut self) -> Result<UsageStat, SampleError> {
        self.disks.refresh_list();
        let mut seen = HashSet::new();
        let mut usage = UsageStat::default();

        for disk in self.disks.list() {
            // Bind mounts expose the same device more than once
            if !seen.insert(disk.name().to_os_string()) {
                continue;
            }
            let total = disk.total_space();
            let free = disk.available_space();
            usage.total += total;
            usage.free += free;
            usage.used += total.saturating_sub(free);
        }
        Ok(usage)
    }

    fn host_facts(&mut self) -> Result<HostFacts, SampleError> {
        let hostname = System::host_name()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string());
        if hostname.is_empty() {
            return Err(SampleError::read("host facts", "empty hostname"));
        }
        Ok(HostFacts {
            hostname,
            uptime: System::uptime(),
            platform: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            version: System::os_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
        })
    }
}

/// Sums interface counters, skipping names that start with an excluded prefix
pub(crate) fn sum_interfaces<'a>(
    interfaces: impl Iterator<Item = (&'a str, u64, u64)>,
    excluded: &[String],
) -> NetCounters {
    let mut counters = NetCounters::default();
    for (name, recv, sent) in interfaces {
        if excluded.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            continue;
        }
        counters.recv_bytes += recv;
        counters.sent_bytes += sent;
    }
    counters
}

#[cfg(target_os = "linux")]
fn read_disk_counters() -> Result<DiskCounters, SampleError> {
    let content = std::fs::read_to_string("/proc/diskstats")
        .map_err(|source| SampleError::Io { metric: "disk counters", source })?;
    Ok(parse_diskstats(&content, |name| {
        std::path::Path::new("/sys/block").join(name).exists()
    }))
}

#[cfg(not(target_os = "linux"))]
fn read_disk_counters() -> Result<DiskCounters, SampleError> {
    Ok(DiskCounters::default())
}

const SECTOR_SIZE: u64 = 512;
const VIRTUAL_DEVICES: &[&str] = &["loop", "ram", "zram", "dm-"];

/// Sums read/written bytes of whole block devices in `/proc/diskstats` format.
///
/// Partitions are skipped so that their bytes are not counted twice.
pub(crate) fn parse_diskstats(content: &str, is_whole_disk: impl Fn(&str) -> bool) -> DiskCounters {
    let mut counters = DiskCounters::default();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if VIRTUAL_DEVICES.iter().any(|p| name.starts_with(p)) || !is_whole_disk(name) {
            continue;
        }
        let sectors_read: u64 = fields[5].parse().unwrap_or(0);
        let sectors_written: u64 = fields[9].parse().unwrap_or(0);
        counters.read_bytes += sectors_read * SECTOR_SIZE;
        counters.write_bytes += sectors_written * SECTOR_SIZE;
    }
    counters
}
