//! Canonical metric record pushed by agents.
//!
//! A `Sample` is one timestamped snapshot of a monitored host. Agents send it
//! as the payload of a `metrics` wire frame; the server keeps the latest one
//! per host in memory and persists a flattened row plus rollup updates
//! through the writer.

mod compact;

pub use compact::{CompactMetrics, QUANTUM_LOAD, QUANTUM_PERCENT, QUANTUM_PING};

use serde::{Deserialize, Serialize};

/// CPU state of the monitored host.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CpuInfo {
    /// Aggregate usage across all cores, 0.0–100.0.
    pub usage_percent: f64,
    /// Per-core usage, 0.0–100.0 each. Length equals `cores`.
    #[serde(default)]
    pub per_core: Vec<f64>,
    /// CPU model string, e.g. "AMD EPYC 7543".
    #[serde(default)]
    pub brand: String,
    /// Nominal frequency in MHz.
    #[serde(default)]
    pub frequency_mhz: u64,
    /// Logical core count.
    #[serde(default)]
    pub cores: u32,
}

/// Memory and swap occupancy in bytes.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct MemoryInfo {
    pub used: u64,
    pub total: u64,
    pub available: u64,
    #[serde(default)]
    pub swap_used: u64,
    #[serde(default)]
    pub swap_total: u64,
}

impl MemoryInfo {
    /// Used memory as a percentage of total; 0.0 when total is unknown.
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

/// One mounted filesystem.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct DiskInfo {
    /// Device name, e.g. "nvme0n1p2".
    pub name: String,
    pub total: u64,
    pub used: u64,
    /// Filesystem type, e.g. "ext4".
    #[serde(default)]
    pub disk_type: String,
    #[serde(default)]
    pub mount_points: Vec<String>,
}

impl DiskInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

/// One network interface with cumulative counters.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct NetInterfaceInfo {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    /// Link speed in Mbit/s, 0 when the kernel does not report it.
    #[serde(default)]
    pub speed_mbps: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
}

/// Load averages over 1/5/15 minutes.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct LoadInfo {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Outcome of one ping probe.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PingStatus {
    Ok,
    Timeout,
    Error,
}

impl Default for PingStatus {
    fn default() -> Self {
        PingStatus::Error
    }
}

/// Result of probing one configured target.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct PingResult {
    /// Display name of the target, e.g. "CF".
    pub name: String,
    /// Probed host.
    pub host: String,
    /// Round-trip latency in milliseconds; None when the probe failed.
    pub latency_ms: Option<f64>,
    /// Packet loss percentage for this probe round, 0.0–100.0.
    #[serde(default)]
    pub packet_loss: f64,
    pub status: PingStatus,
}

/// One metrics snapshot pushed by an agent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Sample {
    /// Collection time, UTC epoch seconds.
    pub timestamp: i64,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
    #[serde(default)]
    pub network: Vec<NetInterfaceInfo>,
    /// Cumulative received bytes summed over all interfaces.
    pub net_rx_total: u64,
    /// Cumulative transmitted bytes summed over all interfaces.
    pub net_tx_total: u64,
    /// Instantaneous receive speed in bytes/s, derived by the agent.
    pub rx_speed: u64,
    /// Instantaneous transmit speed in bytes/s, derived by the agent.
    pub tx_speed: u64,
    pub load: LoadInfo,
    pub uptime_secs: u64,
    #[serde(default)]
    pub hostname: String,
    /// OS descriptor, e.g. "Debian GNU/Linux 12".
    #[serde(default)]
    pub os: String,
    /// Agent version string.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub ping: Vec<PingResult>,
}

impl Sample {
    /// Mean of the non-null probe latencies; None when every probe failed
    /// or no probes are configured.
    pub fn mean_ping(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0u32;
        for p in &self.ping {
            if let Some(lat) = p.latency_ms {
                sum += lat;
                count += 1;
            }
        }
        if count == 0 { None } else { Some(sum / count as f64) }
    }

    /// Usage percent of the primary disk (the largest one). 0.0 without disks.
    pub fn primary_disk_percent(&self) -> f64 {
        self.disks
            .iter()
            .max_by_key(|d| d.total)
            .map(|d| d.used_percent())
            .unwrap_or(0.0)
    }

    pub fn memory_percent(&self) -> f64 {
        self.memory.used_percent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_ping_ignores_failed_probes() {
        let sample = Sample {
            ping: vec![
                PingResult {
                    latency_ms: Some(10.0),
                    status: PingStatus::Ok,
                    ..PingResult::default()
                },
                PingResult {
                    latency_ms: None,
                    status: PingStatus::Timeout,
                    ..PingResult::default()
                },
                PingResult {
                    latency_ms: Some(30.0),
                    status: PingStatus::Ok,
                    ..PingResult::default()
                },
            ],
            ..Sample::default()
        };
        assert_eq!(sample.mean_ping(), Some(20.0));
    }

    #[test]
    fn mean_ping_is_none_when_all_failed() {
        let sample = Sample {
            ping: vec![PingResult {
                latency_ms: None,
                status: PingStatus::Error,
                ..PingResult::default()
            }],
            ..Sample::default()
        };
        assert_eq!(sample.mean_ping(), None);
        assert_eq!(Sample::default().mean_ping(), None);
    }

    #[test]
    fn primary_disk_is_the_largest() {
        let sample = Sample {
            disks: vec![
                DiskInfo {
                    name: "sda1".into(),
                    total: 100,
                    used: 10,
                    ..DiskInfo::default()
                },
                DiskInfo {
                    name: "nvme0n1".into(),
                    total: 1000,
                    used: 500,
                    ..DiskInfo::default()
                },
            ],
            ..Sample::default()
        };
        assert!((sample.primary_disk_percent() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ping_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PingStatus::Ok).unwrap(), "\"ok\"");
        assert_eq!(
            serde_json::to_string(&PingStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }
}
