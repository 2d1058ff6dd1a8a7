//! Local system metrics collection from /proc.
//!
//! Used by the agent binary on monitored hosts and by the server to sample
//! its own host (the reserved `local` id). Filesystem access goes through
//! the `FileSystem` trait so collection logic is testable off-Linux via
//! `MockFs`.

mod fs;

pub use fs::{FileSystem, MockFs, RealFs};

use std::fmt;
use std::path::PathBuf;

use crate::metrics::{CpuInfo, DiskInfo, LoadInfo, MemoryInfo, NetInterfaceInfo, Sample};

/// Error during sample collection.
#[derive(Debug, Clone)]
pub enum CollectError {
    Io(String),
    Parse(String),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::Io(msg) => write!(f, "I/O error: {}", msg),
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

/// Cumulative jiffies of one CPU line, reduced to what usage needs.
#[derive(Clone, Copy, Debug, Default)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

/// Collects Samples from the local system.
///
/// CPU usage and network speeds are deltas between consecutive calls, so
/// the first collected Sample reports them as zero.
pub struct Collector<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    sys_path: PathBuf,
    version: String,
    /// Index 0 is the aggregate line, then one entry per core.
    prev_cpu: Option<Vec<CpuTimes>>,
    /// (wallclock, rx_total, tx_total) of the previous collection.
    prev_net: Option<(i64, u64, u64)>,
}

impl<F: FileSystem> Collector<F> {
    pub fn new(fs: F, proc_path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            sys_path: PathBuf::from("/sys"),
            version: version.into(),
            prev_cpu: None,
            prev_net: None,
        }
    }

    pub fn with_sys_path(mut self, sys_path: impl Into<PathBuf>) -> Self {
        self.sys_path = sys_path.into();
        self
    }

    /// Collects one Sample. `now` is the wallclock in epoch seconds; it
    /// becomes the Sample timestamp and drives speed derivation.
    pub fn collect(&mut self, now: i64) -> Result<Sample, CollectError> {
        let cpu = self.collect_cpu()?;
        let memory = self.collect_memory()?;
        let load = self.collect_load()?;
        let uptime_secs = self.collect_uptime()?;
        let network = self.collect_network();
        let disks = self.collect_disks();

        let net_rx_total: u64 = network.iter().map(|n| n.rx_bytes).sum();
        let net_tx_total: u64 = network.iter().map(|n| n.tx_bytes).sum();
        let (rx_speed, tx_speed) = match self.prev_net {
            Some((prev_now, prev_rx, prev_tx)) if now > prev_now => {
                let dt = (now - prev_now) as u64;
                (
                    net_rx_total.saturating_sub(prev_rx) / dt,
                    net_tx_total.saturating_sub(prev_tx) / dt,
                )
            }
            _ => (0, 0),
        };
        self.prev_net = Some((now, net_rx_total, net_tx_total));

        Ok(Sample {
            timestamp: now,
            cpu,
            memory,
            disks,
            network,
            net_rx_total,
            net_tx_total,
            rx_speed,
            tx_speed,
            load,
            uptime_secs,
            hostname: self.read_trimmed("sys/kernel/hostname").unwrap_or_default(),
            os: self.collect_os(),
            version: self.version.clone(),
            ping: Vec::new(),
        })
    }

    fn read_proc(&self, rel: &str) -> Result<String, CollectError> {
        self.fs
            .read_to_string(&self.proc_path.join(rel))
            .map_err(|e| CollectError::Io(format!("{}: {}", rel, e)))
    }

    fn read_trimmed(&self, rel: &str) -> Option<String> {
        self.fs
            .read_to_string(&self.proc_path.join(rel))
            .ok()
            .map(|s| s.trim().to_string())
    }

    // ------------------------------------------------------------------
    // CPU
    // ------------------------------------------------------------------

    fn collect_cpu(&mut self) -> Result<CpuInfo, CollectError> {
        let stat = self.read_proc("stat")?;
        let mut times = Vec::new();
        for line in stat.lines() {
            if !line.starts_with("cpu") {
                continue;
            }
            let mut fields = line.split_whitespace();
            let _label = fields.next();
            let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
            if values.len() < 4 {
                return Err(CollectError::Parse(format!("short cpu line: {}", line)));
            }
            let idle = values[3] + values.get(4).copied().unwrap_or(0);
            times.push(CpuTimes {
                total: values.iter().sum(),
                idle,
            });
        }
        if times.is_empty() {
            return Err(CollectError::Parse("no cpu lines in /proc/stat".into()));
        }

        let usage = |cur: &CpuTimes, prev: &CpuTimes| -> f64 {
            let dt = cur.total.saturating_sub(prev.total);
            if dt == 0 {
                return 0.0;
            }
            let busy = dt.saturating_sub(cur.idle.saturating_sub(prev.idle));
            busy as f64 / dt as f64 * 100.0
        };

        let (usage_percent, per_core) = match &self.prev_cpu {
            Some(prev) if prev.len() == times.len() => (
                usage(&times[0], &prev[0]),
                times[1..]
                    .iter()
                    .zip(&prev[1..])
                    .map(|(c, p)| usage(c, p))
                    .collect(),
            ),
            _ => (0.0, vec![0.0; times.len().saturating_sub(1)]),
        };
        self.prev_cpu = Some(times);

        let (brand, frequency_mhz, cores) = self.collect_cpuinfo();
        Ok(CpuInfo {
            usage_percent,
            per_core,
            brand,
            frequency_mhz,
            cores,
        })
    }

    fn collect_cpuinfo(&self) -> (String, u64, u32) {
        let Ok(cpuinfo) = self.read_proc("cpuinfo") else {
            return (String::new(), 0, 0);
        };
        let mut brand = String::new();
        let mut freq = 0u64;
        let mut cores = 0u32;
        for line in cpuinfo.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key.trim() {
                    "processor" => cores += 1,
                    "model name" if brand.is_empty() => brand = value.trim().to_string(),
                    "cpu MHz" if freq == 0 => {
                        freq = value.trim().parse::<f64>().unwrap_or(0.0) as u64;
                    }
                    _ => {}
                }
            }
        }
        (brand, freq, cores)
    }

    // ------------------------------------------------------------------
    // Memory, load, uptime
    // ------------------------------------------------------------------

    fn collect_memory(&self) -> Result<MemoryInfo, CollectError> {
        let meminfo = self.read_proc("meminfo")?;
        let mut total = 0u64;
        let mut available = 0u64;
        let mut swap_total = 0u64;
        let mut swap_free = 0u64;
        for line in meminfo.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            // Values are in kB
            let kb: u64 = rest
                .trim()
                .trim_end_matches(" kB")
                .parse()
                .unwrap_or(0);
            match key {
                "MemTotal" => total = kb * 1024,
                "MemAvailable" => available = kb * 1024,
                "SwapTotal" => swap_total = kb * 1024,
                "SwapFree" => swap_free = kb * 1024,
                _ => {}
            }
        }
        if total == 0 {
            return Err(CollectError::Parse("MemTotal missing".into()));
        }
        Ok(MemoryInfo {
            used: total.saturating_sub(available),
            total,
            available,
            swap_used: swap_total.saturating_sub(swap_free),
            swap_total,
        })
    }

    fn collect_load(&self) -> Result<LoadInfo, CollectError> {
        let loadavg = self.read_proc("loadavg")?;
        let mut fields = loadavg.split_whitespace();
        let mut next = || -> Result<f64, CollectError> {
            fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| CollectError::Parse("bad /proc/loadavg".into()))
        };
        Ok(LoadInfo {
            one: next()?,
            five: next()?,
            fifteen: next()?,
        })
    }

    fn collect_uptime(&self) -> Result<u64, CollectError> {
        let uptime = self.read_proc("uptime")?;
        uptime
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v as u64)
            .ok_or_else(|| CollectError::Parse("bad /proc/uptime".into()))
    }

    // ------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------

    fn collect_network(&self) -> Vec<NetInterfaceInfo> {
        let Ok(dev) = self.read_proc("net/dev") else {
            return Vec::new();
        };
        let mut interfaces = Vec::new();
        for line in dev.lines().skip(2) {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name == "lo" {
                continue;
            }
            let values: Vec<u64> = rest
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            // 8 rx columns then 8 tx columns
            if values.len() < 16 {
                continue;
            }
            let iface_dir = self.sys_path.join("class/net").join(name);
            let mac = self
                .fs
                .read_to_string(&iface_dir.join("address"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let speed_mbps = self
                .fs
                .read_to_string(&iface_dir.join("speed"))
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(0) as u64;
            interfaces.push(NetInterfaceInfo {
                name: name.to_string(),
                mac,
                speed_mbps,
                rx_bytes: values[0],
                tx_bytes: values[8],
                rx_packets: values[1],
                tx_packets: values[9],
            });
        }
        interfaces
    }

    // ------------------------------------------------------------------
    // Disks
    // ------------------------------------------------------------------

    fn collect_disks(&self) -> Vec<DiskInfo> {
        let Ok(mounts) = self.read_proc("mounts") else {
            return Vec::new();
        };
        let mut disks: Vec<DiskInfo> = Vec::new();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(device), Some(mount), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !device.starts_with("/dev/") || device.starts_with("/dev/loop") {
                continue;
            }
            let name = device.trim_start_matches("/dev/").to_string();
            if let Some(existing) = disks.iter_mut().find(|d| d.name == name) {
                existing.mount_points.push(mount.to_string());
                continue;
            }
            let Ok((total, avail)) = self.fs.disk_usage(std::path::Path::new(mount)) else {
                continue;
            };
            disks.push(DiskInfo {
                name,
                total,
                used: total.saturating_sub(avail),
                disk_type: fstype.to_string(),
                mount_points: vec![mount.to_string()],
            });
        }
        disks
    }

    fn collect_os(&self) -> String {
        let Ok(release) = self
            .fs
            .read_to_string(std::path::Path::new("/etc/os-release"))
        else {
            return String::new();
        };
        release
            .lines()
            .find_map(|l| l.strip_prefix("PRETTY_NAME="))
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_default()
    }
}
