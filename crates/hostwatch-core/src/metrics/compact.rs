//! Compact, quantized metric shape broadcast to browsers.
//!
//! Every field is optional; a field is present in a diff only when it moved
//! by at least its quantum relative to the last broadcast value. At steady
//! state a host produces no traffic at all.

use serde::{Deserialize, Serialize};

use super::Sample;

/// Quantum for CPU, memory and disk percentages.
pub const QUANTUM_PERCENT: f64 = 0.1;
/// Quantum for mean ping latency, milliseconds.
pub const QUANTUM_PING: f64 = 0.1;
/// Quantum for load average.
pub const QUANTUM_LOAD: f64 = 0.01;

/// Comparison slack for values already rounded to their quantum.
const EPSILON: f64 = 1e-9;

/// The over-the-wire delta shape.
///
/// Field names are deliberately short; a dashboard with dozens of hosts
/// receives one of these per changed host every fan-out tick.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CompactMetrics {
    /// CPU percent, one decimal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Memory percent, one decimal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem: Option<f64>,
    /// Primary disk percent, one decimal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
    /// Cumulative received bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx: Option<u64>,
    /// Cumulative transmitted bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<u64>,
    /// Receive speed, bytes/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_speed: Option<u64>,
    /// Transmit speed, bytes/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_speed: Option<u64>,
    /// 1-minute load average, two decimals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<f64>,
    /// Mean probe latency in ms, one decimal. Absent while every probe fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<f64>,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// True when the two optional values differ by at least `quantum`.
/// Appearing or disappearing always counts as a change.
fn moved(cur: Option<f64>, prev: Option<f64>, quantum: f64) -> bool {
    match (cur, prev) {
        (Some(a), Some(b)) => (a - b).abs() + EPSILON >= quantum,
        (None, None) => false,
        _ => true,
    }
}

impl CompactMetrics {
    /// Extracts the browser-facing subset of a Sample, quantized.
    pub fn compact(sample: &Sample) -> Self {
        Self {
            cpu: Some(round1(sample.cpu.usage_percent)),
            mem: Some(round1(sample.memory_percent())),
            disk: Some(round1(sample.primary_disk_percent())),
            rx: Some(sample.net_rx_total),
            tx: Some(sample.net_tx_total),
            rx_speed: Some(sample.rx_speed),
            tx_speed: Some(sample.tx_speed),
            load: Some(round2(sample.load.one)),
            ping: sample.mean_ping().map(round1),
        }
    }

    /// Field-wise diff: each field is present iff it moved by at least its
    /// quantum relative to `prev`.
    pub fn diff(&self, prev: &CompactMetrics) -> CompactMetrics {
        CompactMetrics {
            cpu: self
                .cpu
                .filter(|_| moved(self.cpu, prev.cpu, QUANTUM_PERCENT)),
            mem: self
                .mem
                .filter(|_| moved(self.mem, prev.mem, QUANTUM_PERCENT)),
            disk: self
                .disk
                .filter(|_| moved(self.disk, prev.disk, QUANTUM_PERCENT)),
            rx: self.rx.filter(|_| self.rx != prev.rx),
            tx: self.tx.filter(|_| self.tx != prev.tx),
            rx_speed: self.rx_speed.filter(|_| self.rx_speed != prev.rx_speed),
            tx_speed: self.tx_speed.filter(|_| self.tx_speed != prev.tx_speed),
            load: self
                .load
                .filter(|_| moved(self.load, prev.load, QUANTUM_LOAD)),
            ping: self
                .ping
                .filter(|_| moved(self.ping, prev.ping, QUANTUM_PING)),
        }
    }

    /// True when no field is present.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none()
            && self.mem.is_none()
            && self.disk.is_none()
            && self.rx.is_none()
            && self.tx.is_none()
            && self.rx_speed.is_none()
            && self.tx_speed.is_none()
            && self.load.is_none()
            && self.ping.is_none()
    }

    /// True when a diff against `prev` would carry at least one field.
    pub fn has_changed(&self, prev: &CompactMetrics) -> bool {
        !self.diff(prev).is_empty()
    }
}
