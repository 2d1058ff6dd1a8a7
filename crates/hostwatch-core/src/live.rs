//! In-memory last-sample state shared between sessions, fan-out and queries.
//!
//! Two process-wide maps, each behind its own reader-writer lock:
//! - the live snapshot: last received Sample per server plus its arrival time
//! - the last-sent state: online bit and CompactMetrics as last broadcast
//!
//! Entries never expire; a host is online iff its last Sample is younger
//! than [`ONLINE_WINDOW_SECS`]. The last-sent state advances only together
//! with an emitted delta, never partially.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::metrics::{CompactMetrics, Sample};
use crate::protocol::DeltaUpdate;

/// A server is online iff its last Sample is younger than this.
pub const ONLINE_WINDOW_SECS: i64 = 30;

/// Last received Sample and its arrival wallclock.
#[derive(Clone, Debug)]
pub struct LiveEntry {
    pub sample: Sample,
    /// Arrival time, UTC epoch seconds. Server wallclock, not the Sample's
    /// own timestamp: agent clocks are not trusted for the online bit.
    pub received_at: i64,
}

struct SentEntry {
    online: bool,
    metrics: CompactMetrics,
}

/// Process-wide live state. One instance per server process.
#[derive(Default)]
pub struct LiveState {
    snapshots: RwLock<HashMap<String, LiveEntry>>,
    last_sent: RwLock<HashMap<String, SentEntry>>,
}

impl LiveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest Sample for a server. Called on every metrics frame,
    /// independently of whether persistence kept up.
    pub fn update(&self, server_id: &str, sample: Sample, now: i64) {
        let mut map = self.snapshots.write().unwrap();
        map.insert(
            server_id.to_string(),
            LiveEntry {
                sample,
                received_at: now,
            },
        );
    }

    pub fn get(&self, server_id: &str) -> Option<LiveEntry> {
        self.snapshots.read().unwrap().get(server_id).cloned()
    }

    pub fn is_online(&self, server_id: &str, now: i64) -> bool {
        self.snapshots
            .read()
            .unwrap()
            .get(server_id)
            .is_some_and(|e| now - e.received_at < ONLINE_WINDOW_SECS)
    }

    /// Every server id that ever reported, registered or not.
    pub fn known_ids(&self) -> Vec<String> {
        self.snapshots.read().unwrap().keys().cloned().collect()
    }

    /// One fan-out tick: for each id, compare the current compact state
    /// against the last broadcast one and emit an update when the online bit
    /// flipped or at least one metric moved by its quantum.
    ///
    /// The whole tick holds the last-sent write lock, so its updates are
    /// packaged atomically; the last-sent entry for a server advances iff an
    /// update for it is returned.
    pub fn compute_tick(&self, ids: &[String], now: i64) -> Vec<DeltaUpdate> {
        let snapshots = self.snapshots.read().unwrap();
        let mut last_sent = self.last_sent.write().unwrap();
        let mut updates = Vec::new();

        for id in ids {
            let entry = snapshots.get(id);
            let compact = entry
                .map(|e| CompactMetrics::compact(&e.sample))
                .unwrap_or_default();
            let online = entry.is_some_and(|e| now - e.received_at < ONLINE_WINDOW_SECS);

            match last_sent.get_mut(id) {
                None => {
                    // First tick for this id: full compact, explicit online bit.
                    updates.push(DeltaUpdate {
                        id: id.clone(),
                        on: Some(online),
                        m: if compact.is_empty() {
                            None
                        } else {
                            Some(compact.clone())
                        },
                    });
                    last_sent.insert(
                        id.clone(),
                        SentEntry {
                            online,
                            metrics: compact,
                        },
                    );
                }
                Some(prev) => {
                    let flipped = prev.online != online;
                    let diff = compact.diff(&prev.metrics);
                    if flipped || !diff.is_empty() {
                        updates.push(DeltaUpdate {
                            id: id.clone(),
                            on: flipped.then_some(online),
                            m: if diff.is_empty() { None } else { Some(diff) },
                        });
                        prev.online = online;
                        prev.metrics = compact;
                    }
                }
            }
        }

        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CpuInfo;

    fn sample(cpu: f64) -> Sample {
        Sample {
            cpu: CpuInfo {
                usage_percent: cpu,
                ..CpuInfo::default()
            },
            ..Sample::default()
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_tick_emits_full_compact() {
        let live = LiveState::new();
        live.update("a", sample(42.0), 100);

        let updates = live.compute_tick(&ids(&["a"]), 100);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].on, Some(true));
        assert_eq!(updates[0].m.as_ref().unwrap().cpu, Some(42.0));
    }

    #[test]
    fn steady_state_emits_nothing() {
        let live = LiveState::new();
        live.update("a", sample(42.0), 100);
        live.compute_tick(&ids(&["a"]), 100);

        // Same snapshot content on the next tick: no update at all.
        assert!(live.compute_tick(&ids(&["a"]), 105).is_empty());

        // Below-quantum movement is also silence.
        live.update("a", sample(42.04), 110);
        assert!(live.compute_tick(&ids(&["a"]), 110).is_empty());
    }

    #[test]
    fn online_flips_exactly_once_after_window() {
        let live = LiveState::new();
        live.update("a", sample(42.0), 100);
        live.compute_tick(&ids(&["a"]), 100);

        // 29s after the last sample: still online, nothing to say.
        assert!(live.compute_tick(&ids(&["a"]), 129).is_empty());

        // 31s after: exactly one off-flip, metrics unchanged so no `m`.
        let updates = live.compute_tick(&ids(&["a"]), 131);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].on, Some(false));
        assert!(updates[0].m.is_none());

        // And only once.
        assert!(live.compute_tick(&ids(&["a"]), 136).is_empty());
    }

    #[test]
    fn unknown_server_starts_offline_and_empty() {
        let live = LiveState::new();
        let updates = live.compute_tick(&ids(&["ghost"]), 100);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].on, Some(false));
        assert!(updates[0].m.is_none());
        assert!(live.compute_tick(&ids(&["ghost"]), 105).is_empty());
    }

    #[test]
    fn last_sent_advances_only_with_emission() {
        let live = LiveState::new();
        live.update("a", sample(10.0), 100);
        live.compute_tick(&ids(&["a"]), 100);

        // Two small moves that each stay under the quantum relative to the
        // last *broadcast* value must eventually fire once they accumulate.
        live.update("a", sample(10.04), 101);
        assert!(live.compute_tick(&ids(&["a"]), 101).is_empty());
        live.update("a", sample(10.08), 102);
        let updates = live.compute_tick(&ids(&["a"]), 102);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].m.as_ref().unwrap().cpu, Some(10.1));
    }
}
