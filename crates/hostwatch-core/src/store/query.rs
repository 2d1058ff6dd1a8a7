//! Range query router.
//!
//! Each chart range maps to the rollup tier whose bucket width keeps the
//! response at or under [`MAX_POINTS`] points. Coarse tiers may be empty on
//! a fresh install (aggregation has not run yet), so the 7d/30d/1y routes
//! fall back to grouping a finer source on the fly.

use std::collections::BTreeMap;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use super::{StoreError, Tier};

/// Hard cap on points per response; the most recent buckets win.
pub const MAX_POINTS: usize = 720;

/// Chart range selector. An unknown range parameter defaults to `24h`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryRange {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl HistoryRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(HistoryRange::Hour),
            "24h" => Some(HistoryRange::Day),
            "7d" => Some(HistoryRange::Week),
            "30d" => Some(HistoryRange::Month),
            "1y" => Some(HistoryRange::Year),
            _ => None,
        }
    }

    /// Lenient parse for query parameters: bad input means `24h`.
    pub fn from_param(s: &str) -> Self {
        Self::parse(s).unwrap_or(HistoryRange::Day)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HistoryRange::Hour => "1h",
            HistoryRange::Day => "24h",
            HistoryRange::Week => "7d",
            HistoryRange::Month => "30d",
            HistoryRange::Year => "1y",
        }
    }

    pub fn span_secs(self) -> i64 {
        match self {
            HistoryRange::Hour => 3600,
            HistoryRange::Day => 86400,
            HistoryRange::Week => 7 * 86400,
            HistoryRange::Month => 30 * 86400,
            HistoryRange::Year => 365 * 86400,
        }
    }

    /// Width of the buckets in the response.
    pub fn bucket_width(self) -> i64 {
        match self {
            HistoryRange::Hour => 5,
            HistoryRange::Day => 120,
            HistoryRange::Week => 900,
            HistoryRange::Month => 3600,
            HistoryRange::Year => 43200,
        }
    }
}

/// One aggregated point of a metric history response.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct HistoryPoint {
    /// Bucket start, epoch seconds.
    pub ts: i64,
    /// Bucket index in units of the range's bucket width; feed the highest
    /// one back as `since` for incremental reads.
    pub bucket: i64,
    pub cpu: f64,
    pub cpu_max: f64,
    pub memory: f64,
    pub memory_max: f64,
    pub disk: f64,
    /// Highest cumulative rx counter observed in the bucket.
    pub net_rx: u64,
    pub net_tx: u64,
    /// Bytes received during the bucket, derived from the preceding bucket
    /// (for `since` reads, the newest bucket at or before `since`); 0 when
    /// no earlier bucket is known and across counter resets.
    pub net_rx_delta: u64,
    pub net_tx_delta: u64,
    /// Mean speeds over the bucket, bytes/s.
    pub rx_speed: u64,
    pub tx_speed: u64,
    /// Mean probe latency; null when no probe in the bucket succeeded.
    pub ping: Option<f64>,
    pub samples: u64,
}

/// Aggregated status of one ping bucket: `error` iff any probe in it failed.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PingBucketStatus {
    Ok,
    Error,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PingPoint {
    pub ts: i64,
    pub latency: Option<f64>,
    pub latency_max: f64,
    /// `100 · ok / (ok + fail)`.
    pub uptime: f64,
    pub samples: u64,
    pub status: PingBucketStatus,
}

/// All points for one probe target.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PingSeries {
    pub target: String,
    pub points: Vec<PingPoint>,
}

/// Raw aggregate row, identical across the three query shapes.
struct AggRow {
    bucket: i64,
    cpu_sum: f64,
    cpu_max: f64,
    memory_sum: f64,
    memory_max: f64,
    disk_sum: f64,
    net_rx: i64,
    net_tx: i64,
    rx_speed_sum: i64,
    tx_speed_sum: i64,
    ping_sum: f64,
    ping_count: i64,
    sample_count: i64,
}

fn agg_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AggRow> {
    Ok(AggRow {
        bucket: row.get(0)?,
        cpu_sum: row.get(1)?,
        cpu_max: row.get(2)?,
        memory_sum: row.get(3)?,
        memory_max: row.get(4)?,
        disk_sum: row.get(5)?,
        net_rx: row.get(6)?,
        net_tx: row.get(7)?,
        rx_speed_sum: row.get(8)?,
        tx_speed_sum: row.get(9)?,
        ping_sum: row.get(10)?,
        ping_count: row.get(11)?,
        sample_count: row.get(12)?,
    })
}

/// Most recent `MAX_POINTS` rows of one tier, ascending.
fn read_tier(
    conn: &Connection,
    tier: Tier,
    server_id: &str,
    cutoff_bucket: i64,
) -> Result<Vec<AggRow>, StoreError> {
    let sql = format!(
        "SELECT bucket, cpu_sum, cpu_max, memory_sum, memory_max, disk_sum,
                net_rx, net_tx, rx_speed_sum, tx_speed_sum, ping_sum, ping_count, sample_count
         FROM {}
         WHERE server_id = ?1 AND bucket >= ?2
         ORDER BY bucket DESC LIMIT {MAX_POINTS}",
        tier.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params![server_id, cutoff_bucket], agg_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

/// Groups a finer rollup tier into `out_width`-second buckets, ascending.
fn read_grouped(
    conn: &Connection,
    source: Tier,
    out_width: i64,
    server_id: &str,
    cutoff_secs: i64,
) -> Result<Vec<AggRow>, StoreError> {
    let fw = source.width_secs();
    let sql = format!(
        "SELECT (bucket * {fw}) / {out_width} AS b,
                SUM(cpu_sum), MAX(cpu_max), SUM(memory_sum), MAX(memory_max), SUM(disk_sum),
                MAX(net_rx), MAX(net_tx), SUM(rx_speed_sum), SUM(tx_speed_sum),
                SUM(ping_sum), SUM(ping_count), SUM(sample_count)
         FROM {}
         WHERE server_id = ?1 AND bucket * {fw} >= ?2
         GROUP BY b
         ORDER BY b DESC LIMIT {MAX_POINTS}",
        source.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params![server_id, cutoff_secs], agg_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

/// Groups raw sample rows into `out_width`-second buckets, ascending.
fn read_raw_grouped(
    conn: &Connection,
    out_width: i64,
    server_id: &str,
    cutoff_secs: i64,
) -> Result<Vec<AggRow>, StoreError> {
    let sql = format!(
        "SELECT ts / {out_width} AS b,
                SUM(cpu), MAX(cpu), SUM(memory_pct), MAX(memory_pct), SUM(disk_pct),
                MAX(net_rx), MAX(net_tx), SUM(rx_speed), SUM(tx_speed),
                SUM(COALESCE(ping_avg, 0)), SUM(ping_avg IS NOT NULL), COUNT(*)
         FROM samples_raw
         WHERE server_id = ?1 AND ts >= ?2
         GROUP BY b
         ORDER BY b DESC LIMIT {MAX_POINTS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params![server_id, cutoff_secs], agg_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

/// Derives means and network deltas from ascending aggregate rows.
/// `seed` carries the cumulative counters of the bucket preceding the first
/// row, so a `since`-bounded read derives the same deltas as a full one.
fn to_points(rows: Vec<AggRow>, width: i64, seed: Option<(u64, u64)>) -> Vec<HistoryPoint> {
    let mut prev_net: Option<(u64, u64)> = seed;
    rows.into_iter()
        .map(|r| {
            let n = r.sample_count;
            let mean = |sum: f64| if n > 0 { sum / n as f64 } else { 0.0 };
            let net_rx = r.net_rx.max(0) as u64;
            let net_tx = r.net_tx.max(0) as u64;
            let (rx_delta, tx_delta) = match prev_net {
                Some((prx, ptx)) => (net_rx.saturating_sub(prx), net_tx.saturating_sub(ptx)),
                None => (0, 0),
            };
            prev_net = Some((net_rx, net_tx));
            HistoryPoint {
                ts: r.bucket * width,
                bucket: r.bucket,
                cpu: mean(r.cpu_sum),
                cpu_max: r.cpu_max,
                memory: mean(r.memory_sum),
                memory_max: r.memory_max,
                disk: mean(r.disk_sum),
                net_rx,
                net_tx,
                net_rx_delta: rx_delta,
                net_tx_delta: tx_delta,
                rx_speed: mean(r.rx_speed_sum as f64) as u64,
                tx_speed: mean(r.tx_speed_sum as f64) as u64,
                ping: if r.ping_count > 0 {
                    Some(r.ping_sum / r.ping_count as f64)
                } else {
                    None
                },
                samples: n.max(0) as u64,
            }
        })
        .collect()
}

pub(crate) fn history(
    conn: &Connection,
    server_id: &str,
    range: HistoryRange,
    since_bucket: Option<i64>,
    now: i64,
) -> Result<Vec<HistoryPoint>, StoreError> {
    let width = range.bucket_width();
    let cutoff = now - range.span_secs();

    let rows = match range {
        HistoryRange::Hour => read_tier(conn, Tier::FiveSec, server_id, cutoff / 5)?,
        HistoryRange::Day => read_tier(conn, Tier::TwoMin, server_id, cutoff / 120)?,
        HistoryRange::Week => {
            let rows = read_tier(conn, Tier::FifteenMin, server_id, cutoff / 900)?;
            if rows.is_empty() {
                read_raw_grouped(conn, width, server_id, cutoff)?
            } else {
                rows
            }
        }
        HistoryRange::Month => {
            let rows = read_tier(conn, Tier::Hour, server_id, cutoff / 3600)?;
            if rows.is_empty() {
                read_grouped(conn, Tier::TwoMin, width, server_id, cutoff)?
            } else {
                rows
            }
        }
        HistoryRange::Year => {
            let rows = read_grouped(conn, Tier::Hour, width, server_id, cutoff)?;
            if rows.is_empty() {
                read_grouped(conn, Tier::TwoMin, width, server_id, cutoff)?
            } else {
                rows
            }
        }
    };

    // A since-bounded read sees the same capped window as a full one; the
    // buckets at or before `since` only seed the network deltas, so both
    // reads derive identical content for every bucket they share.
    let (rows, seed) = match since_bucket {
        Some(since) => {
            let mut seed = None;
            let mut newer = Vec::with_capacity(rows.len());
            for row in rows {
                if row.bucket > since {
                    newer.push(row);
                } else {
                    seed = Some((row.net_rx.max(0) as u64, row.net_tx.max(0) as u64));
                }
            }
            (newer, seed)
        }
        None => (rows, None),
    };

    Ok(to_points(rows, width, seed))
}

// ------------------------------------------------------------------
// Ping history
// ------------------------------------------------------------------

struct PingAggRow {
    target: String,
    bucket: i64,
    latency_sum: f64,
    latency_max: f64,
    latency_count: i64,
    ok_count: i64,
    fail_count: i64,
}

fn ping_agg_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PingAggRow> {
    Ok(PingAggRow {
        target: row.get(0)?,
        bucket: row.get(1)?,
        latency_sum: row.get(2)?,
        latency_max: row.get(3)?,
        latency_count: row.get(4)?,
        ok_count: row.get(5)?,
        fail_count: row.get(6)?,
    })
}

fn read_ping_tier(
    conn: &Connection,
    tier: Tier,
    server_id: &str,
    cutoff_bucket: i64,
) -> Result<Vec<PingAggRow>, StoreError> {
    let sql = format!(
        "SELECT target, bucket, latency_sum, latency_max, latency_count, ok_count, fail_count
         FROM {}
         WHERE server_id = ?1 AND bucket >= ?2
         ORDER BY target, bucket",
        tier.ping_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![server_id, cutoff_bucket], ping_agg_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn read_ping_grouped(
    conn: &Connection,
    source: Tier,
    out_width: i64,
    server_id: &str,
    cutoff_secs: i64,
) -> Result<Vec<PingAggRow>, StoreError> {
    let fw = source.width_secs();
    let sql = format!(
        "SELECT target, (bucket * {fw}) / {out_width} AS b,
                SUM(latency_sum), MAX(latency_max), SUM(latency_count),
                SUM(ok_count), SUM(fail_count)
         FROM {}
         WHERE server_id = ?1 AND bucket * {fw} >= ?2
         GROUP BY target, b
         ORDER BY target, b",
        source.ping_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![server_id, cutoff_secs], ping_agg_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn read_ping_raw_grouped(
    conn: &Connection,
    out_width: i64,
    server_id: &str,
    cutoff_secs: i64,
) -> Result<Vec<PingAggRow>, StoreError> {
    let sql = format!(
        "SELECT target, ts / {out_width} AS b,
                SUM(COALESCE(latency, 0)), MAX(COALESCE(latency, 0)),
                SUM(latency IS NOT NULL), SUM(ok), SUM(1 - ok)
         FROM ping_raw
         WHERE server_id = ?1 AND ts >= ?2
         GROUP BY target, b
         ORDER BY target, b"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![server_id, cutoff_secs], ping_agg_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn ping_history(
    conn: &Connection,
    server_id: &str,
    range: HistoryRange,
    now: i64,
) -> Result<Vec<PingSeries>, StoreError> {
    let width = range.bucket_width();
    let cutoff = now - range.span_secs();

    let rows = match range {
        HistoryRange::Hour => read_ping_tier(conn, Tier::FiveSec, server_id, cutoff / 5)?,
        HistoryRange::Day => read_ping_tier(conn, Tier::TwoMin, server_id, cutoff / 120)?,
        HistoryRange::Week => {
            let rows = read_ping_tier(conn, Tier::FifteenMin, server_id, cutoff / 900)?;
            if rows.is_empty() {
                read_ping_raw_grouped(conn, width, server_id, cutoff)?
            } else {
                rows
            }
        }
        HistoryRange::Month => {
            let rows = read_ping_tier(conn, Tier::Hour, server_id, cutoff / 3600)?;
            if rows.is_empty() {
                read_ping_grouped(conn, Tier::TwoMin, width, server_id, cutoff)?
            } else {
                rows
            }
        }
        HistoryRange::Year => {
            let rows = read_ping_grouped(conn, Tier::Hour, width, server_id, cutoff)?;
            if rows.is_empty() {
                read_ping_grouped(conn, Tier::TwoMin, width, server_id, cutoff)?
            } else {
                rows
            }
        }
    };

    // One ascending series per target, capped at the most recent points.
    let mut series: BTreeMap<String, Vec<PingPoint>> = BTreeMap::new();
    for r in rows {
        let total = r.ok_count + r.fail_count;
        series.entry(r.target).or_default().push(PingPoint {
            ts: r.bucket * width,
            latency: if r.latency_count > 0 {
                Some(r.latency_sum / r.latency_count as f64)
            } else {
                None
            },
            latency_max: r.latency_max,
            uptime: if total > 0 {
                100.0 * r.ok_count as f64 / total as f64
            } else {
                0.0
            },
            samples: total.max(0) as u64,
            status: if r.fail_count > 0 {
                PingBucketStatus::Error
            } else {
                PingBucketStatus::Ok
            },
        });
    }

    Ok(series
        .into_iter()
        .map(|(target, mut points)| {
            if points.len() > MAX_POINTS {
                points.drain(..points.len() - MAX_POINTS);
            }
            PingSeries { target, points }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CpuInfo, PingResult, PingStatus, Sample};
    use crate::store::Store;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> Store {
        let mut store = Store::open(&dir.join("test.db")).unwrap();
        store.migrate().unwrap();
        store
    }

    fn sample_at(ts: i64, cpu: f64) -> Sample {
        Sample {
            timestamp: ts,
            cpu: CpuInfo {
                usage_percent: cpu,
                ..CpuInfo::default()
            },
            net_rx_total: (ts as u64) * 10,
            net_tx_total: (ts as u64) * 2,
            rx_speed: 100,
            tx_speed: 50,
            ..Sample::default()
        }
    }

    #[test]
    fn range_param_defaults_to_24h() {
        assert_eq!(HistoryRange::from_param("1h"), HistoryRange::Hour);
        assert_eq!(HistoryRange::from_param("1y"), HistoryRange::Year);
        assert_eq!(HistoryRange::from_param("nonsense"), HistoryRange::Day);
        assert_eq!(HistoryRange::from_param(""), HistoryRange::Day);
    }

    #[test]
    fn hour_range_is_ascending_and_unique() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        for i in 0..60 {
            store
                .ingest_sample("a", &sample_at(now - 300 + i * 5, 10.0 + i as f64))
                .unwrap();
        }

        let points = store.history("a", HistoryRange::Hour, None, now).unwrap();
        assert_eq!(points.len(), 60);
        assert!(points.len() <= MAX_POINTS);
        for pair in points.windows(2) {
            assert!(pair[0].bucket < pair[1].bucket);
        }
    }

    #[test]
    fn day_range_caps_at_720_most_recent() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 2_000_000;

        // One sample per 2-minute bucket, 750 buckets: more than the cap.
        for i in 0..750 {
            store
                .ingest_sample("a", &sample_at(now - i * 120, 50.0))
                .unwrap();
        }

        let points = store.history("a", HistoryRange::Day, None, now).unwrap();
        assert_eq!(points.len(), MAX_POINTS);
        // The newest bucket must be present; oldest ones were dropped.
        assert_eq!(points.last().unwrap().bucket, now / 120);
        for pair in points.windows(2) {
            assert!(pair[0].bucket < pair[1].bucket);
        }
    }

    #[test]
    fn since_bucket_returns_exactly_the_newer_suffix() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        for i in 0..10 {
            store
                .ingest_sample("a", &sample_at(now - i * 120, 10.0))
                .unwrap();
        }

        let full = store.history("a", HistoryRange::Day, None, now).unwrap();
        let k = full[4].bucket;
        let inc = store.history("a", HistoryRange::Day, Some(k), now).unwrap();

        // Not just the same bucket indices: every field, network deltas
        // included, must match the full read point for point.
        let expected: Vec<HistoryPoint> =
            full.iter().filter(|p| p.bucket > k).cloned().collect();
        assert_eq!(inc, expected);
        // The first incremental point keeps its true delta against the
        // bucket at `since` instead of restarting the baseline at zero.
        assert!(inc[0].net_rx_delta > 0);
    }

    #[test]
    fn week_range_falls_back_to_raw_before_aggregation() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        for i in 0..30 {
            store
                .ingest_sample("a", &sample_at(now - 3000 + i * 100, 40.0))
                .unwrap();
        }

        // rollup_15m is still empty; the router must group raw rows.
        let points = store.history("a", HistoryRange::Week, None, now).unwrap();
        assert!(!points.is_empty());
        assert_eq!(points.iter().map(|p| p.samples).sum::<u64>(), 30);
        for p in &points {
            assert!((p.cpu - 40.0).abs() < 1e-9);
            assert_eq!(p.ts, p.bucket * 900);
        }
    }

    #[test]
    fn network_deltas_follow_the_cumulative_counter() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        // Two samples per 2m bucket over three buckets.
        for i in 0..6 {
            store
                .ingest_sample("a", &sample_at(now - 600 + i * 60, 10.0))
                .unwrap();
        }

        let points = store.history("a", HistoryRange::Day, None, now).unwrap();
        assert_eq!(points[0].net_rx_delta, 0);
        for pair in points.windows(2) {
            assert_eq!(
                pair[1].net_rx_delta,
                pair[1].net_rx - pair[0].net_rx,
                "delta must match counter movement"
            );
        }
    }

    #[test]
    fn empty_ping_bucket_reports_null_latency_not_zero() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        let mut sample = sample_at(now - 10, 10.0);
        sample.ping = vec![PingResult {
            name: "CF".into(),
            host: "1.1.1.1".into(),
            latency_ms: None,
            packet_loss: 100.0,
            status: PingStatus::Timeout,
        }];
        store.ingest_sample("a", &sample).unwrap();

        let series = store.ping_history("a", HistoryRange::Hour, now).unwrap();
        assert_eq!(series.len(), 1);
        let point = &series[0].points[0];
        assert_eq!(point.latency, None);
        assert_eq!(point.status, PingBucketStatus::Error);
        assert_eq!(point.uptime, 0.0);
    }

    #[test]
    fn ping_uptime_identity_holds() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        for (i, ok) in [true, true, true, false].into_iter().enumerate() {
            let mut sample = sample_at(now - 100 + i as i64, 10.0);
            sample.ping = vec![PingResult {
                name: "CF".into(),
                host: "1.1.1.1".into(),
                latency_ms: ok.then_some(8.0),
                packet_loss: if ok { 0.0 } else { 100.0 },
                status: if ok { PingStatus::Ok } else { PingStatus::Error },
            }];
            store.ingest_sample("a", &sample).unwrap();
        }

        let series = store.ping_history("a", HistoryRange::Day, now).unwrap();
        let point = &series[0].points[0];
        assert_eq!(point.samples, 4);
        assert!((point.uptime - 75.0).abs() < 1e-9);
        assert_eq!(point.status, PingBucketStatus::Error);
        assert_eq!(point.latency, Some(8.0));
    }
}
