//! Periodic roll-up and TTL-based retention.
//!
//! Both run as writer jobs on an hourly cadence. Roll-up recomputes every
//! closed coarse bucket inside a lookback window from the full finer tier
//! via `INSERT OR REPLACE`, so re-running for the same boundary produces
//! the same rows.

use rusqlite::{Connection, params};

use super::{RAW_RETENTION_SECS, StoreError, Tier};

/// How many closed coarse buckets each roll-up pass recomputes. Generous
/// enough to catch up after a missed tick, bounded by the finer tier's
/// retention.
fn lookback_buckets(to: Tier) -> i64 {
    match to {
        Tier::FifteenMin => 8, // 2 h of 2-minute data (kept 24 h)
        Tier::Hour => 26,      // ~1 d of 15-minute data (kept 7 d)
        Tier::Day => 8,        // 8 d of hourly data (kept 30 d)
        _ => 0,
    }
}

fn rollup_pair(conn: &Connection, from: Tier, to: Tier, now: i64) -> Result<(), StoreError> {
    let fw = from.width_secs();
    let tw = to.width_secs();
    // Start of the still-open coarse bucket; only buckets before it roll up.
    let boundary = (now / tw) * tw;
    let window_start = boundary - lookback_buckets(to) * tw;

    let sql = format!(
        "INSERT OR REPLACE INTO {to_table}
            (server_id, bucket, cpu_sum, cpu_max, memory_sum, memory_max, disk_sum,
             net_rx, net_tx, rx_speed_sum, tx_speed_sum, ping_sum, ping_count, sample_count)
         SELECT server_id, (bucket * {fw}) / {tw},
                SUM(cpu_sum), MAX(cpu_max), SUM(memory_sum), MAX(memory_max), SUM(disk_sum),
                MAX(net_rx), MAX(net_tx), SUM(rx_speed_sum), SUM(tx_speed_sum),
                SUM(ping_sum), SUM(ping_count), SUM(sample_count)
         FROM {from_table}
         WHERE bucket * {fw} >= ?1 AND bucket * {fw} < ?2
         GROUP BY server_id, (bucket * {fw}) / {tw}",
        to_table = to.table(),
        from_table = from.table(),
    );
    conn.execute(&sql, params![window_start, boundary])?;

    let ping_sql = format!(
        "INSERT OR REPLACE INTO {to_table}
            (server_id, target, bucket, latency_sum, latency_max, latency_count,
             ok_count, fail_count)
         SELECT server_id, target, (bucket * {fw}) / {tw},
                SUM(latency_sum), MAX(latency_max), SUM(latency_count),
                SUM(ok_count), SUM(fail_count)
         FROM {from_table}
         WHERE bucket * {fw} >= ?1 AND bucket * {fw} < ?2
         GROUP BY server_id, target, (bucket * {fw}) / {tw}",
        to_table = to.ping_table(),
        from_table = from.ping_table(),
    );
    conn.execute(&ping_sql, params![window_start, boundary])?;

    Ok(())
}

/// One aggregation pass: 2 m → 15 m → hour → day, finest first so a
/// freshly produced tier feeds the next one in the same pass.
pub(crate) fn run_aggregation(conn: &Connection, now: i64) -> Result<(), StoreError> {
    rollup_pair(conn, Tier::TwoMin, Tier::FifteenMin, now)?;
    rollup_pair(conn, Tier::FifteenMin, Tier::Hour, now)?;
    rollup_pair(conn, Tier::Hour, Tier::Day, now)?;
    Ok(())
}

/// Deletes rows past each tier's retention window. Daily rollups are kept
/// indefinitely.
pub(crate) fn run_retention(conn: &Connection, now: i64) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM samples_raw WHERE ts < ?1",
        params![now - RAW_RETENTION_SECS],
    )?;
    conn.execute(
        "DELETE FROM ping_raw WHERE ts < ?1",
        params![now - RAW_RETENTION_SECS],
    )?;

    for tier in [Tier::FiveSec, Tier::TwoMin, Tier::FifteenMin, Tier::Hour, Tier::Day] {
        let Some(keep) = tier.retention_secs() else {
            continue;
        };
        let width = tier.width_secs();
        conn.execute(
            &format!("DELETE FROM {} WHERE bucket * {width} < ?1", tier.table()),
            params![now - keep],
        )?;
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE bucket * {width} < ?1",
                tier.ping_table()
            ),
            params![now - keep],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CpuInfo, PingResult, PingStatus, Sample};
    use crate::store::{HistoryRange, Store};
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
            ..Sample::default()
        }
    }

    fn dump_15m(store: &Store) -> Vec<(String, i64, f64, i64)> {
        let mut stmt = store
            .conn
            .prepare("SELECT server_id, bucket, cpu_sum, sample_count FROM rollup_15m ORDER BY bucket")
            .unwrap();
        stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    }

    #[test]
    fn aggregation_rolls_closed_buckets_upward() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        // Six samples inside one closed 15-minute bucket (999000/900 = 1110).
        for i in 0..6 {
            store
                .ingest_sample("a", &sample_at(999_000 + i * 20, 10.0 * (i + 1) as f64))
                .unwrap();
        }
        store.run_aggregation(now).unwrap();

        let rows = dump_15m(&store);
        assert_eq!(rows.len(), 1);
        let (ref id, bucket, cpu_sum, count) = rows[0];
        assert_eq!(id, "a");
        assert_eq!(bucket, 1110);
        assert_eq!(count, 6);
        assert!((cpu_sum - 210.0).abs() < 1e-9);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000;

        for i in 0..6 {
            store
                .ingest_sample("a", &sample_at(999_000 + i * 20, 25.0))
                .unwrap();
        }
        store.run_aggregation(now).unwrap();
        let first = dump_15m(&store);
        store.run_aggregation(now).unwrap();
        store.run_aggregation(now).unwrap();
        assert_eq!(dump_15m(&store), first);
    }

    #[test]
    fn open_bucket_is_not_rolled_up() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 1_000_000; // current 15m bucket starts at 999900

        // 999960 sits in a 2-minute bucket starting past the boundary.
        store.ingest_sample("a", &sample_at(999_960, 10.0)).unwrap();
        store.run_aggregation(now).unwrap();
        assert!(dump_15m(&store).is_empty());
    }

    #[test]
    fn cascade_reaches_the_daily_tier() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        for i in 0..4 {
            store
                .ingest_sample("a", &sample_at(900_000 + i * 30, 50.0))
                .unwrap();
        }
        // Hourly cadence: the pass shortly after the hour closes fills
        // 15m + hour; a later pass rolls the closed day.
        store.run_aggregation(905_000).unwrap();
        store.run_aggregation(1_000_000).unwrap();

        let (bucket, count): (i64, i64) = store
            .conn
            .query_row(
                "SELECT bucket, sample_count FROM rollup_day WHERE server_id='a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(bucket, 900_000 / 86400);
        assert_eq!(count, 4);

        // The month route now reads the hourly tier directly.
        let points = store
            .history("a", HistoryRange::Month, None, 1_000_000)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert!((points[0].cpu - 50.0).abs() < 1e-9);
        assert_eq!(points[0].samples, 4);
    }

    #[test]
    fn ping_rollups_cascade_with_counts_balanced() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        for (i, ok) in [true, false, true].into_iter().enumerate() {
            let mut sample = sample_at(999_000 + i as i64 * 10, 1.0);
            sample.ping = vec![PingResult {
                name: "CF".into(),
                host: "1.1.1.1".into(),
                latency_ms: ok.then_some(4.0),
                packet_loss: if ok { 0.0 } else { 100.0 },
                status: if ok { PingStatus::Ok } else { PingStatus::Timeout },
            }];
            store.ingest_sample("a", &sample).unwrap();
        }
        store.run_aggregation(1_000_000).unwrap();

        let (ok, fail): (i64, i64) = store
            .conn
            .query_row(
                "SELECT ok_count, fail_count FROM ping_15m WHERE server_id='a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((ok, fail), (2, 1));
    }

    #[test]
    fn retention_removes_expired_rows_per_tier() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let now = 10_000_000;

        // Old sample (past every inline retention) and a fresh one.
        store
            .ingest_sample("a", &sample_at(now - 2 * 86400, 10.0))
            .unwrap();
        store.ingest_sample("a", &sample_at(now - 60, 20.0)).unwrap();
        store.run_retention(now).unwrap();

        let oldest_raw: i64 = store
            .conn
            .query_row("SELECT MIN(ts) FROM samples_raw", [], |r| r.get(0))
            .unwrap();
        assert!(oldest_raw >= now - RAW_RETENTION_SECS);

        let stale_5s: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM rollup_5s WHERE bucket * 5 < ?1",
                params![now - 3600],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stale_5s, 0);
        let stale_2m: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM rollup_2m WHERE bucket * 120 < ?1",
                params![now - 86400],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stale_2m, 0);

        // The fresh sample survived.
        let remaining: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM samples_raw", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
