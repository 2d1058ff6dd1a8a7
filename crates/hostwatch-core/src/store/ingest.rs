//! Ingest path: raw INSERT plus inline rollup UPSERTs.
//!
//! Every Sample produces exactly one raw row and one UPSERT per inline tier
//! (5-second and 2-minute), all in a single transaction. Coarser tiers are
//! filled later by aggregation.

use rusqlite::{Connection, Transaction, params};

use super::{StoreError, Tier};
use crate::metrics::{PingStatus, Sample};

const INSERT_RAW: &str = "\
    INSERT INTO samples_raw
        (server_id, ts, bucket_5s, bucket_2m, cpu, memory_pct, disk_pct,
         net_rx, net_tx, rx_speed, tx_speed, load1, load5, load15, ping_avg)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)";

const INSERT_PING_RAW: &str = "\
    INSERT INTO ping_raw (server_id, target, ts, bucket_5s, bucket_2m, latency, loss, ok)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

fn upsert_rollup_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table}
            (server_id, bucket, cpu_sum, cpu_max, memory_sum, memory_max, disk_sum,
             net_rx, net_tx, rx_speed_sum, tx_speed_sum, ping_sum, ping_count, sample_count)
         VALUES (?1, ?2, ?3, ?3, ?4, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1)
         ON CONFLICT (server_id, bucket) DO UPDATE SET
            cpu_sum      = cpu_sum + excluded.cpu_sum,
            cpu_max      = MAX(cpu_max, excluded.cpu_max),
            memory_sum   = memory_sum + excluded.memory_sum,
            memory_max   = MAX(memory_max, excluded.memory_max),
            disk_sum     = disk_sum + excluded.disk_sum,
            net_rx       = MAX(net_rx, excluded.net_rx),
            net_tx       = MAX(net_tx, excluded.net_tx),
            rx_speed_sum = rx_speed_sum + excluded.rx_speed_sum,
            tx_speed_sum = tx_speed_sum + excluded.tx_speed_sum,
            ping_sum     = ping_sum + excluded.ping_sum,
            ping_count   = ping_count + excluded.ping_count,
            sample_count = sample_count + 1"
    )
}

fn upsert_ping_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table}
            (server_id, target, bucket, latency_sum, latency_max, latency_count,
             ok_count, fail_count)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7)
         ON CONFLICT (server_id, target, bucket) DO UPDATE SET
            latency_sum   = latency_sum + excluded.latency_sum,
            latency_max   = MAX(latency_max, excluded.latency_max),
            latency_count = latency_count + excluded.latency_count,
            ok_count      = ok_count + excluded.ok_count,
            fail_count    = fail_count + excluded.fail_count"
    )
}

pub(crate) fn ingest_sample(
    conn: &mut Connection,
    server_id: &str,
    sample: &Sample,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    insert_raw(&tx, server_id, sample)?;
    upsert_metric_tiers(&tx, server_id, sample)?;
    upsert_ping_tiers(&tx, server_id, sample)?;
    tx.commit()?;
    Ok(())
}

fn insert_raw(tx: &Transaction<'_>, server_id: &str, sample: &Sample) -> Result<(), StoreError> {
    let ts = sample.timestamp;
    tx.execute(
        INSERT_RAW,
        params![
            server_id,
            ts,
            ts / Tier::FiveSec.width_secs(),
            ts / Tier::TwoMin.width_secs(),
            sample.cpu.usage_percent,
            sample.memory_percent(),
            sample.primary_disk_percent(),
            sample.net_rx_total as i64,
            sample.net_tx_total as i64,
            sample.rx_speed as i64,
            sample.tx_speed as i64,
            sample.load.one,
            sample.load.five,
            sample.load.fifteen,
            sample.mean_ping(),
        ],
    )?;
    Ok(())
}

fn upsert_metric_tiers(
    tx: &Transaction<'_>,
    server_id: &str,
    sample: &Sample,
) -> Result<(), StoreError> {
    let mean_ping = sample.mean_ping();
    for tier in [Tier::FiveSec, Tier::TwoMin] {
        let bucket = sample.timestamp / tier.width_secs();
        tx.execute(
            &upsert_rollup_sql(tier.table()),
            params![
                server_id,
                bucket,
                sample.cpu.usage_percent,
                sample.memory_percent(),
                sample.primary_disk_percent(),
                sample.net_rx_total as i64,
                sample.net_tx_total as i64,
                sample.rx_speed as i64,
                sample.tx_speed as i64,
                mean_ping.unwrap_or(0.0),
                i64::from(mean_ping.is_some()),
            ],
        )?;
    }
    Ok(())
}

fn upsert_ping_tiers(
    tx: &Transaction<'_>,
    server_id: &str,
    sample: &Sample,
) -> Result<(), StoreError> {
    for probe in &sample.ping {
        let ok = probe.status == PingStatus::Ok;
        tx.execute(
            INSERT_PING_RAW,
            params![
                server_id,
                probe.name,
                sample.timestamp,
                sample.timestamp / Tier::FiveSec.width_secs(),
                sample.timestamp / Tier::TwoMin.width_secs(),
                probe.latency_ms,
                probe.packet_loss,
                i64::from(ok),
            ],
        )?;
        for tier in [Tier::FiveSec, Tier::TwoMin] {
            let bucket = sample.timestamp / tier.width_secs();
            tx.execute(
                &upsert_ping_sql(tier.ping_table()),
                params![
                    server_id,
                    probe.name,
                    bucket,
                    probe.latency_ms.unwrap_or(0.0),
                    i64::from(probe.latency_ms.is_some()),
                    i64::from(ok),
                    i64::from(!ok),
                ],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CpuInfo, MemoryInfo, PingResult};
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
            memory: MemoryInfo {
                used: 1,
                total: 2,
                available: 1,
                ..MemoryInfo::default()
            },
            ..Sample::default()
        }
    }

    #[test]
    fn every_sample_lands_in_raw_and_both_inline_tiers() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        store.ingest_sample("a", &sample_at(1000, 10.0)).unwrap();
        store.ingest_sample("a", &sample_at(1005, 20.0)).unwrap();

        let raw: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM samples_raw", [], |r| r.get(0))
            .unwrap();
        assert_eq!(raw, 2);

        // 1000 and 1005 fall into distinct 5s buckets but one 2m bucket.
        let five: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM rollup_5s", [], |r| r.get(0))
            .unwrap();
        assert_eq!(five, 2);
        let (count, cpu_sum, cpu_max): (i64, f64, f64) = store
            .conn
            .query_row(
                "SELECT sample_count, cpu_sum, cpu_max FROM rollup_2m WHERE server_id='a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert!((cpu_sum - 30.0).abs() < 1e-9);
        assert!((cpu_max - 20.0).abs() < 1e-9);
    }

    #[test]
    fn rollup_mean_matches_sample_mean_within_one_bucket() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        // 24 samples at 5s intervals inside one 2-minute bucket.
        let base = 240_000; // multiple of 120
        let mut expected_sum = 0.0;
        for i in 0..24 {
            let cpu = 10.0 * (i + 1) as f64;
            expected_sum += cpu;
            store
                .ingest_sample("a", &sample_at(base + i * 5, cpu))
                .unwrap();
        }

        let (count, sum, max): (i64, f64, f64) = store
            .conn
            .query_row(
                "SELECT sample_count, cpu_sum, cpu_max FROM rollup_2m WHERE server_id='a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 24);
        assert!((sum / count as f64 - expected_sum / 24.0).abs() < 1e-9);
        assert!((max - 240.0).abs() < 1e-9);
    }

    #[test]
    fn ping_counts_balance() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        for (i, status) in [PingStatus::Ok, PingStatus::Ok, PingStatus::Timeout]
            .into_iter()
            .enumerate()
        {
            let mut sample = sample_at(1000 + i as i64, 1.0);
            sample.ping = vec![PingResult {
                name: "CF".into(),
                host: "1.1.1.1".into(),
                latency_ms: (status == PingStatus::Ok).then_some(5.0),
                packet_loss: if status == PingStatus::Ok { 0.0 } else { 100.0 },
                status,
            }];
            store.ingest_sample("a", &sample).unwrap();
        }

        let (ok, fail, lat_count): (i64, i64, i64) = store
            .conn
            .query_row(
                "SELECT ok_count, fail_count, latency_count FROM ping_2m
                 WHERE server_id='a' AND target='CF'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(ok + fail, 3);
        assert_eq!(ok, 2);
        assert_eq!(lat_count, 2);
    }
}
