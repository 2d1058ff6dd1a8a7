//! Table and index definitions.
//!
//! Two parallel hierarchies: metric rollups keyed by `(server_id, bucket)`
//! and ping rollups keyed by `(server_id, target, bucket)`. The primary keys
//! double as the lookup indices for the range query router.

use rusqlite::Connection;

use super::StoreError;

pub(crate) const SCHEMA_VERSION: i32 = 1;

/// Metric rollup column set shared by all five tiers.
const ROLLUP_COLUMNS: &str = "\
    server_id     TEXT    NOT NULL,
    bucket        INTEGER NOT NULL,
    cpu_sum       REAL    NOT NULL,
    cpu_max       REAL    NOT NULL,
    memory_sum    REAL    NOT NULL,
    memory_max    REAL    NOT NULL,
    disk_sum      REAL    NOT NULL,
    net_rx        INTEGER NOT NULL,
    net_tx        INTEGER NOT NULL,
    rx_speed_sum  INTEGER NOT NULL,
    tx_speed_sum  INTEGER NOT NULL,
    ping_sum      REAL    NOT NULL,
    ping_count    INTEGER NOT NULL,
    sample_count  INTEGER NOT NULL,
    PRIMARY KEY (server_id, bucket)";

/// Ping rollup column set shared by all five ping tiers.
const PING_COLUMNS: &str = "\
    server_id     TEXT    NOT NULL,
    target        TEXT    NOT NULL,
    bucket        INTEGER NOT NULL,
    latency_sum   REAL    NOT NULL,
    latency_max   REAL    NOT NULL,
    latency_count INTEGER NOT NULL,
    ok_count      INTEGER NOT NULL,
    fail_count    INTEGER NOT NULL,
    PRIMARY KEY (server_id, target, bucket)";

pub(crate) fn apply(conn: &Connection) -> Result<(), StoreError> {
    let mut ddl = String::new();

    ddl.push_str(
        "CREATE TABLE IF NOT EXISTS samples_raw (
            server_id  TEXT    NOT NULL,
            ts         INTEGER NOT NULL,
            bucket_5s  INTEGER NOT NULL,
            bucket_2m  INTEGER NOT NULL,
            cpu        REAL    NOT NULL,
            memory_pct REAL    NOT NULL,
            disk_pct   REAL    NOT NULL,
            net_rx     INTEGER NOT NULL,
            net_tx     INTEGER NOT NULL,
            rx_speed   INTEGER NOT NULL,
            tx_speed   INTEGER NOT NULL,
            load1      REAL    NOT NULL,
            load5      REAL    NOT NULL,
            load15     REAL    NOT NULL,
            ping_avg   REAL
        );
        CREATE INDEX IF NOT EXISTS idx_samples_raw_server_ts
            ON samples_raw (server_id, ts);
        CREATE TABLE IF NOT EXISTS ping_raw (
            server_id  TEXT    NOT NULL,
            target     TEXT    NOT NULL,
            ts         INTEGER NOT NULL,
            bucket_5s  INTEGER NOT NULL,
            bucket_2m  INTEGER NOT NULL,
            latency    REAL,
            loss       REAL    NOT NULL,
            ok         INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ping_raw_server_ts
            ON ping_raw (server_id, target, ts);
        ",
    );

    for table in ["rollup_5s", "rollup_2m", "rollup_15m", "rollup_hour", "rollup_day"] {
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({ROLLUP_COLUMNS});\n"
        ));
    }
    for table in ["ping_5s", "ping_2m", "ping_15m", "ping_hour", "ping_day"] {
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({PING_COLUMNS});\n"
        ));
    }

    conn.execute_batch(&ddl)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
