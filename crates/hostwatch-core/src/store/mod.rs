//! Embedded time-series store.
//!
//! SQLite in WAL mode with relaxed synchronous settings: one writer
//! connection owned by the writer thread, any number of concurrent read-only
//! connections. Raw samples land next to inline-maintained 5-second and
//! 2-minute rollups; 15-minute, hourly and daily tiers are produced by the
//! periodic aggregation jobs.

mod aggregate;
mod ingest;
mod query;
mod schema;

pub use query::{
    HistoryPoint, HistoryRange, MAX_POINTS, PingBucketStatus, PingPoint, PingSeries,
};

use std::fmt;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::metrics::Sample;

/// Errors produced by store operations and writer jobs.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Underlying SQLite failure.
    Sqlite(String),
    /// The writer queue has shut down.
    Closed,
    /// A writer job panicked; the writer itself survived.
    Panicked,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(msg) => write!(f, "sqlite error: {}", msg),
            StoreError::Closed => write!(f, "writer closed"),
            StoreError::Panicked => write!(f, "write job panicked"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

/// Rollup tiers, finest to coarsest. Raw rows sit below the finest tier and
/// are handled separately (they carry timestamps, not bucket keys).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    FiveSec,
    TwoMin,
    FifteenMin,
    Hour,
    Day,
}

impl Tier {
    /// Bucket width in seconds.
    pub fn width_secs(self) -> i64 {
        match self {
            Tier::FiveSec => 5,
            Tier::TwoMin => 120,
            Tier::FifteenMin => 900,
            Tier::Hour => 3600,
            Tier::Day => 86400,
        }
    }

    /// Retention in seconds; None means kept indefinitely.
    pub fn retention_secs(self) -> Option<i64> {
        match self {
            Tier::FiveSec => Some(3600),
            Tier::TwoMin => Some(86400),
            Tier::FifteenMin => Some(7 * 86400),
            Tier::Hour => Some(30 * 86400),
            Tier::Day => None,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Tier::FiveSec => "rollup_5s",
            Tier::TwoMin => "rollup_2m",
            Tier::FifteenMin => "rollup_15m",
            Tier::Hour => "rollup_hour",
            Tier::Day => "rollup_day",
        }
    }

    pub fn ping_table(self) -> &'static str {
        match self {
            Tier::FiveSec => "ping_5s",
            Tier::TwoMin => "ping_2m",
            Tier::FifteenMin => "ping_15m",
            Tier::Hour => "ping_hour",
            Tier::Day => "ping_day",
        }
    }
}

/// Raw samples are kept for 24 hours.
pub const RAW_RETENTION_SECS: i64 = 86400;

/// Handle over one SQLite connection.
///
/// The writer thread owns a writable `Store`; HTTP handlers open short-lived
/// read-only ones. WAL mode keeps readers from ever blocking the writer.
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Opens (creating if needed) the database and applies the pragmas the
    /// single-writer model relies on. Called once at boot, through the
    /// writer; failure here is the only fatal store condition.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(Self { conn })
    }

    /// Opens a read-only connection for concurrent query use.
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(Self { conn })
    }

    /// Creates all tables and indices. Idempotent.
    pub fn migrate(&mut self) -> Result<(), StoreError> {
        schema::apply(&self.conn)
    }

    /// Persists one Sample: raw row plus 5-second and 2-minute rollup
    /// UPSERTs, atomically in one transaction.
    pub fn ingest_sample(&mut self, server_id: &str, sample: &Sample) -> Result<(), StoreError> {
        ingest::ingest_sample(&mut self.conn, server_id, sample)
    }

    /// Range-routed history read. `since_bucket` returns only buckets
    /// strictly newer than the given index (in the range's bucket width).
    pub fn history(
        &self,
        server_id: &str,
        range: HistoryRange,
        since_bucket: Option<i64>,
        now: i64,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        query::history(&self.conn, server_id, range, since_bucket, now)
    }

    /// Per-target ping history with the same tiering as [`Self::history`].
    pub fn ping_history(
        &self,
        server_id: &str,
        range: HistoryRange,
        now: i64,
    ) -> Result<Vec<PingSeries>, StoreError> {
        query::ping_history(&self.conn, server_id, range, now)
    }

    /// Rolls closed 2-minute buckets into the 15-minute tier, 15-minute into
    /// hourly, hourly into daily. Idempotent for a given boundary.
    pub fn run_aggregation(&mut self, now: i64) -> Result<(), StoreError> {
        aggregate::run_aggregation(&self.conn, now)
    }

    /// Deletes rows past each tier's retention window.
    pub fn run_retention(&mut self, now: i64) -> Result<(), StoreError> {
        aggregate::run_retention(&self.conn, now)
    }
}
