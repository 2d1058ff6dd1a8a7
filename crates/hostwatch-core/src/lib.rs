//! hostwatch-core — shared library for the hostwatch ecosystem.
//!
//! Provides:
//! - `metrics` — canonical Sample record and the compact delta codec
//! - `protocol` — wire frames for the agent and browser channels
//! - `store` — embedded time-series store with multi-resolution rollups
//! - `writer` — serialized single-thread write pipeline
//! - `live` — in-memory last-sample state and fan-out delta computation
//! - `registry` — façade types and traits over the server/probe configuration
//! - `collector` — local system metrics collection from /proc
//! - `probes` — connect-latency probing of configured ping targets

pub mod collector;
pub mod live;
pub mod metrics;
pub mod probes;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod writer;

/// Crate version, shared by the server and agent binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
