//! Wire frames exchanged on the persistent duplex channels.
//!
//! All frames are JSON text, internally tagged with `type`. Malformed or
//! unknown frames are a protocol error: the receiver drops the frame and
//! keeps the connection, so one bad message cannot cause a reconnect storm.

use serde::{Deserialize, Serialize};

use crate::metrics::{CompactMetrics, Sample};
use crate::registry::{PingTarget, SiteSettings};

/// Frames an agent sends to the server.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Auth {
        server_id: String,
        token: String,
        version: String,
    },
    Metrics {
        metrics: Box<Sample>,
    },
}

/// Frames the server sends to an agent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Successful auth. Carries the current probe target list (may be empty).
    Ok { ping_targets: Vec<PingTarget> },
    Error {
        message: String,
    },
    /// Operator changed the probe settings.
    Config { ping_targets: Vec<PingTarget> },
    /// Operator-triggered command, currently only `update`.
    Command {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
    },
}

/// One per-server entry inside a `delta` frame.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct DeltaUpdate {
    pub id: String,
    /// Present iff the online bit flipped this tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<bool>,
    /// Present iff at least one metric moved by its quantum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m: Option<CompactMetrics>,
}

/// One server in the initial browser snapshot.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ServerSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub online: bool,
    /// Last received Sample, null when the host never reported.
    pub sample: Option<Box<Sample>>,
}

/// Frames the server sends to a browser session.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserFrame {
    /// One-shot initial state so the browser model is correct before the
    /// first delta arrives.
    Snapshot {
        servers: Vec<ServerSnapshot>,
        site_settings: SiteSettings,
    },
    Delta {
        ts: i64,
        d: Vec<DeltaUpdate>,
    },
    SiteSettings {
        site_settings: SiteSettings,
    },
}
