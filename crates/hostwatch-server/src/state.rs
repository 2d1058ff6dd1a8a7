//! Shared application state and global counters.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use chrono::Utc;
use tokio::sync::broadcast;

use hostwatch_core::live::LiveState;
use hostwatch_core::metrics::Sample;
use hostwatch_core::protocol::BrowserFrame;
use hostwatch_core::writer::Writer;

use crate::registry::JsonRegistry;
use crate::sessions::SessionTable;

/// Reserved id for the host the dashboard itself runs on. Never
/// authenticated over the wire; fed by the local sampler task.
pub(crate) const LOCAL_SERVER_ID: &str = "local";

/// Hook invoked on every accepted metrics frame, for the surrounding
/// CRUD/notification layer.
pub(crate) type SampleHook = Arc<dyn Fn(&str, &Sample) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) live: Arc<LiveState>,
    pub(crate) writer: Writer,
    pub(crate) registry: Arc<JsonRegistry>,
    pub(crate) sessions: Arc<SessionTable>,
    /// Fan-out channel; every browser session holds a subscription.
    pub(crate) fanout_tx: broadcast::Sender<Arc<BrowserFrame>>,
    pub(crate) db_path: Arc<PathBuf>,
    pub(crate) on_sample: Option<SampleHook>,
}

pub(crate) static AGENT_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

pub(crate) static BROWSER_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn now_epoch() -> i64 {
    Utc::now().timestamp()
}
