//! HTTP read surface.
//!
//! All endpoints are read-only and run concurrently with the writer: latest
//! values come from the live state, history from short-lived read-only
//! store connections inside `spawn_blocking`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use hostwatch_core::live::ONLINE_WINDOW_SECS;
use hostwatch_core::metrics::Sample;
use hostwatch_core::registry::{PingTarget, Registry};
use hostwatch_core::store::{HistoryPoint, HistoryRange, PingSeries, Store, StoreError};

use crate::state::{AppState, LOCAL_SERVER_ID, now_epoch};

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Latest values
// ============================================================

#[derive(Serialize)]
pub(crate) struct ServerStatus {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) metadata: serde_json::Value,
    pub(crate) online: bool,
    pub(crate) sample: Option<Box<Sample>>,
}

/// Latest Sample per registered server (plus the local host), joined from
/// the registry and the live state.
pub(crate) async fn handle_metrics_all(State(state): State<AppState>) -> Json<Vec<ServerStatus>> {
    let now = now_epoch();
    let mut servers = Vec::new();

    let mut describe = |id: &str, name: String, metadata: serde_json::Value| {
        let entry = state.live.get(id);
        servers.push(ServerStatus {
            id: id.to_string(),
            name,
            metadata,
            online: entry
                .as_ref()
                .is_some_and(|e| now - e.received_at < ONLINE_WINDOW_SECS),
            sample: entry.map(|e| Box::new(e.sample)),
        });
    };

    describe(
        LOCAL_SERVER_ID,
        LOCAL_SERVER_ID.to_string(),
        serde_json::Value::Null,
    );
    for record in state.registry.list_servers() {
        describe(&record.id, record.name, record.metadata);
    }

    Json(servers)
}

// ============================================================
// History
// ============================================================

#[derive(Deserialize)]
pub(crate) struct HistoryParams {
    range: Option<String>,
    /// Highest bucket index the client already holds; only newer buckets
    /// are returned.
    since: Option<i64>,
}

#[derive(Serialize)]
pub(crate) struct HistoryResponse {
    server_id: String,
    range: &'static str,
    data: Vec<HistoryPoint>,
    ping_targets: Vec<PingTarget>,
}

pub(crate) async fn handle_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let range = params
        .range
        .as_deref()
        .map(HistoryRange::from_param)
        .unwrap_or(HistoryRange::Day);

    let db = state.db_path.clone();
    let server_id = id.clone();
    let since = params.since;
    let now = now_epoch();
    let data = tokio::task::spawn_blocking(move || -> Result<Vec<HistoryPoint>, StoreError> {
        let store = Store::open_read_only(db.as_path())?;
        store.history(&server_id, range, since, now)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|e| {
        error!(server_id = %id, error = %e, "history query failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(HistoryResponse {
        server_id: id,
        range: range.as_str(),
        data,
        ping_targets: state.registry.ping_targets(),
    }))
}

// ============================================================
// Ping history
// ============================================================

#[derive(Serialize)]
pub(crate) struct PingHistoryResponse {
    server_id: String,
    range: &'static str,
    series: Vec<PingSeries>,
}

pub(crate) async fn handle_ping_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<PingHistoryResponse>, StatusCode> {
    let range = params
        .range
        .as_deref()
        .map(HistoryRange::from_param)
        .unwrap_or(HistoryRange::Day);

    let db = state.db_path.clone();
    let server_id = id.clone();
    let now = now_epoch();
    let series = tokio::task::spawn_blocking(move || -> Result<Vec<PingSeries>, StoreError> {
        let store = Store::open_read_only(db.as_path())?;
        store.ping_history(&server_id, range, now)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|e| {
        error!(server_id = %id, error = %e, "ping history query failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(PingHistoryResponse {
        server_id: id,
        range: range.as_str(),
        series,
    }))
}
