//! Browser websocket sessions.
//!
//! A subscriber gets a one-shot `snapshot` frame built from the registry and
//! the live state, then every fan-out `delta` in emission order. A lagged
//! subscriber skips frames (its model self-heals on the next full value per
//! field) rather than stalling the broadcaster.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use hostwatch_core::live::ONLINE_WINDOW_SECS;
use hostwatch_core::protocol::{BrowserFrame, ServerSnapshot};
use hostwatch_core::registry::Registry;

use crate::state::{AppState, BROWSER_CONNECTIONS, LOCAL_SERVER_ID, now_epoch};

pub(crate) async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| browser_session(state, socket))
}

struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = BROWSER_CONNECTIONS.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(active_connections = active, "browser disconnected");
    }
}

async fn browser_session(state: AppState, socket: WebSocket) {
    let active = BROWSER_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    info!(active_connections = active, "browser connected");
    let _guard = ConnectionGuard;

    let (mut sink, mut stream) = socket.split();

    // Subscribe before building the snapshot so no tick falls in between.
    let mut rx = state.fanout_tx.subscribe();

    let snapshot = build_snapshot(&state);
    let Ok(json) = serde_json::to_string(&snapshot) else {
        return;
    };
    if sink.send(Message::Text(json.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(frame) => {
                    let Ok(json) = serde_json::to_string(frame.as_ref()) else {
                        continue;
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "browser session lagged");
                }
                Err(RecvError::Closed) => return,
            },
            inbound = stream.next() => match inbound {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                // Browsers have nothing to say; drop anything else.
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Initial state: every registered server plus the local host, with the
/// last Sample and derived online bit where one exists.
pub(crate) fn build_snapshot(state: &AppState) -> BrowserFrame {
    let now = now_epoch();
    let mut servers = Vec::new();

    let mut describe = |id: &str, name: String, metadata: serde_json::Value| {
        let entry = state.live.get(id);
        servers.push(ServerSnapshot {
            id: id.to_string(),
            name,
            metadata,
            online: entry
                .as_ref()
                .is_some_and(|e| now - e.received_at < ONLINE_WINDOW_SECS),
            sample: entry.map(|e| Box::new(e.sample)),
        });
    };

    describe(LOCAL_SERVER_ID, LOCAL_SERVER_ID.to_string(), serde_json::Value::Null);
    for record in state.registry.list_servers() {
        describe(&record.id, record.name, record.metadata);
    }

    BrowserFrame::Snapshot {
        servers,
        site_settings: state.registry.site_settings(),
    }
}
