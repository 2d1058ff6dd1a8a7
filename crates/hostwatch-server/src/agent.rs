//! Agent websocket sessions.
//!
//! Lifecycle: connect → authenticate (10 s deadline) → steady state. In
//! steady state the read half consumes metrics frames under a 60 s deadline
//! while the write half pumps the per-session outbound queue and a 30 s
//! transport keepalive. Any read error, write error or close request ends
//! the session; the LiveSnapshot entry stays and goes stale on its own.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use hostwatch_core::protocol::{AgentFrame, ServerFrame};
use hostwatch_core::registry::Registry;

use crate::sessions::SessionHandle;
use crate::state::{AGENT_CONNECTIONS, AppState, now_epoch};

/// The auth frame must arrive within this.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Steady-state read deadline; any inbound traffic refreshes it.
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Transport keepalive period.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

pub(crate) async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| agent_session(state, socket))
}

struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        AGENT_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn agent_session(state: AppState, socket: WebSocket) {
    AGENT_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    let _guard = ConnectionGuard;

    let (mut sink, mut stream) = socket.split();

    // Authenticating
    let server_id = match authenticate(&state, &mut sink, &mut stream).await {
        Some(id) => id,
        None => return,
    };

    // Authenticated
    let handle = state.sessions.register(&server_id);
    let writer_handle = handle.clone();
    let send_task = tokio::spawn(async move { outbound_pump(writer_handle, sink).await });

    read_loop(&state, &handle, &mut stream).await;

    // Draining: stop the write half, then drop the table entry.
    handle.request_close();
    let _ = send_task.await;
    state.sessions.unregister(&handle);
    info!(server_id = %handle.server_id, "agent session closed");
}

/// Runs the handshake. Returns the authenticated server id, or None after
/// replying with an error frame (or timing out).
async fn authenticate(
    state: &AppState,
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
) -> Option<String> {
    let frame = match tokio::time::timeout(AUTH_DEADLINE, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AgentFrame>(text.as_str()),
        Ok(_) => {
            debug!("agent connection ended before auth");
            return None;
        }
        Err(_) => {
            debug!("agent auth deadline exceeded");
            return None;
        }
    };

    let (server_id, token, version) = match frame {
        Ok(AgentFrame::Auth {
            server_id,
            token,
            version,
        }) => (server_id, token, version),
        _ => {
            let _ = send_frame(
                sink,
                &ServerFrame::Error {
                    message: "expected auth frame".into(),
                },
            )
            .await;
            return None;
        }
    };

    if !state.registry.verify_token(&server_id, &token) {
        warn!(server_id, "agent authentication failed");
        let _ = send_frame(
            sink,
            &ServerFrame::Error {
                message: "authentication failed".into(),
            },
        )
        .await;
        return None;
    }

    let ok = ServerFrame::Ok {
        ping_targets: state.registry.ping_targets(),
    };
    if send_frame(sink, &ok).await.is_err() {
        return None;
    }
    info!(server_id, version, "agent authenticated");
    Some(server_id)
}

/// Write half: outbound queue plus transport keepalive, until close.
async fn outbound_pump(handle: Arc<SessionHandle>, mut sink: SplitSink<WebSocket, Message>) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_PERIOD);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            frame = handle.queue.pop() => {
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            _ = handle.wait_closed() => break,
        }
    }
}

/// Read half: metrics frames under the read deadline.
async fn read_loop(
    state: &AppState,
    handle: &Arc<SessionHandle>,
    stream: &mut SplitStream<WebSocket>,
) {
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(READ_DEADLINE, stream.next()) => next,
            _ = handle.wait_closed() => {
                debug!(server_id = %handle.server_id, "session close requested");
                return;
            }
        };

        match next {
            Err(_) => {
                warn!(server_id = %handle.server_id, "agent read deadline exceeded");
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                handle_frame(state, &handle.server_id, text.as_str());
            }
            Ok(Some(Ok(Message::Close(_)))) => return,
            // Pings are answered by the transport; pongs just refresh the
            // deadline by arriving.
            Ok(Some(Ok(_))) => {}
        }
    }
}

fn handle_frame(state: &AppState, server_id: &str, text: &str) {
    let frame = match serde_json::from_str::<AgentFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            // Protocol error: drop the frame, keep the connection.
            debug!(server_id, error = %e, "malformed agent frame dropped");
            return;
        }
    };
    match frame {
        AgentFrame::Metrics { metrics } => {
            let sample = *metrics;
            state.live.update(server_id, sample.clone(), now_epoch());
            if let Some(hook) = &state.on_sample {
                hook(server_id, &sample);
            }
            let id = server_id.to_string();
            state
                .writer
                .write_async(Box::new(move |store| store.ingest_sample(&id, &sample)));
        }
        AgentFrame::Auth { .. } => {
            debug!(server_id, "unexpected auth frame in steady state");
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).expect("frame serialization is infallible");
    sink.send(Message::Text(json.into())).await
}
