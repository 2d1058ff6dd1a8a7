//! Live fan-out ticker.
//!
//! Every tick walks the registry list plus every id that ever reported
//! (plus the local host), computes the per-server delta against the
//! last-broadcast state, and sends one `delta` frame to all browser
//! subscribers. A tick with nothing changed sends nothing.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use hostwatch_core::protocol::BrowserFrame;
use hostwatch_core::registry::Registry;

use crate::state::{AppState, LOCAL_SERVER_ID, now_epoch};

pub(crate) async fn fanout_loop(state: AppState, period: Duration) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;

        let ids = collect_ids(&state);
        let now = now_epoch();
        let updates = state.live.compute_tick(&ids, now);
        if updates.is_empty() {
            continue;
        }

        debug!(updates = updates.len(), "fanout tick");
        let frame = BrowserFrame::Delta {
            ts: now,
            d: updates,
        };
        // Errors only mean there is no subscriber right now.
        let _ = state.fanout_tx.send(Arc::new(frame));
    }
}

/// Registry ids ∪ live ids ∪ the local host, deduplicated, stable order.
fn collect_ids(state: &AppState) -> Vec<String> {
    let mut ids: Vec<String> = state
        .registry
        .list_servers()
        .into_iter()
        .map(|record| record.id)
        .collect();
    ids.extend(state.live.known_ids());
    ids.push(LOCAL_SERVER_ID.to_string());
    ids.sort();
    ids.dedup();
    ids
}
