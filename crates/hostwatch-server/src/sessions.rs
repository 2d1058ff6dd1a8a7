//! Live agent session table and per-session outbound queues.
//!
//! Sessions hold a server id only; authentication and record lookups always
//! go through the registry. The table is the seam the CRUD layer uses to
//! push probe-config changes, relay operator commands and force-close a
//! session when its record is deleted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use hostwatch_core::protocol::ServerFrame;
use hostwatch_core::registry::PingTarget;

/// Outbound frames buffered per session.
const OUTBOUND_CAPACITY: usize = 64;

/// A session this far behind is closed rather than fed a queue that only
/// ever drops.
const OVERFLOW_CLOSE_AFTER: u32 = 16;

/// Bounded queue of server-to-agent frames, drop-oldest on overflow.
pub(crate) struct OutboundQueue {
    frames: Mutex<VecDeque<ServerFrame>>,
    notify: Notify,
    overflows: AtomicU32,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            overflows: AtomicU32::new(0),
        }
    }

    /// Enqueues a frame, dropping the oldest one when full. Returns false
    /// once overflow has repeated enough that the session should close.
    pub(crate) fn push(&self, frame: ServerFrame) -> bool {
        let mut frames = self.frames.lock().unwrap();
        let mut healthy = true;
        if frames.len() >= OUTBOUND_CAPACITY {
            frames.pop_front();
            let n = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
            healthy = n < OVERFLOW_CLOSE_AFTER;
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
        healthy
    }

    /// Waits for the next frame.
    pub(crate) async fn pop(&self) -> ServerFrame {
        loop {
            if let Some(frame) = self.frames.lock().unwrap().pop_front() {
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

/// Handle to one authenticated session.
pub(crate) struct SessionHandle {
    pub(crate) server_id: String,
    pub(crate) queue: Arc<OutboundQueue>,
    closed: AtomicBool,
    close: Notify,
    epoch: u64,
}

impl SessionHandle {
    pub(crate) fn request_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close.notify_waiters();
    }

    /// Resolves once close has been requested. Both halves of a session
    /// task select on this.
    pub(crate) async fn wait_closed(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.close.notified();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// All authenticated agent sessions, keyed by server id.
#[derive(Default)]
pub(crate) struct SessionTable {
    map: RwLock<HashMap<String, Arc<SessionHandle>>>,
    epochs: AtomicU64,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly authenticated session. A previous session for the
    /// same server (agent reconnected faster than we noticed) is told to
    /// close.
    pub(crate) fn register(&self, server_id: &str) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle {
            server_id: server_id.to_string(),
            queue: Arc::new(OutboundQueue::new()),
            closed: AtomicBool::new(false),
            close: Notify::new(),
            epoch: self.epochs.fetch_add(1, Ordering::Relaxed),
        });
        let old = self
            .map
            .write()
            .unwrap()
            .insert(server_id.to_string(), handle.clone());
        if let Some(old) = old {
            debug!(server_id, "replacing live session");
            old.request_close();
        }
        handle
    }

    /// Removes a session, but only if it is still the current one for its
    /// server id (a replacement session must not be evicted by the old task).
    pub(crate) fn unregister(&self, handle: &Arc<SessionHandle>) {
        let mut map = self.map.write().unwrap();
        if map
            .get(&handle.server_id)
            .is_some_and(|cur| cur.epoch == handle.epoch)
        {
            map.remove(&handle.server_id);
        }
    }

    /// Pushes the new probe-target list to every authenticated session.
    pub(crate) fn broadcast_config(&self, ping_targets: &[PingTarget]) {
        let map = self.map.read().unwrap();
        info!(sessions = map.len(), targets = ping_targets.len(), "broadcasting probe config");
        for handle in map.values() {
            let frame = ServerFrame::Config {
                ping_targets: ping_targets.to_vec(),
            };
            if !handle.queue.push(frame) {
                warn!(server_id = %handle.server_id, "outbound queue overflowing, closing session");
                handle.request_close();
            }
        }
    }

    /// Relays an operator command to one agent. False when it has no live
    /// session. Entry point for the surrounding CRUD layer.
    #[allow(dead_code)]
    pub(crate) fn push_command(
        &self,
        server_id: &str,
        command: &str,
        download_url: Option<String>,
    ) -> bool {
        let map = self.map.read().unwrap();
        let Some(handle) = map.get(server_id) else {
            return false;
        };
        if !handle.queue.push(ServerFrame::Command {
            command: command.to_string(),
            download_url,
        }) {
            warn!(server_id, "outbound queue overflowing, closing session");
            handle.request_close();
        }
        true
    }

    /// Force-closes a session, e.g. when its server record was deleted.
    /// The LiveSnapshot entry stays; the online bit goes stale on its own.
    /// Entry point for the surrounding CRUD layer.
    #[allow(dead_code)]
    pub(crate) fn disconnect(&self, server_id: &str, reason: &str) -> bool {
        let map = self.map.read().unwrap();
        match map.get(server_id) {
            Some(handle) => {
                info!(server_id, reason, "disconnecting agent");
                handle.request_close();
                true
            }
            None => false,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn count(&self) -> usize {
        self.map.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = OutboundQueue::new();
        for i in 0..(OUTBOUND_CAPACITY + 1) {
            queue.push(ServerFrame::Command {
                command: format!("c{}", i),
                download_url: None,
            });
        }
        let frames = queue.frames.lock().unwrap();
        assert_eq!(frames.len(), OUTBOUND_CAPACITY);
        // c0 was dropped; the newest frame survived.
        match frames.front().unwrap() {
            ServerFrame::Command { command, .. } => assert_eq!(command, "c1"),
            other => panic!("unexpected frame: {:?}", other),
        }
        match frames.back().unwrap() {
            ServerFrame::Command { command, .. } => {
                assert_eq!(command, &format!("c{}", OUTBOUND_CAPACITY))
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn repeated_overflow_requests_close() {
        let queue = OutboundQueue::new();
        let mut healthy = true;
        for i in 0..(OUTBOUND_CAPACITY as u32 + OVERFLOW_CLOSE_AFTER + 1) {
            healthy = queue.push(ServerFrame::Command {
                command: format!("c{}", i),
                download_url: None,
            });
        }
        assert!(!healthy);
    }

    #[test]
    fn replacement_session_wins_the_table_slot() {
        let table = SessionTable::new();
        let first = table.register("a");
        let second = table.register("a");
        assert_eq!(table.count(), 1);

        // The stale task unregistering must not evict the replacement.
        table.unregister(&first);
        assert_eq!(table.count(), 1);
        table.unregister(&second);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn broadcast_config_reaches_every_session() {
        let table = SessionTable::new();
        let a = table.register("a");
        let b = table.register("b");
        let targets = vec![PingTarget {
            name: "CF".into(),
            host: "1.1.1.1".into(),
        }];
        table.broadcast_config(&targets);

        for handle in [&a, &b] {
            let frames = handle.queue.frames.lock().unwrap();
            match frames.front().unwrap() {
                ServerFrame::Config { ping_targets } => assert_eq!(ping_targets, &targets),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[test]
    fn disconnect_reports_whether_a_session_existed() {
        let table = SessionTable::new();
        assert!(!table.disconnect("a", "record deleted"));
        let _handle = table.register("a");
        assert!(table.disconnect("a", "record deleted"));
    }
}
