//! Serialized write pipeline.
//!
//! A single dedicated thread owns the writable store; every mutation
//! (migration at boot, sample ingest, roll-up, retention) is a job on its
//! bounded queue. Readers never go through the queue: they use their own
//! read-only connections and rely on WAL.
//!
//! Backpressure is visible but non-blocking: a full queue drops async jobs
//! with a warning, so slow disks can never stall agent sessions.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{error, info, warn};

use crate::store::{Store, StoreError};

/// A unit of write work executed on the writer thread.
pub type WriteJob = Box<dyn FnOnce(&mut Store) -> Result<(), StoreError> + Send + 'static>;

enum Envelope {
    Async(WriteJob),
    Sync(WriteJob, Sender<Result<(), StoreError>>),
    Shutdown,
}

/// Handle to the writer thread. Cheap to clone; any clone can submit jobs.
#[derive(Clone)]
pub struct Writer {
    tx: Sender<Envelope>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Writer {
    /// Default queue depth: at one job per agent per second this absorbs a
    /// multi-second disk stall for a sizable fleet.
    pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

    /// Starts the writer thread owning `store`.
    pub fn spawn(store: Store, queue_depth: usize) -> Self {
        let (tx, rx) = bounded(queue_depth);
        let handle = std::thread::Builder::new()
            .name("hostwatch-writer".into())
            .spawn(move || writer_loop(store, rx))
            .expect("failed to spawn writer thread");
        Self {
            tx,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Enqueues a job without waiting. When the queue is full the job is
    /// dropped and a warning logged; ingestion never blocks on the disk.
    pub fn write_async(&self, job: WriteJob) {
        match self.tx.try_send(Envelope::Async(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("write queue full, dropping job");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("write queue closed, dropping job");
            }
        }
    }

    /// Enqueues a job and blocks the calling thread until the writer has
    /// executed it. Call through `spawn_blocking` from async contexts.
    pub fn write_sync(&self, job: WriteJob) -> Result<(), StoreError> {
        let (done_tx, done_rx) = bounded(1);
        self.tx
            .send(Envelope::Sync(job, done_tx))
            .map_err(|_| StoreError::Closed)?;
        done_rx.recv().map_err(|_| StoreError::Closed)?
    }

    /// Drains every pending job, then stops the writer thread.
    pub fn shutdown(&self) {
        let handle = self.handle.lock().unwrap().take();
        let Some(handle) = handle else { return };
        // The marker queues behind every pending job; FIFO drains them first.
        let _ = self.tx.send(Envelope::Shutdown);
        if handle.join().is_ok() {
            info!("writer drained and stopped");
        }
    }
}

fn writer_loop(mut store: Store, rx: Receiver<Envelope>) {
    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Async(job) => {
                if let Err(e) = run_job(&mut store, job) {
                    warn!(error = %e, "async write job failed");
                }
            }
            Envelope::Sync(job, done) => {
                let _ = done.send(run_job(&mut store, job));
            }
            Envelope::Shutdown => break,
        }
    }
}

/// Executes one job, converting a panic into an error so a poisoned job can
/// never take the writer down with it.
fn run_job(store: &mut Store, job: WriteJob) -> Result<(), StoreError> {
    match catch_unwind(AssertUnwindSafe(|| job(store))) {
        Ok(result) => result,
        Err(_) => {
            error!("write job panicked, writer continues");
            Err(StoreError::Panicked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Sample;
    use tempfile::tempdir;

    fn spawn_writer(dir: &std::path::Path, depth: usize) -> Writer {
        let store = Store::open(&dir.join("test.db")).unwrap();
        let writer = Writer::spawn(store, depth);
        writer
            .write_sync(Box::new(|store| store.migrate()))
            .unwrap();
        writer
    }

    #[test]
    fn sync_jobs_observe_prior_async_jobs() {
        let dir = tempdir().unwrap();
        let writer = spawn_writer(dir.path(), 64);

        for i in 0..10 {
            writer.write_async(Box::new(move |store| {
                let sample = Sample {
                    timestamp: 1000 + i,
                    ..Sample::default()
                };
                store.ingest_sample("a", &sample)
            }));
        }

        let (count_tx, count_rx) = bounded(1);
        writer
            .write_sync(Box::new(move |store| {
                let count: i64 =
                    store
                        .conn
                        .query_row("SELECT COUNT(*) FROM samples_raw", [], |r| r.get(0))?;
                let _ = count_tx.send(count);
                Ok(())
            }))
            .unwrap();
        assert_eq!(count_rx.recv().unwrap(), 10);
    }

    #[test]
    fn sync_job_errors_reach_the_caller() {
        let dir = tempdir().unwrap();
        let writer = spawn_writer(dir.path(), 64);

        let result = writer.write_sync(Box::new(|store| {
            store.conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
            Ok(())
        }));
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
    }

    #[test]
    fn panicking_job_does_not_kill_the_writer() {
        let dir = tempdir().unwrap();
        let writer = spawn_writer(dir.path(), 64);

        let result = writer.write_sync(Box::new(|_| panic!("boom")));
        assert!(matches!(result, Err(StoreError::Panicked)));

        // The next job runs as if nothing happened.
        writer.write_sync(Box::new(|_| Ok(()))).unwrap();
    }

    #[test]
    fn full_queue_drops_async_jobs_without_blocking() {
        let dir = tempdir().unwrap();
        let writer = spawn_writer(dir.path(), 1);

        // Park the writer so the queue saturates.
        let (gate_tx, gate_rx) = bounded::<()>(0);
        writer.write_async(Box::new(move |_| {
            let _ = gate_rx.recv();
            Ok(())
        }));

        // These either queue or drop; none may block this thread.
        for _ in 0..100 {
            writer.write_async(Box::new(|_| Ok(())));
        }
        drop(gate_tx);
        writer.write_sync(Box::new(|_| Ok(()))).unwrap();
    }

    #[test]
    fn shutdown_drains_pending_jobs() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempdir().unwrap();
        let writer = spawn_writer(dir.path(), 64);

        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let executed = executed.clone();
            writer.write_async(Box::new(move |_| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        writer.shutdown();
        assert_eq!(executed.load(Ordering::SeqCst), 5);
    }
}
