//! Background loops: aggregation, retention, registry polling, and the
//! local host sampler.
//!
//! Store mutations go through the writer like every other write; sync jobs
//! run inside `spawn_blocking` so a slow disk never stalls the runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, warn};

use hostwatch_core::collector::{Collector, FileSystem};
use hostwatch_core::probes;
use hostwatch_core::protocol::BrowserFrame;
use hostwatch_core::registry::Registry;

use crate::state::{AppState, LOCAL_SERVER_ID, now_epoch};

/// Roll-up and retention cadence. Both jobs are idempotent and recompute a
/// lookback window, so an occasional missed tick costs nothing.
const AGGREGATION_PERIOD: Duration = Duration::from_secs(3600);

/// How often the registry config file is re-read.
const REGISTRY_POLL_PERIOD: Duration = Duration::from_secs(10);

pub(crate) async fn aggregation_loop(state: AppState) {
    let mut tick = tokio::time::interval(AGGREGATION_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let writer = state.writer.clone();
        let now = now_epoch();
        let result = tokio::task::spawn_blocking(move || {
            writer.write_sync(Box::new(move |store| store.run_aggregation(now)))
        })
        .await;
        match result {
            Ok(Ok(())) => debug!("aggregation pass complete"),
            Ok(Err(e)) => error!(error = %e, "aggregation failed"),
            Err(e) => error!(error = %e, "aggregation task panicked"),
        }
    }
}

pub(crate) async fn retention_loop(state: AppState) {
    let mut tick = tokio::time::interval(AGGREGATION_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let writer = state.writer.clone();
        let now = now_epoch();
        let result = tokio::task::spawn_blocking(move || {
            writer.write_sync(Box::new(move |store| store.run_retention(now)))
        })
        .await;
        match result {
            Ok(Ok(())) => debug!("retention pass complete"),
            Ok(Err(e)) => error!(error = %e, "retention failed"),
            Err(e) => error!(error = %e, "retention task panicked"),
        }
    }
}

/// Re-reads `config.json` and pushes changes out: new probe targets to every
/// authenticated agent, new site settings to every browser.
pub(crate) async fn registry_poll_loop(state: AppState) {
    let mut tick = tokio::time::interval(REGISTRY_POLL_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let registry = state.registry.clone();
        let changes = match tokio::task::spawn_blocking(move || registry.reload_if_changed()).await
        {
            Ok(changes) => changes,
            Err(e) => {
                error!(error = %e, "registry reload panicked");
                continue;
            }
        };
        if changes.probe_targets {
            state
                .sessions
                .broadcast_config(&state.registry.ping_targets());
        }
        if changes.site_settings {
            let frame = BrowserFrame::SiteSettings {
                site_settings: state.registry.site_settings(),
            };
            let _ = state.fanout_tx.send(Arc::new(frame));
        }
    }
}

/// Samples the dashboard's own host under the reserved `local` id, through
/// the same live-update + writer path as an agent session.
pub(crate) async fn local_sampler_loop<F>(state: AppState, collector: Collector<F>, period: Duration)
where
    F: FileSystem + 'static,
{
    let collector = Arc::new(Mutex::new(collector));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let targets = state.registry.ping_targets();
        let collector = collector.clone();
        let now = now_epoch();
        let collected = tokio::task::spawn_blocking(move || {
            let mut collector = collector.lock().unwrap();
            collector.collect(now).map(|mut sample| {
                sample.ping = probes::run_probes(&targets, probes::PROBE_TIMEOUT);
                sample
            })
        })
        .await;

        match collected {
            Ok(Ok(sample)) => {
                state.live.update(LOCAL_SERVER_ID, sample.clone(), now);
                state.writer.write_async(Box::new(move |store| {
                    store.ingest_sample(LOCAL_SERVER_ID, &sample)
                }));
            }
            Ok(Err(e)) => warn!(error = %e, "local sample collection failed"),
            Err(e) => error!(error = %e, "local sampler panicked"),
        }
    }
}
