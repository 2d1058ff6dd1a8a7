//! hostwatch-server - monitoring dashboard server.
//!
//! Terminates long-lived agent websocket sessions, persists their metrics
//! through a single serialized writer into an embedded time-series store,
//! streams quantized deltas to browser subscribers and answers bounded
//! range queries over HTTP.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod agent;
mod browser;
mod fanout;
mod handlers;
mod registry;
mod sessions;
mod state;
mod tasks;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tokio::sync::broadcast;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[cfg(target_os = "linux")]
use hostwatch_core::collector::RealFs;
#[cfg(not(target_os = "linux"))]
use hostwatch_core::collector::MockFs;
use hostwatch_core::collector::Collector;
use hostwatch_core::live::LiveState;
use hostwatch_core::store::Store;
use hostwatch_core::writer::Writer;

use crate::registry::JsonRegistry;
use crate::sessions::SessionTable;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "hostwatch-server", about = "hostwatch dashboard server", version = hostwatch_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "HOSTWATCH_LISTEN")]
    listen: String,

    /// Data directory for the time-series database.
    #[arg(long, default_value = "./data", env = "HOSTWATCH_DATA")]
    data_dir: PathBuf,

    /// Path to the configuration document (servers, probe targets,
    /// site settings). Owned by the CRUD layer; re-read on change.
    #[arg(long, default_value = "./config.json", env = "HOSTWATCH_CONFIG")]
    config: PathBuf,

    /// Fan-out tick period in seconds.
    #[arg(long, default_value = "5", env = "HOSTWATCH_FANOUT_INTERVAL")]
    fanout_interval: u64,

    /// Self-sampling period for the local host, in seconds.
    #[arg(long, default_value = "5", env = "HOSTWATCH_LOCAL_INTERVAL")]
    local_interval: u64,

    /// Write queue depth. Saturation drops sample persistence (never live
    /// updates) and logs a warning per dropped job.
    #[arg(long, default_value = "4096", env = "HOSTWATCH_WRITE_QUEUE")]
    write_queue: usize,

    /// Path to /proc (for testing/containers).
    #[arg(long, default_value = "/proc")]
    proc_path: String,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "hostwatch_server=info,hostwatch_core=info".parse().unwrap()
            }),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args));
}

async fn async_main(args: Args) {
    info!(version = hostwatch_core::VERSION, "starting");

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!(path = %args.data_dir.display(), error = %e, "cannot create data directory");
        process::exit(1);
    }
    let db_path = args.data_dir.join("hostwatch.db");

    // Opening the store and migrating the schema is the only fatal
    // condition; everything after this degrades instead of dying.
    let store = match Store::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(path = %db_path.display(), error = %e, "failed to open store");
            process::exit(1);
        }
    };
    let writer = Writer::spawn(store, args.write_queue);
    if let Err(e) = writer.write_sync(Box::new(|store| store.migrate())) {
        error!(error = %e, "schema migration failed");
        process::exit(1);
    }
    info!(path = %db_path.display(), "store ready");

    let registry = Arc::new(JsonRegistry::load(&args.config));
    let (fanout_tx, _) = broadcast::channel(64);
    let state = AppState {
        live: Arc::new(LiveState::new()),
        writer: writer.clone(),
        registry,
        sessions: Arc::new(SessionTable::new()),
        fanout_tx,
        db_path: Arc::new(db_path),
        on_sample: None,
    };

    tokio::spawn(fanout::fanout_loop(
        state.clone(),
        Duration::from_secs(args.fanout_interval),
    ));
    tokio::spawn(tasks::aggregation_loop(state.clone()));
    tokio::spawn(tasks::retention_loop(state.clone()));
    tokio::spawn(tasks::registry_poll_loop(state.clone()));
    tokio::spawn(tasks::local_sampler_loop(
        state.clone(),
        create_collector(&args),
        Duration::from_secs(args.local_interval),
    ));

    let app = Router::new()
        .route("/api/health", get(handlers::handle_health))
        .route("/api/metrics/all", get(handlers::handle_metrics_all))
        .route("/api/history/{id}", get(handlers::handle_history))
        .route("/api/history/{id}/ping", get(handlers::handle_ping_history))
        .route("/ws/agent", get(agent::ws_handler))
        .route("/ws/browser", get(browser::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new());

    let addr: SocketAddr = args.listen.parse().expect("invalid listen address");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Drain queued writes before exit.
    writer.shutdown();
    info!("shutdown complete");
}

#[cfg(target_os = "linux")]
fn create_collector(args: &Args) -> Collector<RealFs> {
    Collector::new(RealFs::new(), &args.proc_path, hostwatch_core::VERSION)
}

#[cfg(not(target_os = "linux"))]
fn create_collector(args: &Args) -> Collector<MockFs> {
    Collector::new(
        MockFs::typical_system(),
        &args.proc_path,
        hostwatch_core::VERSION,
    )
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");
}
