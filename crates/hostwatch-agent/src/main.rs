//! hostwatch-agent - metrics push agent.
//!
//! Collects a Sample from /proc each interval, runs the configured ping
//! probes, and pushes everything to the dashboard over a persistent
//! websocket. Reconnects with exponential backoff and applies probe-config
//! updates pushed by the server at runtime.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "linux")]
use hostwatch_core::collector::RealFs;
#[cfg(not(target_os = "linux"))]
use hostwatch_core::collector::MockFs;
use hostwatch_core::collector::Collector;
use hostwatch_core::probes;
use hostwatch_core::protocol::{AgentFrame, ServerFrame};
use hostwatch_core::registry::PingTarget;

/// Reconnect backoff bounds.
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Auth response deadline, matching the server's handshake deadline.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Metrics push agent.
#[derive(Parser)]
#[command(name = "hostwatch-agent", about = "hostwatch metrics agent", version = hostwatch_core::VERSION)]
struct Args {
    /// Dashboard websocket endpoint, e.g. ws://dash.example.com:8080/ws/agent
    #[arg(long, env = "HOSTWATCH_SERVER")]
    server: String,

    /// Server id assigned by the dashboard.
    #[arg(long, env = "HOSTWATCH_SERVER_ID")]
    server_id: String,

    /// Authentication token for this server id.
    #[arg(long, env = "HOSTWATCH_TOKEN")]
    token: String,

    /// Collection interval in seconds.
    #[arg(short, long, default_value = "1", env = "HOSTWATCH_INTERVAL")]
    interval: u64,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("hostwatch_agent={}", level).parse().unwrap())
        .add_directive(format!("hostwatch_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[derive(Debug)]
enum AgentError {
    Connect(String),
    Auth(String),
    Transport(String),
    Protocol(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Connect(msg) => write!(f, "connect failed: {}", msg),
            AgentError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            AgentError::Transport(msg) => write!(f, "transport error: {}", msg),
            AgentError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

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

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("hostwatch-agent {} starting", hostwatch_core::VERSION);
    info!(
        "Config: server={}, server_id={}, interval={}s",
        args.server, args.server_id, args.interval
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args));
}

async fn async_main(args: Args) {
    let collector = Arc::new(Mutex::new(create_collector(&args)));
    // Probe targets arrive with the auth reply and via config pushes.
    let targets: Arc<Mutex<Vec<PingTarget>>> = Arc::new(Mutex::new(Vec::new()));

    let mut backoff = INITIAL_BACKOFF;
    loop {
        let started = Instant::now();
        match run_session(&args, &collector, &targets).await {
            Ok(()) => info!("Session closed by server"),
            Err(e) => warn!("Session ended: {}", e),
        }

        // A session that lived a while earns a fresh backoff.
        if started.elapsed() > Duration::from_secs(60) {
            backoff = INITIAL_BACKOFF;
        }
        info!("Reconnecting in {}s", backoff.as_secs());
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_session(
    args: &Args,
    collector: &Arc<Mutex<CollectorImpl>>,
    targets: &Arc<Mutex<Vec<PingTarget>>>,
) -> Result<(), AgentError> {
    let (ws, _) = connect_async(args.server.as_str())
        .await
        .map_err(|e| AgentError::Connect(e.to_string()))?;
    debug!("Connected to {}", args.server);
    let (mut sink, mut stream) = ws.split();

    // Handshake
    let auth = AgentFrame::Auth {
        server_id: args.server_id.clone(),
        token: args.token.clone(),
        version: hostwatch_core::VERSION.to_string(),
    };
    send_frame(&mut sink, &auth).await?;

    let reply = tokio::time::timeout(AUTH_DEADLINE, stream.next())
        .await
        .map_err(|_| AgentError::Auth("no reply within deadline".into()))?;
    match parse_server_frame(reply)? {
        ServerFrame::Ok { ping_targets } => {
            info!("Authenticated, {} ping targets", ping_targets.len());
            *targets.lock().unwrap() = ping_targets;
        }
        ServerFrame::Error { message } => return Err(AgentError::Auth(message)),
        _ => return Err(AgentError::Protocol("unexpected frame during auth".into())),
    }

    // Steady state
    let mut tick = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sample_count: u64 = 0;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let collector = collector.clone();
                let probe_targets = targets.lock().unwrap().clone();
                let now = Utc::now().timestamp();
                let collected = tokio::task::spawn_blocking(move || {
                    let mut collector = collector.lock().unwrap();
                    collector.collect(now).map(|mut sample| {
                        sample.ping = probes::run_probes(&probe_targets, probes::PROBE_TIMEOUT);
                        sample
                    })
                })
                .await;

                let sample = match collected {
                    Ok(Ok(sample)) => sample,
                    Ok(Err(e)) => {
                        warn!("Failed to collect sample: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Collection task panicked: {}", e);
                        continue;
                    }
                };

                sample_count += 1;
                debug!("Sample #{}: cpu={:.1}%", sample_count, sample.cpu.usage_percent);
                let frame = AgentFrame::Metrics { metrics: Box::new(sample) };
                send_frame(&mut sink, &frame).await?;
            }
            incoming = stream.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(e)) => return Err(AgentError::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => handle_server_frame(text.as_str(), targets),
                // Transport pings/pongs are handled underneath.
                Some(Ok(_)) => {}
            },
        }
    }
}

fn handle_server_frame(text: &str, targets: &Arc<Mutex<Vec<PingTarget>>>) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Config { ping_targets }) => {
            info!("Probe config updated: {} targets", ping_targets.len());
            *targets.lock().unwrap() = ping_targets;
        }
        Ok(ServerFrame::Command {
            command,
            download_url,
        }) => {
            if command == "update" {
                // Software distribution is out of band; the command is only
                // acknowledged so operators can see it arrived.
                warn!("Update command received (url: {:?}), ignoring", download_url);
            } else {
                warn!("Unknown command: {}", command);
            }
        }
        Ok(_) => debug!("Unexpected server frame dropped"),
        Err(e) => debug!("Malformed server frame dropped: {}", e),
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

#[cfg(target_os = "linux")]
type CollectorImpl = Collector<RealFs>;
#[cfg(not(target_os = "linux"))]
type CollectorImpl = Collector<MockFs>;

async fn send_frame(sink: &mut WsSink, frame: &AgentFrame) -> Result<(), AgentError> {
    let json = serde_json::to_string(frame).expect("frame serialization is infallible");
    sink.send(Message::text(json))
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))
}

fn parse_server_frame(
    incoming: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<ServerFrame, AgentError> {
    match incoming {
        Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str())
            .map_err(|e| AgentError::Protocol(e.to_string())),
        Some(Ok(_)) => Err(AgentError::Protocol("unexpected message type".into())),
        Some(Err(e)) => Err(AgentError::Transport(e.to_string())),
        None => Err(AgentError::Transport("connection closed".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff.as_secs());
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 60, 60]);
    }
}
