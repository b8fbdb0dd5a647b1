//! Comm-server process entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use comm_server::{Central, CommServerConfig, CoordinatorLink, LoggingReporter, PeerConnectionFactory, Reporter};
use mesh_auth::{AuthenticatorRegistry, OpenAuthenticator, SharedSecretAuthenticator};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh broker comm-server.
///
/// Owns a pool of WebRTC peer connections, authenticates each one over
/// its reliable data channel, and fans out topic messages between its
/// local peers and the rest of the mesh.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator base URL, e.g. ws://localhost:8080.
    #[arg(long, env = "COMM_SERVER_COORDINATOR_URL")]
    coordinator_url: String,

    /// Auth method this comm-server presents to the coordinator and
    /// requires of its own peers.
    #[arg(long, default_value = "open", env = "COMM_SERVER_AUTH_METHOD")]
    auth_method: String,

    /// Pre-shared token for the "shared-secret" auth method. When unset,
    /// only the "open" (accept-everyone) method is registered.
    #[arg(long, env = "COMM_SERVER_SHARED_SECRET")]
    shared_secret: Option<String>,

    /// Credential this comm-server presents to the coordinator, if the
    /// coordinator requires one.
    #[arg(long, env = "COMM_SERVER_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// STUN/TURN server URLs offered to every peer connection.
    #[arg(long = "ice-server", env = "COMM_SERVER_ICE_SERVERS", value_delimiter = ',')]
    ice_server_urls: Vec<String>,

    /// Seconds a peer has to send AUTH over its reliable data channel
    /// before it is disconnected.
    #[arg(long, default_value_t = 10, env = "COMM_SERVER_PEER_AUTH_TIMEOUT_SECS")]
    peer_auth_timeout_secs: u64,

    /// Per-peer bounded reliable-channel outbound queue capacity.
    #[arg(long, default_value_t = 256, env = "COMM_SERVER_RELIABLE_QUEUE_SIZE")]
    reliable_queue_size: usize,

    /// Per-peer bounded unreliable-channel outbound queue capacity.
    #[arg(long, default_value_t = 256, env = "COMM_SERVER_UNRELIABLE_QUEUE_SIZE")]
    unreliable_queue_size: usize,

    /// Seconds between periodic peer/subscription reports.
    #[arg(long, default_value_t = 1, env = "COMM_SERVER_REPORT_PERIOD_SECS")]
    report_period_secs: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        eprintln!("\nreceived Ctrl+C, shutting down...");
        let already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if already_set {
            std::process::exit(0);
        }
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("graceful shutdown timed out, forcing exit");
            std::process::exit(0);
        });
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("comm-server-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = CommServerConfig {
        coordinator_url: args.coordinator_url,
        auth_method: args.auth_method,
        auth_token: args.auth_token,
        ice_server_urls: args.ice_server_urls,
        peer_auth_timeout: Duration::from_secs(args.peer_auth_timeout_secs),
        reliable_queue_size: args.reliable_queue_size,
        unreliable_queue_size: args.unreliable_queue_size,
        report_period: Duration::from_secs(args.report_period_secs),
    };
    config.validate().map_err(|e| {
        eprintln!("invalid configuration: {e}");
        e
    })?;

    let mut registry = AuthenticatorRegistry::new();
    registry.register("open", Arc::new(OpenAuthenticator))?;
    if let Some(secret) = args.shared_secret {
        registry.register("shared-secret", Arc::new(SharedSecretAuthenticator::new(secret)))?;
    }
    let registry = Arc::new(registry);

    let factory = Arc::new(PeerConnectionFactory::new(&config)?);
    let config = Arc::new(config);
    let central = Central::spawn();

    info!(
        coordinator_url = %config.coordinator_url,
        auth_method = %config.auth_method,
        ice_servers = config.ice_server_urls.len(),
        report_period_secs = config.report_period.as_secs(),
        methods = ?registry.methods().collect::<Vec<_>>(),
        "comm-server starting"
    );

    let (_stop_tx, stop_rx) = watch::channel(false);
    let link = CoordinatorLink::new(Arc::clone(&config), factory, central.clone(), registry);

    tokio::select! {
        _ = comm_server::signaling::run_with_reconnect(link, stop_rx) => {}
        _ = run_reports(central, Arc::new(LoggingReporter), config.report_period) => {}
        _ = wait_for_shutdown(shutdown_flag) => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn run_reports(central: comm_server::CentralHandle, reporter: Arc<dyn Reporter>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let snapshot = central.snapshot().await;
        reporter.report(&snapshot);
    }
}

async fn wait_for_shutdown(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
