//! Coordinator process entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use coordinator::{Central, CoordinatorConfig, CoordinatorServer, DefaultServerSelector};
use mesh_auth::{AuthenticatorRegistry, OpenAuthenticator, SharedSecretAuthenticator};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh broker coordinator.
///
/// Assigns aliases, authenticates peers, and relays WebRTC signaling
/// between comm-servers and clients.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on for both /discover and /connect.
    #[arg(long, default_value = "0.0.0.0", env = "COORDINATOR_LISTEN_HOST")]
    listen_host: String,

    #[arg(long, default_value_t = 8080, env = "COORDINATOR_LISTEN_PORT")]
    listen_port: u16,

    /// Seconds a peer has to authenticate before it is disconnected.
    #[arg(long, default_value_t = 60, env = "COORDINATOR_AUTH_TIMEOUT_SECS")]
    auth_timeout_secs: u64,

    /// Per-peer bounded outbound queue capacity.
    #[arg(long, default_value_t = 256, env = "COORDINATOR_QUEUE_SIZE")]
    queue_size: usize,

    /// Pre-shared token for the "shared-secret" auth method. When unset,
    /// only the "open" (accept-everyone) method is registered.
    #[arg(long, env = "COORDINATOR_SHARED_SECRET")]
    shared_secret: Option<String>,
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
            std::thread::sleep(std::time::Duration::from_secs(3));
            eprintln!("graceful shutdown timed out, forcing exit");
            std::process::exit(0);
        });
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("coordinator-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = CoordinatorConfig {
        listen_host: args.listen_host,
        listen_port: args.listen_port,
        auth_timeout: std::time::Duration::from_secs(args.auth_timeout_secs),
        queue_size: args.queue_size,
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

    info!(
        listen = %config.listen_addr(),
        auth_timeout_secs = config.auth_timeout.as_secs(),
        queue_size = config.queue_size,
        methods = ?registry.methods().collect::<Vec<_>>(),
        "coordinator starting"
    );

    let central = Central::spawn(Box::new(DefaultServerSelector::default()));
    let server = CoordinatorServer::new(config, central, Arc::new(registry));

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = wait_for_shutdown(shutdown_flag) => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn wait_for_shutdown(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
