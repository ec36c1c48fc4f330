use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio::signal;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use nvmet_agent::keys::DEFAULT_KEY_DIR;
use nvmet_agent::metrics;
use nvmet_agent::{BdevEngine, Environment, KeyStore, NvmetTarget, RenderContext, TargetConfig};
use spdk_rpc::{DEFAULT_SOCKET_PATH, UnixConnector};

#[derive(Parser, Debug)]
#[command(name = "nvmet-agent")]
#[command(about = "Reconciles a userspace NVMe-oF target daemon against a declared configuration")]
struct Args {
    /// JSON file holding {"config": ..., "environment": ...}
    #[arg(long, env = "NVMET_CONFIG")]
    config: PathBuf,

    /// Target daemon JSON-RPC socket
    #[arg(long, env = "SPDK_RPC_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Directory for DH-CHAP key files (created 0700)
    #[arg(long, env = "NVMET_KEY_DIR", default_value = DEFAULT_KEY_DIR)]
    key_dir: PathBuf,

    /// I/O engine for ZVOL-backed bdevs (uring, aio)
    #[arg(long, env = "NVMET_BDEV_ENGINE", default_value = "uring")]
    bdev_engine: BdevEngine,

    /// Readiness checks before giving up on the daemon, one second apart
    #[arg(long, default_value = "10")]
    ready_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9092)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    config: TargetConfig,
    #[serde(default)]
    environment: Environment,
}

async fn load_context(path: &Path) -> Result<RenderContext, Box<dyn std::error::Error + Send + Sync>> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let file: ConfigFile =
        serde_json::from_slice(&raw).map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
    Ok(RenderContext::new(file.config, file.environment)?)
}

async fn apply(target: &Arc<NvmetTarget<UnixConnector>>, path: &Path) {
    let ctx = match load_context(path).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Not applying configuration: {}", e);
            return;
        }
    };
    let target = Arc::clone(target);
    match tokio::task::spawn_blocking(move || target.write_config(&ctx)).await {
        Ok(Ok(())) => info!("Configuration applied"),
        Ok(Err(e)) if e.is_unavailable() => warn!("Target daemon unavailable, will retry on reload: {}", e),
        Ok(Err(e)) => error!("Failed to apply configuration: {}", e),
        Err(e) => error!("Reconcile task failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    info!("Starting nvmet-agent");
    info!("Log level: {}", args.log_level);
    info!("Config file: {}", args.config.display());
    info!("Daemon socket: {}", args.socket.display());
    info!("Key directory: {}", args.key_dir.display());
    info!("Bdev engine: {}", args.bdev_engine);

    let target = Arc::new(NvmetTarget::new(
        UnixConnector::new(&args.socket),
        KeyStore::new(&args.key_dir),
        args.bdev_engine,
    ));

    let mut ready = false;
    for attempt in 1..=args.ready_retries {
        let probe = Arc::clone(&target);
        if tokio::task::spawn_blocking(move || probe.nvmf_ready(false)).await? {
            ready = true;
            break;
        }
        info!("Waiting for target daemon ({}/{})", attempt, args.ready_retries);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    if !ready {
        return Err(format!("Target daemon at {} is not ready", args.socket.display()).into());
    }

    apply(&target, &args.config).await;

    let mut signals = Signals::install();
    loop {
        match signals.next().await {
            Signal::Reload => {
                info!("Reloading configuration");
                apply(&target, &args.config).await;
            }
            Signal::Shutdown => break,
        }
    }

    info!("nvmet-agent shutdown complete");
    Ok(())
}

enum Signal {
    Reload,
    Shutdown,
}

/// SIGHUP reloads; SIGTERM and SIGINT shut down.
///
/// Only Unix systems are supported; the target daemon is reached over a
/// Unix socket.
struct Signals {
    sigterm: Option<signal::unix::Signal>,
    sigint: Option<signal::unix::Signal>,
    sighup: Option<signal::unix::Signal>,
}

impl Signals {
    /// Install signal handlers, logging errors but continuing with available handlers
    fn install() -> Self {
        use signal::unix::{SignalKind, signal};

        let install = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                error!("Failed to install {} handler: {}", name, e);
                None
            }
        };
        Self {
            sigterm: install(SignalKind::terminate(), "SIGTERM"),
            sigint: install(SignalKind::interrupt(), "SIGINT"),
            sighup: install(SignalKind::hangup(), "SIGHUP"),
        }
    }

    async fn next(&mut self) -> Signal {
        let Self {
            sigterm,
            sigint,
            sighup,
        } = self;

        // Disabled branches cover handlers that failed to install
        tokio::select! {
            Some(_) = async { sigterm.as_mut()?.recv().await }, if sigterm.is_some() => {
                info!("Received SIGTERM");
                Signal::Shutdown
            }
            Some(_) = async { sigint.as_mut()?.recv().await }, if sigint.is_some() => {
                info!("Received SIGINT");
                Signal::Shutdown
            }
            Some(_) = async { sighup.as_mut()?.recv().await }, if sighup.is_some() => {
                info!("Received SIGHUP");
                Signal::Reload
            }
            else => Signal::Shutdown,
        }
    }
}
