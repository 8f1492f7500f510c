use anyhow::{Context, Result};
use clap::Parser;
use execguard::config::{Config, LogFormat, RuntimeKind};
use execguard::daemon::Daemon;
use execguard::metrics;
use execguard::monitor::fanotify::{ensure_mount_root, FanotifyLauncher};
use execguard::registry::NotifierRegistry;
use execguard::runtime::Runtime;
use execguard::workload::WorkloadCorrelator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "execguard", version)]
#[command(about = "Allow only the executables a container started with")]
#[command(long_about = r#"
Intercepts every exec inside a container with fanotify permission events.
On the first exec the container's root filesystem is hashed; from then on
only executables whose content matches that inventory may run.

With ROOTFS, enforce on a single host mount point until interrupted.
Without it, follow the container runtime and enforce on every eligible
container of this node.
"#)]
struct Args {
    /// Root filesystem to enforce on (standalone mode)
    rootfs: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/execguard/config.toml")]
    config: PathBuf,

    /// Container runtime: containerd or docker
    #[arg(long)]
    runtime: Option<RuntimeKind>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json: bool,

    /// Metrics/health endpoint address
    #[arg(long, default_value = "127.0.0.1:9090")]
    metrics_addr: SocketAddr,

    /// Disable metrics/health endpoint
    #[arg(long)]
    no_metrics: bool,
}

fn init_logging(args: &Args, config: &Config) {
    let level = match args.verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    };
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    if let Some(level) = level {
        filter = filter.add_directive(level.into());
    }

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json || config.general.log_format == LogFormat::Json {
        subscriber.json().init();
    } else {
        subscriber.with_target(false).init();
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("Failed to set up SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

async fn run_standalone(rootfs: PathBuf, config: &Config) -> Result<()> {
    let rootfs = std::fs::canonicalize(&rootfs)
        .with_context(|| format!("Root filesystem {} not found", rootfs.display()))?;
    ensure_mount_root(&rootfs)?;
    let id = rootfs.display().to_string();

    let launcher = FanotifyLauncher::new(config.policy.clone());
    let handle = launcher.launch_rootfs(&id, rootfs, Vec::new())?;
    metrics::ACTIVE_MONITORS.inc();

    info!("Enforcing on {}. Press Ctrl+C to stop.", id);
    shutdown_signal().await;

    tokio::task::spawn_blocking(move || handle.stop())
        .await
        .context("Failed to stop monitor")?;
    metrics::ACTIVE_MONITORS.dec();
    Ok(())
}

async fn run_daemon(config: &Config) -> Result<()> {
    info!(runtime = ?config.daemon.runtime, "Starting daemon");

    let runtime = Arc::new(Runtime::connect(&config.daemon)?);
    let events = Arc::clone(&runtime).container_events();

    let daemon = Daemon::new(
        NotifierRegistry::new(FanotifyLauncher::new(config.policy.clone())),
        WorkloadCorrelator::new(&config.workload),
    );

    info!("Stop the process using Ctrl + C");
    daemon.run(events, shutdown_signal()).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config);
    if let Some(runtime) = args.runtime {
        config.daemon.runtime = runtime;
    }

    init_logging(&args, &config);
    info!("Config: {}", args.config.display());

    let (ready_tx, ready_rx) = watch::channel(false);
    if !args.no_metrics {
        let metrics_addr = args.metrics_addr;
        tokio::spawn(async move {
            metrics::start_server(metrics_addr, ready_rx).await;
        });
        info!("Metrics available at http://{}/metrics", args.metrics_addr);
    }
    let _ = ready_tx.send(true);

    let result = match args.rootfs {
        Some(rootfs) => run_standalone(rootfs, &config).await,
        None => run_daemon(&config).await,
    };

    let _ = ready_tx.send(false);
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    info!("execguard stopped.");
    result
}
