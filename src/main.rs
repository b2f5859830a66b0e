use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use acproxycam::config::ConfigStore;
use acproxycam::daemon::Daemon;
use acproxycam::ipc;
use tokio_util::sync::CancellationToken;

/// Log level for the daemon.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// ACProxyCam command line arguments.
#[derive(Parser, Debug)]
#[command(name = "acproxycamd")]
#[command(version, about = "Fronts networked 3D printer cameras and re-publishes their video", long_about = None)]
struct CliArgs {
    /// Data directory path (default: /etc/acproxycam)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls crypto provider");

    tracing::info!("starting acproxycamd v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!(data_dir = %data_dir.display(), "data directory resolved");
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_path = data_dir.join("config.json");
    let config_store = Arc::new(ConfigStore::new(&config_path).await?);
    tracing::info!(printers = config_store.get().printers.len(), "configuration loaded");

    let daemon = Daemon::new(config_store.clone()).await;

    let shutdown = CancellationToken::new();
    let daemon_cancel = shutdown.clone();
    let daemon_task = tokio::spawn(daemon.clone().run(daemon_cancel));

    let socket_path = data_dir.join("acproxycam.sock");
    let ipc_cancel = shutdown.clone();
    let ipc_shutdown = shutdown.clone();
    let ipc_task = tokio::spawn(ipc::serve(socket_path.clone(), daemon.clone(), ipc_shutdown, ipc_cancel));

    let shutdown_signal = shutdown.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = shutdown.cancelled() => {
            tracing::info!("stop_service requested over IPC");
        }
    }
    shutdown_signal.cancel();

    let _ = daemon_task.await;
    let _ = ipc_task.await;

    tracing::info!("acproxycamd shutdown complete");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "acproxycam=error,tower_http=error",
        LogLevel::Warn => "acproxycam=warn,tower_http=warn",
        LogLevel::Info => "acproxycam=info,tower_http=info",
        LogLevel::Debug => "acproxycam=debug,tower_http=debug",
        LogLevel::Trace => "acproxycam=trace,tower_http=debug",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}

fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("ACPROXYCAM_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/acproxycam")
}
