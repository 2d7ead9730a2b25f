//! Hardware Synchronization Daemon - Main Entry Point
//!
//! Keeps the keyboard backlight in sync with the user's settings and serves
//! backlight and display mode requests from the GUI client.

use hwsync_common::tracing;
use hwsyncd::backlight::BacklightWorker;
use hwsyncd::config::{self, ConfigManager};
use hwsyncd::display::{DisplayController, SystemRunner};
use hwsyncd::power::{LidMonitor, StaticLid, UPowerLid};
use hwsyncd::settings::YamlSettingsStore;
use hwsyncd::{ipc, worker, DaemonState};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = parse_config_path(env::args().skip(1))?;

    let mut config_manager = ConfigManager::new(&config_path);
    config_manager.load_config().await?;
    let config = config_manager.config().clone();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&config.daemon.log_level))
        .with_target(false)
        .init();

    info!("Starting hwsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Using configuration {}", config_path.display());

    if !nix::unistd::getuid().is_root() {
        warn!("hwsync daemon is not running as root, LED and socket access may fail");
    }

    let settings_store = Arc::new(YamlSettingsStore::new(&config.settings.settings_file));
    let lid: Arc<dyn LidMonitor> = if config.backlight.lid_suppression {
        Arc::new(UPowerLid::new())
    } else {
        Arc::new(StaticLid(false))
    };

    let (backlight_worker, backlight) = BacklightWorker::new(config.backlight.clone(), settings_store, lid)?;
    let backlight_worker = worker::spawn(backlight_worker);

    let session_uid = config
        .display
        .session_uid
        .unwrap_or_else(|| nix::unistd::geteuid().as_raw());
    let display = Arc::new(DisplayController::new(&config.display, session_uid, Arc::new(SystemRunner)));

    let state = Arc::new(DaemonState::new(backlight, display));

    let mut ipc_server = ipc::IpcServer::new(&config.daemon.socket_path)?;
    ipc_server.start(state, &config.security).await?;
    info!("IPC server started successfully");

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = interrupt.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    info!("Starting cleanup...");
    info!("Stopping worker {}", backlight_worker.name());
    backlight_worker.stop().await;
    ipc_server.shutdown().await?;
    info!("hwsync daemon shutdown complete");
    Ok(())
}

/// `--config <path>`, defaulting to the system configuration
fn parse_config_path<I: Iterator<Item = String>>(mut args: I) -> Result<PathBuf, String> {
    let mut path = PathBuf::from(config::DEFAULT_CONFIG_PATH);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                path = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| "--config requires a path".to_string())?;
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }
    Ok(path)
}

fn parse_log_level(level: &str) -> tracing::Level {
    level.parse().unwrap_or(tracing::Level::INFO)
}
