//! sodav-monitor - broadcast detection service
//!
//! Loads configuration, opens the database, builds the external
//! recognition chain and hands the station fleet to the supervisor.
//! SIGINT / SIGTERM trigger a graceful shutdown: workers fold their
//! in-flight plays before the process exits.

use anyhow::Result;
use clap::Parser;
use sodav_common::config::{load_toml_config, resolve_data_dir};
use sodav_common::db::init_database_pool;
use sodav_common::EventBus;
use sodav_monitor::config::Settings;
use sodav_monitor::db::init_schema;
use sodav_monitor::services::external_recognizer::ExternalRecognizer;
use sodav_monitor::services::station_supervisor::StationSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EVENT_BUS_CAPACITY: usize = 1000;

#[derive(Parser, Debug)]
#[command(name = "sodav-monitor", about = "Radio broadcast detection service")]
struct Args {
    /// Data directory holding the SQLite database
    #[arg(long, env = "SODAV_DATA_DIR")]
    data_dir: Option<String>,

    /// Path to the TOML config file
    #[arg(long, env = "SODAV_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = load_toml_config(args.config.as_deref())?;

    let filter = toml_config
        .log_filter
        .clone()
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("Starting sodav-monitor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::resolve(&toml_config);
    let data_dir = resolve_data_dir(args.data_dir.as_deref(), &toml_config);
    let db_path = data_dir.join("monitor.db");
    info!("Database: {}", db_path.display());

    let pool = init_database_pool(&db_path).await?;
    init_schema(&pool).await?;
    info!("Database ready");

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let settings = Arc::new(settings);
    let external = Arc::new(ExternalRecognizer::new(
        &settings,
        pool.clone(),
        event_bus.clone(),
    )?);

    // Command channel for station add/remove from the API layer; the
    // sender half is handed to whatever embeds the core.
    let (_command_tx, command_rx) = mpsc::channel(32);

    let shutdown = CancellationToken::new();
    let supervisor = StationSupervisor::new(
        pool,
        Arc::clone(&settings),
        event_bus.clone(),
        external,
        command_rx,
        shutdown.clone(),
    )?;

    let supervisor_handle = tokio::spawn(supervisor.run());

    // Log subscriber keeps the bus drained even with no API attached
    let mut events = event_bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "monitor event");
        }
    });

    shutdown_signal().await;
    info!("Shutdown requested");
    shutdown.cancel();

    match supervisor_handle.await {
        Ok(Ok(())) => info!("Supervisor stopped cleanly"),
        Ok(Err(e)) => tracing::error!("Supervisor stopped with error: {}", e),
        Err(e) => tracing::error!("Supervisor task panicked: {}", e),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
