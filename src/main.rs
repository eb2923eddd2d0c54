//! # courier
//!
//! One routing node: opens the shared store, starts the connection manager
//! and serves client WebSockets until interrupted or the manager fails.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use courier_core::ids::InstanceId;
use courier_manager::{Manager, ManagerConfig};
use courier_server::ServerConfig;
use courier_settings::CourierSettings;
use courier_store::{Database, SqliteBroker, SqliteRoutingTable};
use courier_telemetry::{parse_level, LogFormat, TelemetryConfig};

/// Courier routing node.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Courier message routing node")]
struct Cli {
    /// Settings file (defaults to `~/.courier/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fixed instance identity; generated when omitted.
    #[arg(long)]
    instance_id: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the shared `SQLite` database.
    #[arg(long)]
    store: Option<PathBuf>,
}

fn telemetry_config(settings: &CourierSettings) -> TelemetryConfig {
    let log_level = parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO);
    let module_levels = settings
        .logging
        .modules
        .iter()
        .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
        .collect();
    let format = match settings.logging.format.as_str() {
        "compact" => LogFormat::Compact,
        _ => LogFormat::Json,
    };
    TelemetryConfig {
        log_level,
        module_levels,
        format,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_file = cli.config.clone().unwrap_or_else(courier_settings::settings_path);
    let mut settings = courier_settings::load_settings_from_path(&settings_file)
        .with_context(|| format!("Failed to load settings from {}", settings_file.display()))?;
    if let Some(id) = cli.instance_id {
        settings.instance_id = Some(id);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(store) = cli.store {
        settings.store.path = store.to_string_lossy().into_owned();
    }

    courier_telemetry::init_telemetry(&telemetry_config(&settings));

    let instance_id = settings
        .instance_id
        .as_deref()
        .map(InstanceId::from_raw)
        .unwrap_or_default();

    let db_path = courier_settings::resolve_store_path(&settings);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let routing = Arc::new(SqliteRoutingTable::new(db.clone()));
    let stale = routing
        .entries_for(&instance_id)
        .context("Failed to read routing table")?;
    if !stale.is_empty() {
        tracing::warn!(
            instance_id = %instance_id,
            count = stale.len(),
            "routing table still lists clients from a previous run of this instance"
        );
    }
    let broker = Arc::new(SqliteBroker::new(
        db,
        settings.broker.exchange.clone(),
        instance_id.clone(),
        Duration::from_millis(settings.broker.poll_interval_ms),
    ));

    let (manager, rx) = Manager::new(
        instance_id.clone(),
        routing,
        broker,
        ManagerConfig {
            queue_capacity: settings.manager.queue_capacity,
        },
    );
    let manager = Arc::new(manager);
    let pipelines = manager
        .start(rx)
        .await
        .context("Failed to start connection manager")?;

    let server = courier_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
            keepalive: Duration::from_secs(settings.server.keepalive_secs),
        },
        Arc::clone(&manager),
    )
    .await
    .context("Failed to start server")?;

    tracing::info!(
        instance_id = %instance_id,
        port = server.port,
        store = %db_path.display(),
        exchange = %settings.broker.exchange,
        "courier node ready"
    );

    let failed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl+c")?;
            tracing::info!("shutting down");
            false
        }
        _ = pipelines.fatal() => {
            tracing::error!(instance_id = %instance_id, "connection manager stopped, exiting");
            true
        }
    };

    server.shutdown().await;
    pipelines.shutdown().await;

    if failed {
        bail!("connection manager failed");
    }
    Ok(())
}
