//! Prometheus exporter for PostgreSQL.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use pg_exporter::{
    Collector, ConnectionManager, ConnectionSettings, ExporterConfig, HttpServer, QueryCatalog,
    SnapshotStore, StatsRegistry, init_tracing,
};

/// Prometheus exporter for PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "pg-exporter")]
#[command(about = "Export PostgreSQL statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (overrides config).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // File, then environment, then CLI flags
    let mut config = ExporterConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    let data_source = config.data_source()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_source = %data_source,
        "Starting PostgreSQL exporter"
    );

    let catalog = QueryCatalog::load(&config.catalog_source())
        .context("Failed to load query catalog")?;
    info!(queries = catalog.len(), "Loaded query catalog");

    let settings = ConnectionSettings {
        connect_timeout: config.database.connect_timeout(),
        query_timeout: config.database.query_timeout(),
        pool_size: config.database.pool_size,
    };

    let instance = Arc::new(ConnectionManager::new(&data_source, settings));
    let databases: Vec<Arc<ConnectionManager>> = if catalog.has_per_database_queries() {
        config
            .database
            .include_databases
            .iter()
            .map(|db| Arc::new(ConnectionManager::new(&data_source.with_database(db), settings)))
            .collect()
    } else {
        Vec::new()
    };

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = SnapshotStore::shared();
    let stats = Arc::new(StatsRegistry::for_catalog(&catalog));

    let collector = Arc::new(
        Collector::new(catalog, Arc::clone(&instance), store.clone(), stats.clone())
            .with_databases(databases.clone())
            .with_database_filter(config.database.include_databases.clone())
            .with_interval(config.collection.interval())
            .with_query_timeout(settings.connect_timeout + settings.query_timeout)
            .with_concurrency(settings.pool_size as usize),
    );

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let http_server = HttpServer::new(
        store.clone(),
        stats.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );

    // Start collector
    let collector_task = tokio::spawn(Arc::clone(&collector).run(shutdown_rx.clone()));

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = collector_task.await;
        let _ = http_task.await;
    })
    .await;

    instance.close().await;
    for database in &databases {
        database.close().await;
    }

    // Print final stats
    let stats = stats.stats();
    info!(
        collections = stats.collections_total,
        failed_collections = stats.failed_collections_total,
        serialization_errors = stats.serialization_errors_total,
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
