use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tsundoku_anidb_client::{ConnectionHandler, HttpConnectionHandler, UdpConnectionHandler};
use tsundoku_worker::jobs::register_anidb_jobs;
use tsundoku_worker::monitors::watch_recovery;
use tsundoku_worker::{
    AcquisitionFilter, AniDbFilter, Config, ConnectivityMonitor, JobStore, JobTypeRegistry,
    NetworkFilter, PgJobStore, Scheduler, SchedulerConfig, StorageFilter, StorageMonitor,
    TcpConnectivityMonitor, TracingSink,
};

/// Interval between connectivity probes
const CONNECTIVITY_PROBE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tsundoku_worker=debug,tsundoku_anidb_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    if tsundoku_shared_config::load_dotenv() {
        tracing::debug!("Loaded .env file");
    }

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(environment = %config.environment(), "Starting tsundoku worker");

    // Initialize database pool
    tracing::info!("Connecting to database...");
    let database = config.database();
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .min_connections(database.min_connections)
        .acquire_timeout(Duration::from_secs(database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(database.idle_timeout_secs))
        .connect(&database.url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection established");

    // Storage stays blocked until the backlog is consistent
    let storage = Arc::new(StorageMonitor::new(true));
    storage.set_blocked(true);

    let store = Arc::new(PgJobStore::new(pool.clone()));
    tracing::info!("Running database migrations...");
    store.migrate().await?;
    tracing::info!("Migrations completed successfully");

    let recovered = store.recover_running().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "Returned jobs orphaned by a previous run to the backlog");
    }
    storage.set_blocked(false);

    let shutdown = CancellationToken::new();

    // AniDB connection handlers
    let udp = Arc::new(UdpConnectionHandler::from_config(config.anidb()));
    let http = Arc::new(HttpConnectionHandler::from_config(config.anidb())?);
    if !udp.has_credentials() {
        tracing::warn!("AniDB credentials not configured; UDP jobs stay paused");
    }
    let maintenance = udp.spawn_maintenance(shutdown.clone());
    let http_maintenance = http.spawn_maintenance(shutdown.clone());

    // Job types
    let mut registry = JobTypeRegistry::new();
    register_anidb_jobs(
        &mut registry,
        Arc::clone(&udp),
        Arc::clone(&http),
        Arc::new(TracingSink),
    )?;
    let registry = Arc::new(registry);

    // Monitors
    let storage_probe =
        storage.spawn_pg_probe(pool.clone(), config.storage_probe_interval(), shutdown.clone());

    let mut tcp_monitors = Vec::new();
    for target in &config.connectivity_probes {
        let monitor = Arc::new(TcpConnectivityMonitor::new(target.clone()));
        monitor.spawn(CONNECTIVITY_PROBE_INTERVAL, shutdown.clone());
        tcp_monitors.push(monitor);
    }
    let connectivity: Vec<Arc<dyn ConnectivityMonitor>> = tcp_monitors
        .into_iter()
        .map(|monitor| monitor as Arc<dyn ConnectivityMonitor>)
        .collect();
    if connectivity.is_empty() {
        tracing::warn!("No connectivity probes configured; network jobs stay paused");
    }

    // Re-establish the UDP session when the network comes back
    let reconnect = tokio::spawn({
        let udp = Arc::clone(&udp);
        let monitors = connectivity.clone();
        let shutdown = shutdown.clone();
        async move {
            watch_recovery(monitors, shutdown, || {
                let udp = Arc::clone(&udp);
                async move { udp.force_reconnection().await }
            })
            .await;
        }
    });

    // Acquisition filters
    let udp_handler: Arc<dyn ConnectionHandler> = udp.clone();
    let http_handler: Arc<dyn ConnectionHandler> = http.clone();
    let filters: Vec<Arc<dyn AcquisitionFilter>> = vec![
        Arc::new(StorageFilter::new(Arc::clone(&storage), &registry)),
        Arc::new(NetworkFilter::new(connectivity, &registry)),
        Arc::new(AniDbFilter::session(udp_handler, &registry)),
        Arc::new(AniDbFilter::stateless(http_handler, &registry)),
    ];

    let store: Arc<dyn JobStore> = store;
    let scheduler = Scheduler::new(
        SchedulerConfig::from_config(&config),
        store,
        registry,
        filters,
        shutdown.clone(),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        }
    });

    scheduler.run().await;

    // The maintenance task logs out of AniDB on shutdown
    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "AniDB maintenance task ended abnormally");
    }
    let _ = tokio::join!(http_maintenance, storage_probe, reconnect);
    pool.close().await;

    tracing::info!("tsundoku worker stopped");
    Ok(())
}
