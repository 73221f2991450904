//! coordcheck-server - coordinate validation and learning microservice
//!
//! Validates device position reports against temporal, kinematic, and
//! corroboration checks while crowd-learning a map of stationary wireless
//! sources from the same reports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use coordcheck_common::events::EventBus;
use coordcheck_common::params::{ConfigRegistry, Settings};
use coordcheck_server::analytics::SqliteAnalytics;
use coordcheck_server::catalog::SqliteCache;
use coordcheck_server::{build_router, AppState};

/// Shutdown drain deadline for the async sink
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// coordcheck - coordinate plausibility validation service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to bind to (overrides SERVER_PORT)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Catalog database path (overrides CATALOG_DB_PATH)
    #[arg(long, value_name = "FILE")]
    catalog_db: Option<String>,

    /// Analytics database path (overrides ANALYTICS_DB_PATH)
    #[arg(long, value_name = "FILE")]
    analytics_db: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("coordcheck_server={},coordcheck_common={}", log_level, log_level).into()
            }),
        )
        .init();

    info!(
        "Starting coordcheck-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_REV"),
        env!("BUILD_TIME_UTC"),
        env!("BUILD_PROFILE")
    );

    let mut settings = Settings::from_env();
    if let Some(port) = args.port {
        settings.server_port = port;
    }
    if let Some(path) = args.catalog_db {
        settings.catalog_db_path = path;
    }
    if let Some(path) = args.analytics_db {
        settings.analytics_db_path = path;
    }

    info!("  Max speed: {:.1} km/h", settings.max_speed_kmh);
    info!("  Max time diff: {}h", settings.max_time_diff_hours);
    info!(
        "  Learning: min_observations={}, variance_threshold={:e}, window={}h",
        settings.min_observations, settings.variance_threshold, settings.time_window_hours
    );

    // Catalog and analytics must be reachable at startup; anything else is
    // fatal and exits non-zero
    let catalog_path = std::path::PathBuf::from(&settings.catalog_db_path);
    let kv = SqliteCache::open(&catalog_path)
        .await
        .context("failed to open catalog store")?;

    let analytics_path = std::path::PathBuf::from(&settings.analytics_db_path);
    let analytics = SqliteAnalytics::open(&analytics_path)
        .await
        .context("failed to open analytics store")?;

    let port = settings.server_port;
    let config = Arc::new(ConfigRegistry::new(settings));
    let bus = EventBus::new(1000);

    let state = AppState::new(Arc::new(kv), Arc::new(analytics), config, bus);
    let sink = state.sink.clone();
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", bind_addr))?;
    info!("coordcheck-server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Draining async sink...");
    sink.shutdown(SHUTDOWN_DEADLINE).await;
    info!("Server exited cleanly");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install shutdown handler: {}", e);
        return;
    }
    info!("Received shutdown signal, stopping server...");
}
