// vPLC Collector - device performance exporter
//
// A Rust-based collector that polls a fleet of virtual PLC devices for
// cyclic-backup performance data and exposes it on a scrape endpoint.
//
// # Features
// - One independent collection loop per configured device
// - Automatic re-authentication after auth or transport failures
// - Counter-reset absorption for device-side counters
// - Cumulative histograms built from per-range bucket labels
// - Text exposition endpoint on /metrics
//
// # Usage
// VPLC_ACCESS_FILE=/etc/vplc/access.json vplc-collector
//
// Optional: METRICS_PORT (2112), SCRAPE_INTERVAL_SECS (10), REQUEST_TIMEOUT_SECS (5)

use anyhow::{bail, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Module declarations
mod client;
mod collector;
mod config;
mod metrics;
mod scheduler;
mod server;

use config::Settings;
use metrics::MetricRegistry;
use scheduler::CollectorScheduler;

/// Application entry point
///
/// This function:
/// 1. Initializes logging
/// 2. Loads settings and the device list (fatal on error)
/// 3. Creates the shared metric registry
/// 4. Starts one collector task per device
/// 5. Serves the scrape endpoint until Ctrl+C
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging first so configuration errors are visible
    init_logging();

    info!("=== vPLC Collector Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load settings and the device list
    let settings = Settings::from_env().context("Invalid configuration")?;
    let devices = config::load_devices(Path::new(&settings.access_file))
        .context("Failed to load device list")?;

    // Shared between the collectors (writers) and the scrape endpoint (reader)
    let registry = Arc::new(MetricRegistry::new().context("Failed to create metric registry")?);

    let scheduler = CollectorScheduler::new(
        devices,
        Arc::clone(&registry),
        settings.interval,
        settings.request_timeout,
    );
    if scheduler.is_empty() {
        bail!("No device collectors could be created");
    }
    info!("Created {} device collector(s)", scheduler.len());

    // Start collectors
    let collectors = tokio::spawn(scheduler.start());

    // Bind the scrape endpoint
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind scrape endpoint on {}", addr))?;

    info!("=== vPLC Collector Started Successfully ===");
    info!("Serving metrics on http://{}/metrics", addr);

    let served = axum::serve(listener, server::router(registry))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // In-flight cycles are abandoned; every registry update is applied whole.
    collectors.abort();

    if let Err(e) = served {
        error!("Scrape endpoint stopped: {}", e);
        return Err(e.into());
    }

    info!("=== vPLC Collector Stopped ===");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initializes the logging subsystem
///
/// Sets up structured logging with:
/// - Timestamp for each log entry
/// - Log level (INFO, WARN, ERROR, etc.)
/// - Target module name
/// - Colored output when running in terminal
/// - JSON output when running as systemd service
///
/// # Log Levels
/// Default: INFO
/// Can be overridden with RUST_LOG environment variable
///
/// # Examples
/// ```bash
/// RUST_LOG=debug vplc-collector                # Enable debug logging
/// RUST_LOG=vplc_collector::collector=warn ...  # Quieter collectors
/// ```
fn init_logging() {
    // Systemd sets INVOCATION_ID environment variable
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}
