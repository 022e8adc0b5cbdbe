//! Real-time analytics service
//!
//! Ingest endpoint, windowed aggregation, cumulative counters and the
//! live-channel gateway in one process.
//!
//! Usage: `realtime-analytics [config.toml]`. `RTA_*` variables override the
//! file, `RUST_LOG` overrides the configured log filter.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use realtime_analytics::observability::{self, DatadogConfig, Metrics, SharedMetrics};
use realtime_analytics::{AppConfig, Pipeline};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::default(),
    }
    .with_env_overrides()?;
    config.validate()?;

    let dd_config = DatadogConfig::from_env();
    observability::init_tracing(&dd_config, &config.logging)?;
    let metrics: SharedMetrics = Arc::new(Metrics::new(&dd_config));

    info!(
        ingest = %config.ingest.addr,
        gateway = %config.gateway.addr,
        window_size_ms = config.aggregator.window_size_ms,
        partitions = config.log.partitions,
        backpressure = config.gateway.backpressure.as_str(),
        "starting realtime analytics"
    );

    let handle = Pipeline::start(config, metrics).await?;

    let failure = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            None
        }
        e = handle.wait() => Some(e),
    };

    let result = handle.shutdown().await;
    observability::shutdown();

    match (failure, result) {
        (Some(e), _) | (None, Err(e)) => {
            error!(error = %e, "pipeline stopped with an error");
            Err(e.into())
        }
        (None, Ok(report)) => {
            info!(
                observed = report.windows.observed,
                emitted = report.windows.emitted,
                late = report.windows.late_dropped,
                counted = report.counted,
                "clean shutdown"
            );
            Ok(())
        }
    }
}
