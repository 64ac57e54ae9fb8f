//! OpenTelemetry metrics for the postbag dispatcher
//!
//! Dispatch metrics are exported via OTLP to an OpenTelemetry Collector.
//!
//! # Architecture
//!
//! ```text
//! postbag → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use postbag_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! init_metrics(&config)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod error;
mod exporter;

use std::sync::Arc;

pub use config::MetricsConfig;
pub use dispatch::DispatchMetrics;
pub use error::MetricsError;
use once_cell::sync::OnceCell;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub dispatch: Arc<DispatchMetrics>,
}

/// Initialize the metrics system
///
/// Must be called once at startup before any metrics are recorded. If metrics
/// are disabled in the config, this is a no-op.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called multiple times.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        dispatch: Arc::new(DispatchMetrics::new()?),
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// Get the global metrics instance, if metrics were initialized
#[must_use]
pub fn metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
