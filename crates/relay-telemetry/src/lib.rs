//! # Relay Telemetry
//!
//! Logging and metrics for relay processes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::for_role("worker");
//! let _guard = init_telemetry(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_SERVICE_NAME` | `relay` | Service name attached to log lines |
//! | `RELAY_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter directives |
//! | `RELAY_JSON_LOGS` | `true` in containers | JSON formatted output |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    gather_text, observe_registry, register_metrics, RegistryMetrics, ACTIVE_REGISTRATIONS,
    DECODE_FAILURES, DISPATCH_RUNNING, ENVELOPES_DISPATCHED, ENVELOPES_NACKED, ENVELOPES_VENTED,
    REGISTRY, WAIT_TIMEOUTS,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Install logging and register metrics.
///
/// The returned guard logs a final line when dropped.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    register_metrics()?;
    init_logging(config)?;
    Ok(TelemetryGuard {
        service_name: config.service_name.clone(),
    })
}

pub struct TelemetryGuard {
    service_name: String,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}
