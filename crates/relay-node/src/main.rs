//! # Relay Node
//!
//! Entry point for both sides of the broker relay.
//!
//! ## Startup Sequence
//!
//! 1. Initialize telemetry (logging, metrics)
//! 2. Load configuration from the environment
//! 3. Apply the service binding, if one is mounted
//! 4. Build transports, registries, worker and/or proxy
//! 5. Run the selected mode
//! 6. Shut down gracefully

use anyhow::{Context, Result};
use relay_node::{NodeConfig, RelayRuntime};
use relay_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(&TelemetryConfig::from_env())
        .context("failed to initialize telemetry")?;

    let config = NodeConfig::from_env().context("failed to load configuration")?;
    info!(
        mode = %config.mode,
        transport = ?config.transport,
        broker_url = %config.broker_url,
        "Loaded configuration"
    );

    let runtime = RelayRuntime::new(config).await?;
    runtime.start();

    let outcome = runtime.run().await;
    if let Err(e) = &outcome {
        error!("Relay run failed: {:#}", e);
    }

    runtime.shutdown().await;
    outcome
}
