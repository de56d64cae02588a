//! Standalone device simulator binary.
//!
//! Serves the device wire protocol on a TCP port so the bridge can be run
//! end to end without hardware. Behavior is tuned through environment
//! variables:
//!
//!   DEVICE_SIM_BIND         listen address (default 0.0.0.0:5555)
//!   DEVICE_SIM_ERROR_RATE   probability of an error reply (default 0.2)
//!   DEVICE_SIM_DELAY_MIN_MS minimum reply delay in ms (default 500)
//!   DEVICE_SIM_DELAY_MAX_MS maximum reply delay in ms (default 2000)

use std::time::Duration;

use anyhow::{Context, Result};
use imaging_bridge::simulator::{DeviceSimulator, SimulatorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid value for {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bind = std::env::var("DEVICE_SIM_BIND").unwrap_or_else(|_| "0.0.0.0:5555".to_string());
    let defaults = SimulatorConfig::default();
    let config = SimulatorConfig {
        error_rate: env_or("DEVICE_SIM_ERROR_RATE", defaults.error_rate)?,
        delay_min: Duration::from_millis(env_or(
            "DEVICE_SIM_DELAY_MIN_MS",
            defaults.delay_min.as_millis() as u64,
        )?),
        delay_max: Duration::from_millis(env_or(
            "DEVICE_SIM_DELAY_MAX_MS",
            defaults.delay_max.as_millis() as u64,
        )?),
    };

    if config.error_rate < 0.0 || config.error_rate > 1.0 {
        anyhow::bail!("DEVICE_SIM_ERROR_RATE must be between 0.0 and 1.0");
    }
    if config.delay_min > config.delay_max {
        anyhow::bail!("DEVICE_SIM_DELAY_MIN_MS must not exceed DEVICE_SIM_DELAY_MAX_MS");
    }

    let sim = DeviceSimulator::bind(&bind, config)
        .await
        .with_context(|| format!("Failed to bind simulator to {bind}"))?;
    tracing::info!(addr = %sim.local_addr()?, "Device simulator listening");

    sim.run().await.context("Simulator error")?;
    Ok(())
}
