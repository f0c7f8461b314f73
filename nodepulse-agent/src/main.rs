//! nodepulse agent - node-side health reporter
//!
//! Samples host metrics on a fixed cadence and pushes them to the kernel:
//! - CPU, memory, swap, disk space and load
//! - Disk and network I/O rates from cumulative counters
//! - Optional lm-sensors temperatures
//!
//! `nodepulse-agent sensors` prints the sensor readings and exits.

mod config;
mod metrics;
mod reporter;
mod sensors;

use anyhow::{Context, Result};
use config::AgentConfig;
use metrics::SysinfoProbe;
use reporter::Reporter;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if std::env::args().nth(1).as_deref() == Some("sensors") {
        return print_sensors().await;
    }

    info!("nodepulse agent starting...");

    let config = AgentConfig::load().await.context("Failed to load agent config")?;
    let mut reporter = Reporter::new(&config, SysinfoProbe::new());

    tokio::select! {
        _ = reporter.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutdown signal received, stopping agent");
        }
    }
    Ok(())
}

async fn print_sensors() -> Result<()> {
    let readings = sensors::read_temperatures()
        .await
        .context("Failed to read sensors")?;
    println!("Sensors Output:");
    for (name, celsius) in &readings {
        println!("{}: {:.2}", name, celsius);
    }
    Ok(())
}
