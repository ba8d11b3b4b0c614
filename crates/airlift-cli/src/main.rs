//! Airlift CLI
//!
//! Deploys release plans into air-gapped clusters.

use airlift_common::telemetry::{init_telemetry, TelemetryConfig};
use clap::Parser;

use airlift_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::default();
    telemetry.json |= cli.json_logs;
    init_telemetry(telemetry)?;

    cli.run().await?;
    Ok(())
}
