//! MQTT to Modbus TCP gateway.

use anyhow::{Context, Result};
use clap::Parser;
use iiot_gateway::{GatewayArgs, GatewayConfig, GatewayRunner};

#[tokio::main]
async fn main() -> Result<()> {
    let args = GatewayArgs::parse();

    let config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let runner = GatewayRunner::new_with_args(config, Some(&args))?;
    tracing::info!("Loaded configuration from {:?}", args.config);

    runner.run().await?;
    Ok(())
}
