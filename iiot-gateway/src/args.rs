//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// IIoT gateway: MQTT control commands to Modbus TCP register writes.
#[derive(Parser, Debug, Clone)]
#[command(name = "iiot-gateway")]
#[command(about = "Bridges MQTT control commands to Modbus TCP register writes")]
#[command(version)]
pub struct GatewayArgs {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "gateway.json5")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}
