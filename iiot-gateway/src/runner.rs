//! Gateway runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use crate::args::GatewayArgs;
use crate::config::GatewayConfig;
use crate::driver::{Driver, DriverHandle};
use crate::error::{GatewayError, Result};
use crate::events::EventBridge;
use crate::logging::{init_tracing, with_level_override};
use crate::modbus::{FieldBusMaster, TcpMaster};
use crate::mqtt::{MessageBus, RumqttBus};
use crate::state::{GatewaySettings, GatewayState};

/// Gateway runner that owns the configuration and wires the collaborators.
///
/// Handles:
/// - Logging initialization
/// - Building the MQTT and Modbus adapters
/// - Spawning the state machine driver
/// - Graceful shutdown on Ctrl+C
pub struct GatewayRunner {
    /// The loaded configuration.
    config: GatewayConfig,
}

impl GatewayRunner {
    /// Create a new gateway runner with CLI args for log level override.
    pub fn new_with_args(config: GatewayConfig, args: Option<&GatewayArgs>) -> Result<Self> {
        let override_level = args.and_then(|args| args.log_level.as_deref());
        init_tracing(&with_level_override(&config.logging, override_level))?;

        info!(
            gateway = %config.mqtt.client_id,
            version = env!("CARGO_PKG_VERSION"),
            "Starting gateway"
        );

        Ok(Self { config })
    }

    /// Run the gateway until Ctrl+C is received.
    pub async fn run(self) -> Result<()> {
        let password = self.config.mqtt.resolve_password()?;

        let (driver, handle) = Driver::new(GatewaySettings::from_config(&self.config));
        let bus = Arc::new(RumqttBus::new(
            self.config.mqtt.clone(),
            password,
            EventBridge::new(handle.transitions()),
        ));
        let master = Arc::new(TcpMaster::new(self.config.modbus.clone()));

        info!(
            broker = %format!("{}:{}", self.config.mqtt.host, self.config.mqtt.port),
            slave = %format!("{}:{}", self.config.modbus.host, self.config.modbus.port),
            "Gateway running. Press Ctrl+C to stop."
        );

        let shutdown = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        };

        supervise(driver, handle, bus, master, shutdown).await?;

        info!("Goodbye!");
        Ok(())
    }
}

/// Run `driver` on its own task until `shutdown` resolves.
///
/// On shutdown a stop request is pushed and the driver is awaited through
/// `Disconnecting` to `Disconnected`. If the driver stops on its own first,
/// the runner stays idle until `shutdown` resolves.
pub async fn supervise<B, M, F>(
    driver: Driver,
    handle: DriverHandle,
    bus: Arc<B>,
    master: Arc<M>,
    shutdown: F,
) -> Result<GatewayState>
where
    B: MessageBus,
    M: FieldBusMaster,
    F: Future<Output = ()>,
{
    let mut task = tokio::spawn(driver.run(bus, master));
    tokio::pin!(shutdown);

    tokio::select! {
        _ = &mut shutdown => {
            info!("Received shutdown signal");
            handle.stop().await;
            task.await.map_err(|e| GatewayError::driver(e.to_string()))
        }
        joined = &mut task => {
            let state = joined.map_err(|e| GatewayError::driver(e.to_string()))?;
            warn!(state = %state, "Gateway stopped on its own, waiting for shutdown signal");
            shutdown.await;
            Ok(state)
        }
    }
}
