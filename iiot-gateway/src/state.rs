//! Gateway states and their transition table.
//!
//! | State             | Success            | Failure                    |
//! |-------------------|--------------------|----------------------------|
//! | `Initial`         | `Connected`        | `ConnectionError`          |
//! | `ConnectionError` | `Initial` after 5s | -                          |
//! | `Connected`       | `Subscribed`       | `Connected` after 5s       |
//! | `Subscribed`      | suspend            | -                          |
//! | `SendRequest`     | `Subscribed`       | `Subscribed`               |
//! | `Disconnecting`   | `Disconnected`     | `Disconnected`             |
//! | `Disconnected`    | terminal           | -                          |
//!
//! An `Err` from any other action forces `Disconnecting`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::modbus::{FieldBusMaster, ModbusRequest, ModbusResponse, WriteMultipleRegisters};
use crate::mqtt::{MessageBus, QoS};
use crate::status::GatewayStatus;

/// Fixed delay before reconnecting or re-subscribing.
pub const BACKOFF: Duration = Duration::from_secs(5);

/// The gateway states. Exactly one is current at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayState {
    Initial,
    Connected,
    Subscribed,
    ConnectionError,
    SendRequest(String),
    Disconnecting,
    Disconnected,
}

/// What the driver does after a state's action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Commit the state right away.
    Now(GatewayState),
    /// Commit the state once the delay has elapsed, unless pre-empted.
    After(Duration, GatewayState),
    /// Wait for an external transition request.
    Suspend,
}

/// Values injected into the state actions.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// MQTT client id, reported in status messages
    pub gateway_id: String,
    /// Topic filter carrying control commands
    pub topic: String,
    /// QoS of the command subscription
    pub qos: QoS,
    /// Retained status topic, if status publishing is enabled
    pub status_topic: Option<String>,
    /// Target Modbus unit
    pub unit_id: u8,
    /// Target holding register
    pub register: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            gateway_id: "iiot-gateway".to_string(),
            topic: "candy/#".to_string(),
            qos: QoS::ExactlyOnce,
            status_topic: None,
            unit_id: 1,
            register: 4,
        }
    }
}

impl GatewaySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            gateway_id: config.mqtt.client_id.clone(),
            topic: config.mqtt.topic.clone(),
            qos: QoS::ExactlyOnce,
            status_topic: config.mqtt.status_topic.clone(),
            unit_id: config.modbus.unit_id,
            register: config.modbus.register,
        }
    }
}

/// Collaborator handles shared by all state actions.
pub struct StateContext<B, M> {
    pub bus: Arc<B>,
    pub master: Arc<M>,
    pub settings: GatewaySettings,
}

/// Map a command payload to the register value written to the slave.
pub fn register_value(payload: &str) -> u8 {
    match payload {
        "Cherry" => 0x01,
        "Mint" => 0x02,
        _ => 0x00,
    }
}

impl GatewayState {
    /// State name without payload.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayState::Initial => "Initial",
            GatewayState::Connected => "Connected",
            GatewayState::Subscribed => "Subscribed",
            GatewayState::ConnectionError => "ConnectionError",
            GatewayState::SendRequest(_) => "SendRequest",
            GatewayState::Disconnecting => "Disconnecting",
            GatewayState::Disconnected => "Disconnected",
        }
    }

    /// Whether the driver stops once this state is committed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GatewayState::Disconnected)
    }

    /// Successor under success.
    pub fn declared_successor(&self) -> Step {
        match self {
            GatewayState::Initial => Step::Now(GatewayState::Connected),
            GatewayState::ConnectionError => Step::After(BACKOFF, GatewayState::Initial),
            GatewayState::Connected => Step::Now(GatewayState::Subscribed),
            GatewayState::Subscribed => Step::Suspend,
            GatewayState::SendRequest(_) => Step::Now(GatewayState::Subscribed),
            GatewayState::Disconnecting => Step::Now(GatewayState::Disconnected),
            GatewayState::Disconnected => Step::Suspend,
        }
    }

    /// Run this state's action and report the next step.
    ///
    /// Recoverable failures are handled here and turn into their failure
    /// successor; an `Err` means the failure was unexpected.
    pub async fn execute<B, M>(&self, ctx: &StateContext<B, M>) -> Result<Step>
    where
        B: MessageBus,
        M: FieldBusMaster,
    {
        match self {
            GatewayState::Initial => {
                info!("Connecting to MQTT broker");
                if let Err(e) = ctx.bus.connect().await {
                    error!(error = %e, "MQTT connection failed");
                    return Ok(Step::Now(GatewayState::ConnectionError));
                }
                if let Some(topic) = &ctx.settings.status_topic {
                    if let Err(e) = GatewayStatus::online(&ctx.settings.gateway_id)
                        .publish(ctx.bus.as_ref(), topic)
                        .await
                    {
                        warn!(error = %e, "Failed to publish online status");
                    }
                }
                Ok(self.declared_successor())
            }
            GatewayState::ConnectionError => {
                info!(
                    "Retrying to connect to MQTT broker in {} seconds",
                    BACKOFF.as_secs()
                );
                Ok(self.declared_successor())
            }
            GatewayState::Connected => {
                match ctx
                    .bus
                    .subscribe(&ctx.settings.topic, ctx.settings.qos)
                    .await
                {
                    Ok(()) => Ok(self.declared_successor()),
                    Err(e) => {
                        error!(error = %e, "Subscription failed");
                        info!(
                            "Retrying to subscribe to topic in {} seconds",
                            BACKOFF.as_secs()
                        );
                        Ok(Step::After(BACKOFF, GatewayState::Connected))
                    }
                }
            }
            GatewayState::Subscribed => Ok(Step::Suspend),
            GatewayState::SendRequest(payload) => {
                self.send_request(payload, ctx).await?;
                Ok(self.declared_successor())
            }
            GatewayState::Disconnecting => {
                disconnect(ctx).await?;
                Ok(self.declared_successor())
            }
            GatewayState::Disconnected => Ok(Step::Suspend),
        }
    }

    /// Issue the register write and hand its completion to a continuation task.
    ///
    /// Transport failures are logged and skip this request. A master that has
    /// been shut down is an unexpected error.
    async fn send_request<B, M>(&self, payload: &str, ctx: &StateContext<B, M>) -> Result<()>
    where
        B: MessageBus,
        M: FieldBusMaster,
    {
        let value = register_value(payload);
        let write = WriteMultipleRegisters::new(ctx.settings.register, 1, vec![0, value])?;

        if let Err(e) = ctx.master.connect().await {
            if e.is_fatal() {
                return Err(e.into());
            }
            error!(error = %e, "Could not connect to Modbus slave");
            return Ok(());
        }

        info!("Sending Modbus request (fc: 16), value: {}", value);
        let pending = match ctx
            .master
            .send_request(
                ModbusRequest::WriteMultipleRegisters(write),
                ctx.settings.unit_id,
            )
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                release(ctx.master.as_ref()).await;
                if e.is_fatal() {
                    return Err(e.into());
                }
                error!(error = %e, "Could not send Modbus request");
                return Ok(());
            }
        };

        let master = Arc::clone(&ctx.master);
        tokio::spawn(async move {
            match pending.response().await {
                Ok(ModbusResponse::WriteMultipleRegisters { address, .. }) => {
                    info!(
                        "Received Modbus response for function 16, affecting address {}",
                        address
                    );
                }
                Ok(other) => warn!("Unexpected Modbus response: {:?}", other),
                Err(e) => error!(error = %e, "Modbus request failed"),
            }
            release(master.as_ref()).await;
        });

        Ok(())
    }
}

async fn release<M: FieldBusMaster>(master: &M) {
    if let Err(e) = master.disconnect().await {
        warn!(error = %e, "Modbus disconnect failed");
    }
}

/// Teardown of both collaborators.
///
/// Message-bus steps are best-effort. A failed field-bus shutdown is
/// returned so the driver can force `Disconnected`.
async fn disconnect<B, M>(ctx: &StateContext<B, M>) -> Result<()>
where
    B: MessageBus,
    M: FieldBusMaster,
{
    if let Err(e) = ctx.bus.unsubscribe(&ctx.settings.topic).await {
        debug!(error = %e, "Unsubscribe skipped");
    }

    if let Some(topic) = &ctx.settings.status_topic {
        if let Err(e) = GatewayStatus::offline(&ctx.settings.gateway_id)
            .publish(ctx.bus.as_ref(), topic)
            .await
        {
            debug!(error = %e, "Offline status not published");
        }
    }

    if let Err(e) = ctx.bus.disconnect().await {
        warn!(error = %e, "Could not disconnect from MQTT broker");
    }

    ctx.master.shutdown().await?;
    Ok(())
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayState::SendRequest(payload) => write!(f, "SendRequest({:?})", payload),
            other => f.write_str(other.name()),
        }
    }
}
