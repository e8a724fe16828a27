//! Error types for the gateway.

use thiserror::Error;

use crate::config::ConfigError;
use crate::modbus::{ConstraintViolation, ModbusError};
use crate::mqtt::MqttError;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can escape a state action or the runner.
///
/// Inside the driver loop every variant is an *unexpected* error: the
/// recoverable cases (broker unreachable, subscribe refused, field-bus
/// transport failures) are handled by the states themselves and never
/// surface here.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// MQTT client error.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    /// Modbus master error.
    #[error("Modbus error: {0}")]
    Modbus(#[from] ModbusError),

    /// Malformed field-bus request.
    #[error("Constraint violation: {0}")]
    Constraint(#[from] ConstraintViolation),

    /// Logging could not be initialized.
    #[error("Failed to initialize tracing: {0}")]
    Tracing(String),

    /// The driver task stopped abnormally.
    #[error("Driver error: {0}")]
    Driver(String),
}

impl GatewayError {
    /// Create a driver error.
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }
}
