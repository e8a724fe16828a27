//! Configuration for the gateway.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Environment variable '{0}' is not set")]
    MissingEnv(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// MQTT broker connection profile
    pub mqtt: MqttConfig,

    /// Modbus TCP connection profile
    pub modbus: ModbusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker connection profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address
    pub host: String,

    /// Broker TCP port (default: 1883)
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// MQTT client identifier
    pub client_id: String,

    /// Optional user name
    #[serde(default)]
    pub username: Option<String>,

    /// Literal password (prefer `password_env`)
    #[serde(default)]
    pub password: Option<String>,

    /// Name of the environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,

    /// Topic filter carrying control commands (default: "candy/#")
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Retained gateway status topic; status publishing is off when unset
    #[serde(default)]
    pub status_topic: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Timeout for the CONNECT/CONNACK and SUBSCRIBE/SUBACK exchanges
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "candy/#".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

impl MqttConfig {
    /// Resolve the broker password from the literal value or the environment.
    pub fn resolve_password(&self) -> Result<Option<String>, ConfigError> {
        if let Some(var) = &self.password_env {
            return std::env::var(var)
                .map(Some)
                .map_err(|_| ConfigError::MissingEnv(var.clone()));
        }
        Ok(self.password.clone())
    }

    /// Timeout applied to broker handshakes.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Modbus TCP connection profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Holding register receiving the command value
    #[serde(default = "default_register")]
    pub register: u16,

    /// Connect and request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_register() -> u16 {
    4
}

fn default_timeout_ms() -> u64 {
    1000
}

impl ModbusConfig {
    /// Timeout applied to connects and requests.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json"
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;

        if mqtt.host.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.host cannot be empty".to_string(),
            ));
        }

        if mqtt.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.client_id cannot be empty".to_string(),
            ));
        }

        validate_topic_filter(&mqtt.topic)?;

        if let Some(status_topic) = &mqtt.status_topic {
            if status_topic.is_empty() || status_topic.contains(['#', '+']) {
                return Err(ConfigError::Validation(format!(
                    "mqtt.status_topic '{}' must be a non-empty topic without wildcards",
                    status_topic
                )));
            }
        }

        if mqtt.password.is_some() && mqtt.password_env.is_some() {
            return Err(ConfigError::Validation(
                "mqtt.password and mqtt.password_env are mutually exclusive".to_string(),
            ));
        }

        if self.modbus.host.is_empty() {
            return Err(ConfigError::Validation(
                "modbus.host cannot be empty".to_string(),
            ));
        }

        if self.modbus.unit_id == 0 || self.modbus.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "modbus.unit_id must be 1-247, got {}",
                self.modbus.unit_id
            )));
        }

        Ok(())
    }
}

/// Check MQTT topic filter wildcard placement.
fn validate_topic_filter(filter: &str) -> Result<(), ConfigError> {
    if filter.is_empty() {
        return Err(ConfigError::Validation(
            "mqtt.topic cannot be empty".to_string(),
        ));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let misplaced_hash = level.contains('#') && (*level != "#" || i + 1 != levels.len());
        let misplaced_plus = level.contains('+') && *level != "+";
        if misplaced_hash || misplaced_plus {
            return Err(ConfigError::Validation(format!(
                "mqtt.topic '{}' has a misplaced wildcard",
                filter
            )));
        }
    }

    Ok(())
}
