//! Gateway status reporting.

use serde::{Deserialize, Serialize};

use crate::mqtt::{MessageBus, MqttError, QoS};

/// Gateway status, published retained to the configured status topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// Gateway identifier (the MQTT client id).
    pub gateway: String,
    /// Gateway version.
    pub version: String,
    /// Current status ("online", "offline").
    pub status: String,
    /// Timestamp (millis since epoch).
    pub timestamp: i64,
}

impl GatewayStatus {
    fn new(gateway: impl Into<String>, status: &str) -> Self {
        Self {
            gateway: gateway.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a status with "online" state.
    pub fn online(gateway: impl Into<String>) -> Self {
        Self::new(gateway, "online")
    }

    /// Create a status with "offline" state.
    pub fn offline(gateway: impl Into<String>) -> Self {
        Self::new(gateway, "offline")
    }

    /// Serialize to a JSON payload.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Publish this status, retained, at QoS 1.
    pub async fn publish<B: MessageBus + ?Sized>(
        &self,
        bus: &B,
        topic: &str,
    ) -> Result<(), MqttError> {
        let payload = self
            .to_json()
            .map_err(|e| MqttError::Client(format!("Failed to encode status: {}", e)))?;
        bus.publish(topic, QoS::AtLeastOnce, true, payload).await
    }
}
