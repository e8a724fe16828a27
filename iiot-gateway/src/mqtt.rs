//! MQTT client contract and the `rumqttc` adapter.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    SubAck, SubscribeReasonCode,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::events::{BusEvent, EventBridge};
use crate::status::GatewayStatus;

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 16;

/// Error type for message-bus operations.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Could not connect to MQTT broker: {0}")]
    Connection(String),
    #[error("Could not subscribe to topic '{topic}': {message}")]
    Subscription { topic: String, message: String },
    #[error("MQTT client error: {0}")]
    Client(String),
    #[error("Not connected to MQTT broker")]
    NotConnected,
    #[error("Invalid QoS {0} (expected 0, 1 or 2)")]
    InvalidQos(u8),
}

/// MQTT quality of service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQos(other)),
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Operations the gateway needs from a message-bus client.
///
/// Implementations deliver inbound traffic asynchronously through the
/// [`EventBridge`] they were built with, on their own task.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), MqttError>;

    async fn disconnect(&self) -> Result<(), MqttError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), MqttError>;
}

struct Connection {
    client: AsyncClient,
    events: JoinHandle<()>,
    sub_acks: mpsc::UnboundedReceiver<SubAck>,
}

/// MQTT client backed by `rumqttc`.
///
/// Every `connect` builds a fresh client and event loop; the event loop is
/// polled by a dedicated task that forwards traffic to the [`EventBridge`]
/// and exits on the first connection error instead of reconnecting, leaving
/// reconnection to the state machine.
pub struct RumqttBus {
    config: MqttConfig,
    password: Option<String>,
    bridge: EventBridge,
    connection: Mutex<Option<Connection>>,
}

impl RumqttBus {
    pub fn new(config: MqttConfig, password: Option<String>, bridge: EventBridge) -> Self {
        Self {
            config,
            password,
            bridge,
            connection: Mutex::new(None),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(true);

        if let Some(username) = &self.config.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }

        if let Some(status_topic) = &self.config.status_topic {
            if let Ok(payload) = GatewayStatus::offline(&self.config.client_id).to_json() {
                options.set_last_will(LastWill::new(
                    status_topic.clone(),
                    payload,
                    rumqttc::QoS::AtLeastOnce,
                    true,
                ));
            }
        }

        options
    }

    /// Poll the event loop until the broker acknowledges the connection.
    async fn handshake(eventloop: &mut EventLoop) -> Result<(), MqttError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(MqttError::Connection(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => continue,
                Err(e) => return Err(MqttError::Connection(e.to_string())),
            }
        }
    }
}

/// Forward event-loop traffic to the bridge until the connection ends.
async fn pump_events(
    mut eventloop: EventLoop,
    bridge: EventBridge,
    sub_acks: mpsc::UnboundedSender<SubAck>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                bridge
                    .dispatch(BusEvent::MessageArrived {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    })
                    .await;
            }
            Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => {
                bridge.dispatch(BusEvent::DeliveryComplete).await;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let _ = sub_acks.send(ack);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                bridge
                    .dispatch(BusEvent::ConnectionLost {
                        cause: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

#[async_trait]
impl MessageBus for RumqttBus {
    async fn connect(&self) -> Result<(), MqttError> {
        let mut connection = self.connection.lock().await;
        if let Some(stale) = connection.take() {
            stale.events.abort();
        }

        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        tokio::time::timeout(self.config.connect_timeout(), Self::handshake(&mut eventloop))
            .await
            .map_err(|_| MqttError::Connection("connection timeout".to_string()))??;

        info!(
            "Connection to MQTT broker {}:{} established",
            self.config.host, self.config.port
        );

        let (ack_tx, sub_acks) = mpsc::unbounded_channel();
        let events = tokio::spawn(pump_events(eventloop, self.bridge.clone(), ack_tx));

        *connection = Some(Connection {
            client,
            events,
            sub_acks,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        let result = connection
            .client
            .disconnect()
            .await
            .map_err(|e| MqttError::Client(e.to_string()));

        // Give the event loop a moment to flush the DISCONNECT packet.
        if tokio::time::timeout(self.config.connect_timeout(), &mut connection.events)
            .await
            .is_err()
        {
            connection.events.abort();
        }

        if result.is_ok() {
            info!("MQTT client disconnected from broker");
        }
        result
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(MqttError::NotConnected)?;

        info!("Subscribing to topic '{}' (QoS {})", topic, qos);
        connection
            .client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| MqttError::Subscription {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        let ack = tokio::time::timeout(self.config.connect_timeout(), connection.sub_acks.recv())
            .await
            .map_err(|_| MqttError::Subscription {
                topic: topic.to_string(),
                message: "no SUBACK received".to_string(),
            })?
            .ok_or_else(|| MqttError::Subscription {
                topic: topic.to_string(),
                message: "connection closed".to_string(),
            })?;

        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(MqttError::Subscription {
                topic: topic.to_string(),
                message: "broker rejected subscription".to_string(),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let guard = self.connection.lock().await;
        let connection = guard.as_ref().ok_or(MqttError::NotConnected)?;

        connection
            .client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::Client(e.to_string()))?;
        info!("Unsubscribed from topic '{}'", topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), MqttError> {
        let guard = self.connection.lock().await;
        let connection = guard.as_ref().ok_or(MqttError::NotConnected)?;

        connection
            .client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| {
                warn!("Failed to publish to '{}': {}", topic, e);
                MqttError::Client(e.to_string())
            })
    }
}
