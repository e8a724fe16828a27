//! Event bridge: turns asynchronous MQTT notifications into transition requests.

use tracing::{error, info};

use crate::driver::{TransitionRequest, TransitionSender};
use crate::state::BACKOFF;

/// Notifications raised by the message-bus client on its own task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A message arrived on a subscribed topic.
    MessageArrived { topic: String, payload: Vec<u8> },
    /// The broker connection dropped.
    ConnectionLost { cause: String },
    /// An outgoing publish was acknowledged.
    DeliveryComplete,
}

impl BusEvent {
    /// The transition this event requests, if any.
    pub fn transition(&self) -> Option<TransitionRequest> {
        match self {
            BusEvent::MessageArrived { payload, .. } => Some(TransitionRequest::message(
                String::from_utf8_lossy(payload).into_owned(),
            )),
            BusEvent::ConnectionLost { .. } => Some(TransitionRequest::connection_lost()),
            BusEvent::DeliveryComplete => None,
        }
    }
}

/// Registration point handed to the message-bus client.
#[derive(Debug, Clone)]
pub struct EventBridge {
    transitions: TransitionSender,
}

impl EventBridge {
    pub fn new(transitions: TransitionSender) -> Self {
        Self { transitions }
    }

    /// Log the event and forward its transition request to the driver.
    pub async fn dispatch(&self, event: BusEvent) {
        match &event {
            BusEvent::MessageArrived { topic, payload } => {
                info!(
                    "MQTT message arrived for topic '{}': '{}'",
                    topic,
                    String::from_utf8_lossy(payload)
                );
            }
            BusEvent::ConnectionLost { cause } => {
                error!(
                    "Connection to MQTT broker lost: {}. Trying to reconnect in {} seconds",
                    cause,
                    BACKOFF.as_secs()
                );
            }
            BusEvent::DeliveryComplete => info!("MQTT message delivery complete"),
        }

        if let Some(request) = event.transition() {
            self.transitions.push(request).await;
        }
    }
}
