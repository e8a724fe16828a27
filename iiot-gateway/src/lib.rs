//! MQTT to Modbus TCP gateway.
//!
//! The gateway subscribes to a command topic on an MQTT broker and turns
//! every message into a holding-register write on a Modbus TCP slave. Its
//! lifecycle is a state machine run by a single [`Driver`]:
//!
//! ```text
//! Initial -> Connected -> Subscribed <-> SendRequest(payload)
//!    ^  \                     |
//!    |   ConnectionError <----+ (connection lost)
//!    +------- (5s) ------'
//!
//! any state -> Disconnecting -> Disconnected   (stop)
//! ```
//!
//! Payloads map to register values: `"Cherry"` writes 1, `"Mint"` writes 2,
//! anything else writes 0.

pub mod args;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod logging;
pub mod modbus;
pub mod mqtt;
pub mod runner;
pub mod state;
pub mod status;

pub use args::GatewayArgs;
pub use config::GatewayConfig;
pub use driver::{Driver, DriverHandle, TransitionRequest, TransitionSender};
pub use error::{GatewayError, Result};
pub use events::{BusEvent, EventBridge};
pub use modbus::{
    FieldBusMaster, ModbusError, ModbusRequest, ModbusResponse, PendingResponse, ResponseSlot,
    TcpMaster,
};
pub use mqtt::{MessageBus, MqttError, QoS, RumqttBus};
pub use runner::{GatewayRunner, supervise};
pub use state::{BACKOFF, GatewaySettings, GatewayState};
