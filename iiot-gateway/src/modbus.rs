//! Modbus TCP master: request/response model and the `tokio-modbus` adapter.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ModbusConfig;

/// Error type for field-bus operations.
#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Exception response: {0}")]
    Exception(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Master has been shut down")]
    ShutDown,
}

impl ModbusError {
    /// Whether the master can no longer serve any request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModbusError::ShutDown)
    }
}

/// A malformed request, rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value buffer of {len} bytes does not match quantity {quantity} (expected {expected})")]
pub struct ConstraintViolation {
    pub quantity: u16,
    pub len: usize,
    pub expected: usize,
}

/// Write multiple holding registers (function code 16).
///
/// The raw value buffer holds two big-endian bytes per register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMultipleRegisters {
    address: u16,
    quantity: u16,
    values: Vec<u8>,
}

impl WriteMultipleRegisters {
    /// Create a request, checking that `values` holds exactly `2 * quantity` bytes.
    pub fn new(address: u16, quantity: u16, values: Vec<u8>) -> Result<Self, ConstraintViolation> {
        let expected = usize::from(quantity) * 2;
        if values.len() != expected {
            return Err(ConstraintViolation {
                quantity,
                len: values.len(),
                expected,
            });
        }
        Ok(Self {
            address,
            quantity,
            values,
        })
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn quantity(&self) -> u16 {
        self.quantity
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    /// Register words decoded from the raw buffer.
    pub fn words(&self) -> Vec<u16> {
        self.values
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }
}

/// Requests supported by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters(WriteMultipleRegisters),
}

impl ModbusRequest {
    /// Modbus function code of this request.
    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::ReadCoils { .. } => 1,
            ModbusRequest::ReadHoldingRegisters { .. } => 3,
            ModbusRequest::WriteSingleRegister { .. } => 6,
            ModbusRequest::WriteMultipleRegisters(_) => 16,
        }
    }
}

/// Responses, one per request kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    ReadCoils { coils: Vec<bool> },
    ReadHoldingRegisters { registers: Vec<u16> },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
}

/// Capacity of a link's request queue.
const LINK_QUEUE_CAPACITY: usize = 16;

/// Response to a request that has already been handed to the link.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<ModbusResponse, ModbusError>>,
}

/// Completes the matching [`PendingResponse`].
#[derive(Debug)]
pub struct ResponseSlot {
    tx: oneshot::Sender<Result<ModbusResponse, ModbusError>>,
}

impl PendingResponse {
    /// Create a pending response together with the slot that completes it.
    pub fn channel() -> (ResponseSlot, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (ResponseSlot { tx }, PendingResponse { rx })
    }

    /// Wait for the slave's answer.
    pub async fn response(self) -> Result<ModbusResponse, ModbusError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(ModbusError::Transport(
                "link closed before the response arrived".to_string(),
            ))
        })
    }
}

impl ResponseSlot {
    pub fn complete(self, result: Result<ModbusResponse, ModbusError>) {
        let _ = self.tx.send(result);
    }
}

/// Operations the gateway needs from a field-bus master.
#[async_trait]
pub trait FieldBusMaster: Send + Sync + 'static {
    /// Open (or join) the connection to the slave.
    async fn connect(&self) -> Result<(), ModbusError>;

    /// Issue a request to `unit_id`.
    ///
    /// Returns once the request is queued on the link, ahead of any later
    /// `disconnect` or `shutdown`. The answer arrives through the returned
    /// [`PendingResponse`].
    async fn send_request(
        &self,
        request: ModbusRequest,
        unit_id: u8,
    ) -> Result<PendingResponse, ModbusError>;

    /// Release one connection obtained with [`connect`](Self::connect).
    async fn disconnect(&self) -> Result<(), ModbusError>;

    /// Close the connection and release shared transport resources.
    async fn shutdown(&self) -> Result<(), ModbusError>;
}

enum Command {
    Request {
        request: ModbusRequest,
        unit_id: u8,
        reply: ResponseSlot,
    },
    Close,
}

/// An open connection, owned by its serving task.
struct Link {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Link {
    fn open(ctx: Context, timeout: Duration) -> Self {
        let (commands, rx) = mpsc::channel(LINK_QUEUE_CAPACITY);
        let task = tokio::spawn(serve_link(ctx, rx, timeout));
        Self { commands, task }
    }

    /// Close after every queued request has been answered.
    async fn close(self) {
        let _ = self.commands.send(Command::Close).await;
        if let Err(e) = self.task.await {
            warn!("Modbus link task failed: {}", e);
        }
    }
}

/// Run queued requests one at a time until the link is closed.
async fn serve_link(mut ctx: Context, mut commands: mpsc::Receiver<Command>, timeout: Duration) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Request {
                request,
                unit_id,
                reply,
            } => {
                ctx.set_slave(Slave(unit_id));
                debug!(
                    "Sending Modbus request (fc: {}) to unit {}",
                    request.function_code(),
                    unit_id
                );
                let result = match tokio::time::timeout(timeout, exchange(&mut ctx, request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ModbusError::Timeout(timeout)),
                };
                reply.complete(result);
            }
            Command::Close => break,
        }
    }

    if let Err(e) = ctx.disconnect().await {
        warn!("Error while closing Modbus connection: {}", e);
    }
    info!("Modbus master disconnected from slave");
}

/// One request/response round trip on an open context.
async fn exchange(ctx: &mut Context, request: ModbusRequest) -> Result<ModbusResponse, ModbusError> {
    match request {
        ModbusRequest::ReadCoils { address, quantity } => {
            let coils = ctx
                .read_coils(address, quantity)
                .await
                .map_err(|e| ModbusError::Transport(e.to_string()))?
                .map_err(|e| ModbusError::Exception(format!("{:?}", e)))?;
            Ok(ModbusResponse::ReadCoils { coils })
        }
        ModbusRequest::ReadHoldingRegisters { address, quantity } => {
            let registers = ctx
                .read_holding_registers(address, quantity)
                .await
                .map_err(|e| ModbusError::Transport(e.to_string()))?
                .map_err(|e| ModbusError::Exception(format!("{:?}", e)))?;
            Ok(ModbusResponse::ReadHoldingRegisters { registers })
        }
        ModbusRequest::WriteSingleRegister { address, value } => {
            ctx.write_single_register(address, value)
                .await
                .map_err(|e| ModbusError::Transport(e.to_string()))?
                .map_err(|e| ModbusError::Exception(format!("{:?}", e)))?;
            Ok(ModbusResponse::WriteSingleRegister { address, value })
        }
        ModbusRequest::WriteMultipleRegisters(write) => {
            ctx.write_multiple_registers(write.address(), &write.words())
                .await
                .map_err(|e| ModbusError::Transport(e.to_string()))?
                .map_err(|e| ModbusError::Exception(format!("{:?}", e)))?;
            Ok(ModbusResponse::WriteMultipleRegisters {
                address: write.address(),
                quantity: write.quantity(),
            })
        }
    }
}

#[derive(Default)]
struct Shared {
    link: Option<Link>,
    leases: usize,
    shut_down: bool,
}

/// Modbus TCP master backed by `tokio-modbus`.
///
/// The socket is owned by a link task that serves queued requests in order,
/// so callers never hold a lock across a round trip. The connection is
/// lease-counted: every `connect` must be paired with a `disconnect`, and
/// the link closes when the last lease is returned. Closing drains the queue
/// first, so a request issued before `shutdown` still reaches the slave.
pub struct TcpMaster {
    config: ModbusConfig,
    shared: Mutex<Shared>,
}

impl TcpMaster {
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            shared: Mutex::new(Shared::default()),
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, ModbusError> {
        let endpoint = format!("{}:{}", self.config.host, self.config.port);
        tokio::net::lookup_host(&endpoint)
            .await
            .map_err(|e| ModbusError::Connection(format!("Invalid address {}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| ModbusError::Connection(format!("No address for {}", endpoint)))
    }

    async fn dial(&self) -> Result<Context, ModbusError> {
        let addr = self.resolve().await?;
        let ctx = tokio::time::timeout(self.config.timeout(), tcp::connect(addr))
            .await
            .map_err(|_| ModbusError::Connection("Connection timeout".to_string()))?
            .map_err(|e| ModbusError::Connection(e.to_string()))?;
        info!("Modbus master connected to {}", addr);
        Ok(ctx)
    }
}

#[async_trait]
impl FieldBusMaster for TcpMaster {
    async fn connect(&self) -> Result<(), ModbusError> {
        let mut shared = self.shared.lock().await;
        if shared.shut_down {
            return Err(ModbusError::ShutDown);
        }

        if shared.link.is_none() {
            let ctx = self.dial().await?;
            shared.link = Some(Link::open(ctx, self.config.timeout()));
        }

        shared.leases += 1;
        Ok(())
    }

    async fn send_request(
        &self,
        request: ModbusRequest,
        unit_id: u8,
    ) -> Result<PendingResponse, ModbusError> {
        let commands = {
            let shared = self.shared.lock().await;
            if shared.shut_down {
                return Err(ModbusError::ShutDown);
            }
            shared
                .link
                .as_ref()
                .map(|link| link.commands.clone())
                .ok_or(ModbusError::NotConnected)?
        };

        let (reply, pending) = PendingResponse::channel();
        commands
            .send(Command::Request {
                request,
                unit_id,
                reply,
            })
            .await
            .map_err(|_| ModbusError::NotConnected)?;
        Ok(pending)
    }

    async fn disconnect(&self) -> Result<(), ModbusError> {
        let link = {
            let mut shared = self.shared.lock().await;
            shared.leases = shared.leases.saturating_sub(1);
            if shared.leases > 0 {
                debug!("Modbus connection still leased {} time(s)", shared.leases);
                return Ok(());
            }
            shared.link.take()
        };

        if let Some(link) = link {
            link.close().await;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ModbusError> {
        let link = {
            let mut shared = self.shared.lock().await;
            if shared.shut_down {
                debug!("Modbus master already shut down");
                return Ok(());
            }
            shared.shut_down = true;
            shared.leases = 0;
            shared.link.take()
        };

        if let Some(link) = link {
            link.close().await;
        }
        info!("Released Modbus shared resources");
        Ok(())
    }
}
