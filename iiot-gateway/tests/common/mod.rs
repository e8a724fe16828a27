//! Recording collaborators for driving the gateway without a broker or slave.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;

use iiot_gateway::{
    Driver, DriverHandle, FieldBusMaster, GatewaySettings, GatewayState, MessageBus, ModbusError,
    ModbusRequest, ModbusResponse, MqttError, PendingResponse, QoS,
};

/// Upper bound on waiting for a commit, in (paused) test time.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    Connect,
    Disconnect,
    Subscribe(String, QoS),
    Unsubscribe(String),
    Publish {
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    },
}

/// Consume one scheduled failure, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct MockBus {
    calls: Mutex<Vec<BusCall>>,
    connected: AtomicBool,
    connect_failures: AtomicUsize,
    subscribe_failures: AtomicUsize,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connects.
    pub fn failing_connects(self, n: usize) -> Self {
        self.connect_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` subscribes.
    pub fn failing_subscribes(self, n: usize) -> Self {
        self.subscribe_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &BusCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn publishes(&self) -> Vec<BusCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BusCall::Publish { .. }))
            .collect()
    }

    fn record(&self, call: BusCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn connect(&self) -> Result<(), MqttError> {
        self.record(BusCall::Connect);
        if take_failure(&self.connect_failures) {
            return Err(MqttError::Connection("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.record(BusCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.record(BusCall::Subscribe(topic.to_string(), qos));
        if take_failure(&self.subscribe_failures) {
            return Err(MqttError::Subscription {
                topic: topic.to_string(),
                message: "not authorized".to_string(),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.record(BusCall::Unsubscribe(topic.to_string()));
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), MqttError> {
        self.record(BusCall::Publish {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterCall {
    Connect,
    Send(ModbusRequest, u8),
    Disconnect,
    Shutdown,
}

#[derive(Default)]
pub struct MockMaster {
    calls: Mutex<Vec<MasterCall>>,
    refuse_connect: AtomicBool,
    fail_shutdown: AtomicBool,
    shut_down: AtomicBool,
    connect_gate: Option<Arc<Semaphore>>,
    response_gate: Option<Arc<Semaphore>>,
    released: Notify,
}

impl MockMaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect fails with a transport error.
    pub fn refusing(self) -> Self {
        self.refuse_connect.store(true, Ordering::SeqCst);
        self
    }

    /// The master starts out shut down.
    pub fn already_shut_down(self) -> Self {
        self.shut_down.store(true, Ordering::SeqCst);
        self
    }

    /// `shutdown` reports an error.
    pub fn failing_shutdown(self) -> Self {
        self.fail_shutdown.store(true, Ordering::SeqCst);
        self
    }

    /// Each connect waits for a permit on `gate`.
    pub fn with_connect_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.connect_gate = Some(gate);
        self
    }

    /// Each response waits for a permit on `gate`.
    pub fn with_response_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.response_gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<MasterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &MasterCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Wait until a connection lease has been returned.
    pub async fn released(&self) {
        tokio::time::timeout(COMMIT_TIMEOUT, self.released.notified())
            .await
            .expect("Modbus connection was never released");
    }

    fn record(&self, call: MasterCall) {
        self.calls.lock().unwrap().push(call);
    }
}

async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

#[async_trait]
impl FieldBusMaster for MockMaster {
    async fn connect(&self) -> Result<(), ModbusError> {
        pass(&self.connect_gate).await;
        self.record(MasterCall::Connect);
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ModbusError::ShutDown);
        }
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(ModbusError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    async fn send_request(
        &self,
        request: ModbusRequest,
        unit_id: u8,
    ) -> Result<PendingResponse, ModbusError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ModbusError::ShutDown);
        }
        self.record(MasterCall::Send(request.clone(), unit_id));

        let result = match request {
            ModbusRequest::WriteMultipleRegisters(write) => {
                Ok(ModbusResponse::WriteMultipleRegisters {
                    address: write.address(),
                    quantity: write.quantity(),
                })
            }
            other => Err(ModbusError::Exception(format!(
                "unsupported function {}",
                other.function_code()
            ))),
        };

        let (slot, pending) = PendingResponse::channel();
        let gate = self.response_gate.clone();
        tokio::spawn(async move {
            pass(&gate).await;
            slot.complete(result);
        });
        Ok(pending)
    }

    async fn disconnect(&self) -> Result<(), ModbusError> {
        self.record(MasterCall::Disconnect);
        self.released.notify_one();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ModbusError> {
        self.record(MasterCall::Shutdown);
        self.shut_down.store(true, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(ModbusError::Transport("socket already closed".to_string()));
        }
        Ok(())
    }
}

/// A gateway driver running on its own task.
pub struct Harness {
    pub handle: DriverHandle,
    pub commits: broadcast::Receiver<GatewayState>,
    pub task: JoinHandle<GatewayState>,
}

impl Harness {
    pub fn spawn(settings: GatewaySettings, bus: Arc<MockBus>, master: Arc<MockMaster>) -> Self {
        let (driver, handle) = Driver::new(settings);
        let commits = handle.subscribe_commits();
        let task = tokio::spawn(driver.run(bus, master));
        Self {
            handle,
            commits,
            task,
        }
    }

    /// The next committed state.
    pub async fn next_commit(&mut self) -> GatewayState {
        tokio::time::timeout(COMMIT_TIMEOUT, self.commits.recv())
            .await
            .expect("no state committed in time")
            .expect("commit log closed")
    }

    /// Collect the next `n` committed states.
    pub async fn commits(&mut self, n: usize) -> Vec<GatewayState> {
        let mut states = Vec::with_capacity(n);
        for _ in 0..n {
            states.push(self.next_commit().await);
        }
        states
    }

    /// Wait for the driver to reach `Subscribed` from `Initial`.
    pub async fn until_subscribed(&mut self) {
        assert_eq!(
            self.commits(2).await,
            vec![GatewayState::Connected, GatewayState::Subscribed]
        );
    }

    /// Stop the gateway and wait for the driver to finish.
    pub async fn stop(self) -> GatewayState {
        self.handle.stop().await;
        tokio::time::timeout(COMMIT_TIMEOUT, self.task)
            .await
            .expect("driver did not stop in time")
            .expect("driver task panicked")
    }
}
