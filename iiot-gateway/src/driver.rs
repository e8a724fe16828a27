//! The driver loop: sole owner of the current gateway state.
//!
//! Every writer of "current state" goes through one commit point. A state's
//! own successor is committed only if no external [`TransitionRequest`] was
//! received while its action ran; external requests arrive over a single
//! bounded channel whose only reader is the driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::modbus::FieldBusMaster;
use crate::mqtt::MessageBus;
use crate::state::{GatewaySettings, GatewayState, StateContext, Step};

/// Capacity of the transition request queue.
pub const TRANSITION_QUEUE_CAPACITY: usize = 256;

/// Number of committed states kept for lagging observers.
const COMMIT_LOG_CAPACITY: usize = 64;

/// Where a transition request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    MessageArrived,
    ConnectionLost,
    Stop,
}

/// A state pushed to the driver from outside the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub state: GatewayState,
    pub origin: Origin,
}

impl TransitionRequest {
    /// Serve an inbound command payload.
    pub fn message(payload: impl Into<String>) -> Self {
        Self {
            state: GatewayState::SendRequest(payload.into()),
            origin: Origin::MessageArrived,
        }
    }

    /// Reconnect after the broker connection dropped.
    pub fn connection_lost() -> Self {
        Self {
            state: GatewayState::ConnectionError,
            origin: Origin::ConnectionLost,
        }
    }

    /// Shut the gateway down.
    pub fn stop() -> Self {
        Self {
            state: GatewayState::Disconnecting,
            origin: Origin::Stop,
        }
    }
}

/// Sending side of the transition channel.
#[derive(Debug, Clone)]
pub struct TransitionSender {
    tx: mpsc::Sender<TransitionRequest>,
}

impl TransitionSender {
    /// Queue a request for the driver. Returns `false` once the driver is gone.
    pub async fn push(&self, request: TransitionRequest) -> bool {
        match self.tx.send(request).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(request)) => {
                debug!(state = %request.state, "Driver stopped, transition request dropped");
                false
            }
        }
    }
}

/// Handle for feeding and observing a running [`Driver`].
#[derive(Debug, Clone)]
pub struct DriverHandle {
    transitions: TransitionSender,
    state: watch::Receiver<GatewayState>,
    commits: broadcast::Sender<GatewayState>,
}

impl DriverHandle {
    /// A sender for event sources.
    pub fn transitions(&self) -> TransitionSender {
        self.transitions.clone()
    }

    /// Request an orderly shutdown.
    pub async fn stop(&self) {
        info!("Stop requested");
        self.transitions.push(TransitionRequest::stop()).await;
    }

    /// The currently committed state.
    pub fn state(&self) -> GatewayState {
        self.state.borrow().clone()
    }

    /// Watch the committed state.
    pub fn watch_state(&self) -> watch::Receiver<GatewayState> {
        self.state.clone()
    }

    /// Receive every state committed from now on.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<GatewayState> {
        self.commits.subscribe()
    }
}

/// Runs state actions and commits transitions, one state at a time.
pub struct Driver {
    settings: GatewaySettings,
    requests: mpsc::Receiver<TransitionRequest>,
    state: watch::Sender<GatewayState>,
    commits: broadcast::Sender<GatewayState>,
    stopping: bool,
}

impl Driver {
    /// Create a driver in the `Initial` state together with its handle.
    pub fn new(settings: GatewaySettings) -> (Self, DriverHandle) {
        let (tx, requests) = mpsc::channel(TRANSITION_QUEUE_CAPACITY);
        let (state, state_rx) = watch::channel(GatewayState::Initial);
        let (commits, _) = broadcast::channel(COMMIT_LOG_CAPACITY);

        let handle = DriverHandle {
            transitions: TransitionSender { tx },
            state: state_rx,
            commits: commits.clone(),
        };

        let driver = Self {
            settings,
            requests,
            state,
            commits,
            stopping: false,
        };

        (driver, handle)
    }

    /// Drive the state machine until `Disconnected` is committed.
    pub async fn run<B, M>(mut self, bus: Arc<B>, master: Arc<M>) -> GatewayState
    where
        B: MessageBus,
        M: FieldBusMaster,
    {
        let ctx = StateContext {
            bus,
            master,
            settings: self.settings.clone(),
        };

        let mut state = GatewayState::Initial;
        info!(state = %state, "Gateway state machine started");

        loop {
            debug!(state = %state, "Executing state");

            let step = match state.execute(&ctx).await {
                Ok(step) => step,
                Err(e) => {
                    error!(state = %state, error = %e, "Unexpected error, stopping gateway");
                    self.stopping = true;
                    if state == GatewayState::Disconnecting {
                        Step::Now(GatewayState::Disconnected)
                    } else {
                        Step::Now(GatewayState::Disconnecting)
                    }
                }
            };

            let next = match self.take_pending() {
                Some(requested) => {
                    debug!(
                        state = %state,
                        declared = ?step,
                        requested = %requested,
                        "Declared successor superseded by external request"
                    );
                    requested
                }
                None => match step {
                    Step::Now(next) => next,
                    Step::After(delay, next) => self.backoff(delay, next).await,
                    Step::Suspend => {
                        debug!(state = %state, "Waiting for state change");
                        self.next_request().await
                    }
                },
            };

            self.commit(&state, &next);
            state = next;

            if state.is_terminal() {
                break;
            }
        }

        info!("Gateway state machine stopped");
        state
    }

    /// Filter a request; once stopping, nothing but the shutdown path runs.
    fn accept(&mut self, request: TransitionRequest) -> Option<GatewayState> {
        if self.stopping {
            debug!(
                state = %request.state,
                origin = ?request.origin,
                "Shutting down, transition request discarded"
            );
            return None;
        }
        if request.origin == Origin::Stop {
            self.stopping = true;
        }
        Some(request.state)
    }

    /// Drain requests queued while the last action ran; the latest one wins.
    pub(crate) fn take_pending(&mut self) -> Option<GatewayState> {
        let mut latest = None;
        while let Ok(request) = self.requests.try_recv() {
            if let Some(state) = self.accept(request) {
                if let Some(superseded) = latest.replace(state) {
                    debug!(state = %superseded, "Transition request superseded");
                }
            }
        }
        latest
    }

    /// Block until an accepted transition request arrives.
    async fn next_request(&mut self) -> GatewayState {
        loop {
            match self.requests.recv().await {
                Some(request) => {
                    if let Some(state) = self.accept(request) {
                        return state;
                    }
                }
                None => {
                    warn!("All transition senders dropped, shutting down");
                    self.stopping = true;
                    return GatewayState::Disconnecting;
                }
            }
        }
    }

    /// Wait out a backoff, committing `next` unless a request pre-empts it.
    async fn backoff(&mut self, delay: Duration, next: GatewayState) -> GatewayState {
        tokio::select! {
            _ = tokio::time::sleep(delay) => next,
            requested = self.next_request() => {
                debug!(requested = %requested, "Backoff pre-empted");
                requested
            }
        }
    }

    fn commit(&self, from: &GatewayState, to: &GatewayState) {
        info!(from = %from, to = %to, "State transition");
        self.state.send_replace(to.clone());
        let _ = self.commits.send(to.clone());
    }
}
