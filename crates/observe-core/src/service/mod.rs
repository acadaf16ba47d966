//! # Observe Orchestrator
//!
//! Drives one observation from dial to teardown:
//!
//! ```text
//! Idle → Dialing → Subscribing → AwaitingThreshold → Deregistering → Done
//!          │            │
//!          └────────────┴──→ Failed
//! ```
//!
//! Every suspension point carries a deadline, and the session is closed on
//! every exit path by [`SessionGuard`].

#[cfg(test)]
mod tests;

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::{CompletionGate, GateOutcome, HandshakeError, Notification, SubscriptionError, Token};
use crate::ports::{DatagramTransport, HandlerError, SessionDialer};
use crate::registry::{spawn_delivery, CancelOutcome, ObservationRegistry, RetransmitPolicy};

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Not started.
    Idle,
    /// Handshake in progress.
    Dialing,
    /// Registration request outstanding.
    Subscribing,
    /// Waiting on the completion gate.
    AwaitingThreshold,
    /// Cancelling the registration.
    Deregistering,
    /// Finished; session closed.
    Done,
    /// Fatal error; session closed. Absorbing.
    Failed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Subscribing => "subscribing",
            Self::AwaitingThreshold => "awaiting-threshold",
            Self::Deregistering => "deregistering",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Fatal orchestrator errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserveError {
    /// Secure session could not be established.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// Registration was not established.
    #[error("subscription failed: {0}")]
    Subscription(#[from] SubscriptionError),
    /// `run` called on an orchestrator that already ran.
    #[error("orchestrator already {0}")]
    AlreadyStarted(OrchestratorState),
}

/// How the wait on the completion gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The threshold was reached.
    ThresholdReached,
    /// The await deadline elapsed first.
    TimedOut,
}

/// What to observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveRequest {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Resource path
    pub path: String,
}

/// Fresh notifications that complete a run unless configured otherwise.
pub const DEFAULT_THRESHOLD: NonZeroU64 = match NonZeroU64::new(10) {
    Some(threshold) => threshold,
    None => panic!("threshold must be non-zero"),
};

/// Thresholds and deadlines of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveSettings {
    /// Fresh notifications that complete the run
    pub threshold: NonZeroU64,
    /// Deadline for the registration acknowledgement
    pub registration_timeout: Duration,
    /// Deadline for reaching the threshold
    pub await_timeout: Duration,
    /// Deadline for the cancellation acknowledgement
    pub deregister_timeout: Duration,
    /// Registration retransmission
    pub retransmit: RetransmitPolicy,
}

impl Default for ObserveSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            registration_timeout: Duration::from_secs(10),
            await_timeout: Duration::from_secs(60),
            deregister_timeout: Duration::from_secs(1),
            retransmit: RetransmitPolicy::default(),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveReport {
    /// Token of the registration
    pub token: Token,
    /// Why the wait ended
    pub completion: Completion,
    /// Fresh notifications delivered
    pub delivered: u64,
    /// Result of the cancellation
    pub cancel: CancelOutcome,
}

/// Owns a session for the duration of a run.
///
/// Closing is owed on every path: `close` drains politely, `Drop` closes
/// and stops the delivery task when a run unwinds early.
pub struct SessionGuard<T: DatagramTransport> {
    session: Arc<T>,
    delivery: JoinHandle<()>,
}

impl<T: DatagramTransport> SessionGuard<T> {
    /// Take ownership of `session` and its delivery task.
    pub fn new(session: Arc<T>, delivery: JoinHandle<()>) -> Self {
        Self { session, delivery }
    }

    /// Close the session and wait (bounded) for the close to flush.
    pub async fn close(self) {
        self.session.close();
        self.session.drain().await;
    }
}

impl<T: DatagramTransport> Drop for SessionGuard<T> {
    fn drop(&mut self) {
        self.session.close();
        self.delivery.abort();
    }
}

/// Runs one observation over sessions produced by `D`.
pub struct ObserveOrchestrator<D: SessionDialer> {
    dialer: D,
    settings: ObserveSettings,
    state: Mutex<OrchestratorState>,
}

impl<D: SessionDialer> ObserveOrchestrator<D> {
    /// Create an idle orchestrator.
    pub fn new(dialer: D, settings: ObserveSettings) -> Self {
        Self {
            dialer,
            settings,
            state: Mutex::new(OrchestratorState::Idle),
        }
    }

    /// Current state.
    pub fn state(&self) -> OrchestratorState {
        *self.state.lock()
    }

    /// Settings in use.
    pub fn settings(&self) -> &ObserveSettings {
        &self.settings
    }

    /// Dial, register, wait for the threshold or the deadline, deregister
    /// and close.
    ///
    /// Reaching the deadline is not an error: the report says
    /// [`Completion::TimedOut`].
    pub async fn run(&self, request: &ObserveRequest) -> Result<ObserveReport, ObserveError> {
        let state = self.state();
        if state != OrchestratorState::Idle {
            return Err(ObserveError::AlreadyStarted(state));
        }

        self.transition(OrchestratorState::Dialing);
        let session = match self.dialer.dial(&request.host, request.port).await {
            Ok(session) => Arc::new(session),
            Err(e) => return Err(self.fail(e.into())),
        };

        let registry = Arc::new(ObservationRegistry::new(Arc::clone(&session), self.settings.retransmit));
        let guard = SessionGuard::new(session, spawn_delivery(Arc::clone(&registry)));

        self.transition(OrchestratorState::Subscribing);
        let gate = Arc::new(CompletionGate::new(self.settings.threshold));
        let counter = Arc::clone(&gate);
        let handler = move |_: &Notification| -> Result<(), HandlerError> {
            counter.increment();
            Ok(())
        };
        let token = match registry
            .register(&request.path, handler, self.settings.registration_timeout)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                guard.close().await;
                return Err(self.fail(e.into()));
            }
        };

        self.transition(OrchestratorState::AwaitingThreshold);
        let completion = match gate.wait(self.settings.await_timeout).await {
            GateOutcome::Fired => Completion::ThresholdReached,
            GateOutcome::TimedOut => {
                warn!(
                    token = %token,
                    received = gate.count(),
                    threshold = gate.threshold(),
                    timeout_ms = self.settings.await_timeout.as_millis(),
                    "Threshold not reached before deadline"
                );
                Completion::TimedOut
            }
        };

        self.transition(OrchestratorState::Deregistering);
        let cancel = registry.deregister(&token, self.settings.deregister_timeout).await;
        guard.close().await;
        self.transition(OrchestratorState::Done);

        Ok(ObserveReport {
            token,
            completion,
            delivered: gate.count(),
            cancel,
        })
    }

    fn transition(&self, to: OrchestratorState) {
        let mut state = self.state.lock();
        let from = *state;
        info!(from = %from, to = %to, "Orchestrator state");
        *state = to;
    }

    fn fail(&self, error: ObserveError) -> ObserveError {
        let mut state = self.state.lock();
        let from = *state;
        info!(from = %from, to = %OrchestratorState::Failed, error = %error, "Orchestrator state");
        *state = OrchestratorState::Failed;
        error
    }
}
