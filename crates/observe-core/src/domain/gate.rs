//! Completion gate: a single-fire latch driven by a notification counter.
//!
//! Increments come from the delivery path while the orchestrator waits with
//! a deadline. The counter is atomic and only the increment that lands
//! exactly on the threshold flips the latch, so the gate fires once no matter
//! how many increments follow.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// Result of waiting on the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The threshold was reached before the deadline.
    Fired,
    /// The deadline elapsed first.
    TimedOut,
}

/// Threshold-triggered one-shot synchronization primitive.
#[derive(Debug)]
pub struct CompletionGate {
    threshold: u64,
    count: AtomicU64,
    fired: watch::Sender<bool>,
}

impl CompletionGate {
    /// Create a gate that fires on the `threshold`-th increment.
    pub fn new(threshold: NonZeroU64) -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            threshold: threshold.get(),
            count: AtomicU64::new(0),
            fired,
        }
    }

    /// Record one event.
    ///
    /// Returns `true` only for the increment that reaches the threshold.
    pub fn increment(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count != self.threshold {
            return false;
        }
        self.fired.send_replace(true);
        debug!(threshold = self.threshold, "Completion gate fired");
        true
    }

    /// Wait until the gate fires or `deadline` elapses.
    pub async fn wait(&self, deadline: Duration) -> GateOutcome {
        let mut rx = self.fired.subscribe();
        let fired = tokio::time::timeout(deadline, rx.wait_for(|fired| *fired))
            .await
            .map(|res| res.is_ok());
        match fired {
            Ok(true) => GateOutcome::Fired,
            // The sender lives in `self`, so the channel cannot close here.
            Ok(false) | Err(_) => GateOutcome::TimedOut,
        }
    }

    /// Whether the gate has fired.
    pub fn has_fired(&self) -> bool {
        *self.fired.borrow()
    }

    /// Increments recorded so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Configured threshold.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}
