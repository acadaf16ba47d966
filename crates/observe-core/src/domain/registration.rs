//! Observation registration lifecycle.
//!
//! ```text
//! Establishing ──ack──→ Active ──deregister──→ Cancelling ──→ Cancelled
//!      │                                                         ↑
//!      └──────────────── deadline / rejection ───────────────────┘
//! ```

use std::fmt;
use std::time::Instant;

use super::{Sequence, Token};

/// Lifecycle state of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Request sent, acknowledgement outstanding.
    Establishing,
    /// Acknowledged; notifications are delivered.
    Active,
    /// Cancellation requested; notifications are no longer delivered.
    Cancelling,
    /// Terminal.
    Cancelled,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Establishing => "establishing",
            Self::Active => "active",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Verdict for an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Strictly newer than anything seen; last-seen has been advanced.
    Fresh,
    /// Not strictly newer than `last_seen`.
    Stale {
        /// Last accepted sequence number
        last_seen: Sequence,
    },
    /// The registration is not accepting notifications.
    NotActive(RegistrationState),
}

/// A standing registration of interest in one resource path.
#[derive(Debug, Clone)]
pub struct Registration {
    token: Token,
    path: String,
    state: RegistrationState,
    last_seen: Option<Sequence>,
    delivered: u64,
    cancel_sent: bool,
    created_at: Instant,
}

impl Registration {
    /// New registration awaiting its acknowledgement.
    pub fn establishing(token: Token, path: impl Into<String>) -> Self {
        Self {
            token,
            path: path.into(),
            state: RegistrationState::Establishing,
            last_seen: None,
            delivered: 0,
            cancel_sent: false,
            created_at: Instant::now(),
        }
    }

    /// Move to `Active`, seeding last-seen from the acknowledgement.
    ///
    /// Returns `false` if the registration was not `Establishing`.
    pub fn activate(&mut self, baseline: Sequence) -> bool {
        if self.state != RegistrationState::Establishing {
            return false;
        }
        self.state = RegistrationState::Active;
        self.last_seen = Some(baseline);
        true
    }

    /// Check `sequence` against last-seen and advance it when fresh.
    pub fn accept(&mut self, sequence: Sequence) -> Freshness {
        if self.state != RegistrationState::Active {
            return Freshness::NotActive(self.state);
        }
        match self.last_seen {
            Some(last) if !sequence.is_newer_than(last) => Freshness::Stale { last_seen: last },
            _ => {
                self.last_seen = Some(sequence);
                self.delivered += 1;
                Freshness::Fresh
            }
        }
    }

    /// Enter `Cancelling`.
    ///
    /// Returns `true` exactly once per registration: the caller that receives
    /// `true` owns sending the single cancellation request.
    pub fn begin_cancel(&mut self) -> bool {
        match self.state {
            RegistrationState::Establishing | RegistrationState::Active => {
                self.state = RegistrationState::Cancelling;
            }
            RegistrationState::Cancelling | RegistrationState::Cancelled => {}
        }
        if self.cancel_sent || self.state != RegistrationState::Cancelling {
            return false;
        }
        self.cancel_sent = true;
        true
    }

    /// Enter the terminal `Cancelled` state.
    pub fn finish_cancel(&mut self) {
        self.state = RegistrationState::Cancelled;
    }

    /// Token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Observed resource path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current state.
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Last accepted sequence number.
    pub fn last_seen(&self) -> Option<Sequence> {
        self.last_seen
    }

    /// Notifications accepted so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// When the registration was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}
