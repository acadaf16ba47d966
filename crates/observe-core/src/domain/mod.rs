//! Domain Layer - Pure observation logic with no I/O
//!
//! - Tokens and 24-bit observe sequence numbers (freshness rule)
//! - Registration lifecycle
//! - Completion gate
//! - Error taxonomy

pub mod errors;
pub mod gate;
pub mod notification;
pub mod registration;
pub mod sequence;
pub mod token;

pub use errors::*;
pub use gate::{CompletionGate, GateOutcome};
pub use notification::Notification;
pub use registration::{Freshness, Registration, RegistrationState};
pub use sequence::{Sequence, SEQUENCE_MAX};
pub use token::{Token, MAX_TOKEN_LEN};
