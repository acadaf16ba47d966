//! Pushed notifications.

use std::borrow::Cow;

use bytes::Bytes;

use super::{Sequence, Token};
use crate::codec::Code;

/// One notification pushed by the server for an active observation.
///
/// Ephemeral: consumed by dispatch and dropped after delivery or rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Token of the observation this notification belongs to
    pub token: Token,
    /// Observe sequence number
    pub sequence: Sequence,
    /// Response code (normally 2.05 Content)
    pub code: Code,
    /// Content-Format option, if present
    pub content_format: Option<u16>,
    /// Representation bytes
    pub payload: Bytes,
}

impl Notification {
    /// Payload rendered as (lossy) UTF-8 for logging.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
