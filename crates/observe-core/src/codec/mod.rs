//! # Message Codec
//!
//! Datagram encoding for the request/notification protocol: the CoAP message
//! layer (RFC 7252) with the Observe option (RFC 7641).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

mod message;
mod options;


pub use message::{Code, Message, MessageType, ObserveAction, PROTOCOL_VERSION};
pub use options::{number, CoapOption, Options};

use thiserror::Error;

/// Encoding/decoding failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Datagram ended early.
    #[error("truncated message: needed {needed} more bytes")]
    Truncated {
        /// Missing byte count
        needed: usize,
    },
    /// Version field is not 1.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    /// Token length nibble 9-15.
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    /// Empty message (0.00) carrying token, options or payload.
    #[error("empty message carries data")]
    MalformedEmpty,
    /// Option delta or length nibble 15 outside the payload marker.
    #[error("reserved option nibble")]
    ReservedOptionNibble,
    /// Option number overflowed 16 bits.
    #[error("option number overflow")]
    OptionNumberOverflow,
    /// Payload marker followed by nothing.
    #[error("payload marker without payload")]
    EmptyPayload,
    /// Option value too long to encode.
    #[error("option value of {0} bytes too long")]
    OptionTooLong(usize),
    /// Observe value wider than 3 bytes.
    #[error("observe value of {0} bytes exceeds 3")]
    InvalidObserveValue(usize),
}
