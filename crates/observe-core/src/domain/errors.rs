//! Error taxonomy.
//!
//! Credential, handshake and subscription failures are fatal to the client.
//! Notification problems are absorbed by the registry and only logged.

use thiserror::Error;

use super::{RegistrationState, Sequence, Token};
use crate::codec::{Code, CodecError};

/// Client credential could not be loaded.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Offending file
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// PEM data could not be parsed.
    #[error("invalid PEM in {what}: {reason}")]
    Pem {
        /// Which input was malformed
        what: &'static str,
        /// Parser message
        reason: String,
    },
    /// PEM parsed but contained no certificates.
    #[error("no certificates found in {what}")]
    NoCertificates {
        /// Which input was empty
        what: &'static str,
    },
    /// A CA certificate was rejected by the trust store.
    #[error("invalid trust anchor: {0}")]
    TrustAnchor(String),
}

/// Secure session could not be established.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Target address did not resolve.
    #[error("failed to resolve {target}: {reason}")]
    Resolve {
        /// Host and port as given
        target: String,
        /// Resolver message
        reason: String,
    },
    /// Local endpoint could not be bound.
    #[error("failed to bind local endpoint: {0}")]
    Bind(String),
    /// TLS/QUIC configuration was rejected.
    #[error("invalid security configuration: {0}")]
    Config(String),
    /// Handshake did not finish before the deadline.
    #[error("handshake with {remote} timed out")]
    Timeout {
        /// Remote address
        remote: String,
    },
    /// Peer or local TLS stack rejected the handshake.
    #[error("handshake with {remote} rejected: {reason}")]
    Rejected {
        /// Remote address
        remote: String,
        /// TLS/QUIC reason
        reason: String,
    },
    /// Peer does not accept datagrams.
    #[error("peer {remote} does not support datagrams")]
    DatagramsUnsupported {
        /// Remote address
        remote: String,
    },
    /// Connection was torn down while confirming the handshake.
    #[error("handshake with {remote} not confirmed: {reason}")]
    Unconfirmed {
        /// Remote address
        remote: String,
        /// Why confirmation failed
        reason: String,
    },
}

/// Send/receive failure on an established session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session was closed locally.
    #[error("session closed")]
    Closed,
    /// The peer closed the connection.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Datagram exceeds what the path can carry.
    #[error("datagram of {size} bytes exceeds limit of {max}")]
    DatagramTooLarge {
        /// Attempted size
        size: usize,
        /// Current limit
        max: usize,
    },
    /// Any other send failure.
    #[error("send failed: {0}")]
    Send(String),
}

/// Registration was not established.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// No acknowledgement before the registration deadline.
    #[error("registration of {path} not acknowledged within {after_ms} ms")]
    Timeout {
        /// Resource path
        path: String,
        /// Deadline in milliseconds
        after_ms: u128,
    },
    /// Server answered with an error code.
    #[error("registration of {path} rejected with {code}")]
    Rejected {
        /// Resource path
        path: String,
        /// Response code
        code: Code,
    },
    /// Server answered but declined to add us as an observer.
    #[error("resource {path} is not observable")]
    NotObservable {
        /// Resource path
        path: String,
    },
    /// Server answered the request with a Reset.
    #[error("registration of {path} reset by peer")]
    Reset {
        /// Resource path
        path: String,
    },
    /// Request could not be encoded.
    #[error("failed to encode registration: {0}")]
    Encode(#[from] CodecError),
    /// Session failure while sending.
    #[error("transport failure: {0}")]
    Transport(#[from] SessionError),
}

/// Inbound notification was dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// Datagram did not decode.
    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),
    /// Token matches no registration.
    #[error("no registration for token {0}")]
    UnknownToken(Token),
    /// Sequence number not strictly newer than last seen.
    #[error("stale notification for {token}: seq {sequence} <= {last_seen}")]
    Stale {
        /// Token
        token: Token,
        /// Received sequence number
        sequence: Sequence,
        /// Last accepted sequence number
        last_seen: Sequence,
    },
    /// Registration exists but is not delivering.
    #[error("registration {token} is {state}")]
    NotActive {
        /// Token
        token: Token,
        /// Current state
        state: RegistrationState,
    },
}
