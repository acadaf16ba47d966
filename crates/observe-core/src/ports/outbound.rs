//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the observation client requires from the host.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{HandshakeError, SessionError};

/// An established, encrypted, mutually authenticated datagram channel to one
/// remote endpoint.
///
/// # Thread Safety
///
/// The delivery loop calls `recv` while the orchestrator and registry call
/// `send` concurrently, so implementations must be `Send + Sync`.
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Send one application message.
    ///
    /// Fails with `SessionError::Closed` once `close` has been called.
    async fn send(&self, datagram: Bytes) -> Result<(), SessionError>;

    /// Receive the next application message.
    ///
    /// Returns `SessionError::Closed` after a local close and
    /// `SessionError::ConnectionLost` when the peer goes away.
    async fn recv(&self) -> Result<Bytes, SessionError>;

    /// Tear the session down.
    ///
    /// Idempotent: returns `true` only for the call that actually closed it.
    fn close(&self) -> bool;

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;

    /// Wait (bounded by the implementation) for a closed session to flush
    /// its close notification to the peer.
    async fn drain(&self) {}
}

/// Establishes secure sessions.
#[async_trait]
pub trait SessionDialer: Send + Sync {
    /// Session type produced by a successful handshake.
    type Session: DatagramTransport;

    /// Resolve `host:port`, perform the handshake and return an established
    /// session. Any failure is terminal.
    async fn dial(&self, host: &str, port: u16) -> Result<Self::Session, HandshakeError>;
}
