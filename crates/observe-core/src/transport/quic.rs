//! # QUIC Secure Session
//!
//! Encrypted, mutually authenticated datagram session using quinn (QUIC).
//!
//! ## Security Properties
//!
//! - TLS 1.3 handshake with client certificate authentication
//! - Server chain validated against the configured trust anchors
//! - Extended master secret required (TLS 1.3 always binds the session hash)
//! - Application messages carried in QUIC DATAGRAM frames (RFC 9221)
//!
//! ## Reference
//!
//! - RFC 9000 (QUIC)
//! - RFC 9001 (QUIC-TLS)
//! - RFC 9221 (Unreliable Datagram Extension)

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ConnectionError, SendDatagramError, VarInt};
use rustls::client::WebPkiServerVerifier;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::credential::Credential;
use super::verifier::TrustAnchorOnlyVerifier;
use crate::codec::{Message, MessageType};
use crate::domain::{HandshakeError, SessionError};
use crate::ports::{DatagramTransport, SessionDialer};

/// ALPN identifier offered by default.
pub const DEFAULT_ALPN: &[u8] = b"coap";

// =============================================================================
// CONFIGURATION
// =============================================================================

/// How the server certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerIdentity {
    /// Chain against trust anchors and name against the dialed host.
    Verify,
    /// Chain against trust anchors only; the name is not checked.
    ///
    /// A deliberate weakening: any certificate issued by a trusted CA is
    /// accepted for any host.
    TrustAnchorsOnly,
}

/// Secure session configuration.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Local bind address (`None` picks the unspecified address of the
    /// remote's family)
    pub bind_addr: Option<SocketAddr>,
    /// Deadline for the handshake, including confirmation
    pub handshake_timeout: Duration,
    /// Idle timeout before the connection is dropped
    pub idle_timeout: Duration,
    /// Keep-alive interval (`None` to disable)
    pub keep_alive_interval: Option<Duration>,
    /// Reject handshakes without extended master secret.
    ///
    /// QUIC carries TLS 1.3 only, whose key schedule always binds the
    /// session hash, so `true` is the only accepted value.
    pub require_extended_master_secret: bool,
    /// Server certificate policy
    pub server_identity: ServerIdentity,
    /// Ping the peer after the handshake so a rejected client certificate
    /// surfaces during dial
    pub confirm_handshake: bool,
    /// ALPN protocols offered
    pub alpn: Vec<Vec<u8>>,
    /// Upper bound for flushing the close frame
    pub drain_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind_addr: None,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Some(Duration::from_secs(5)),
            require_extended_master_secret: true,
            server_identity: ServerIdentity::Verify,
            confirm_handshake: true,
            alpn: vec![DEFAULT_ALPN.to_vec()],
            drain_timeout: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// SESSION STATE
// =============================================================================

/// Lifecycle of a secure session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake or confirmation in progress.
    Handshaking,
    /// Mutually authenticated; application data may flow.
    Established,
    /// Torn down. Terminal.
    Closed,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Handshaking,
            1 => Self::Established,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Handshaking => 0,
            Self::Established => 1,
            Self::Closed => 2,
        }
    }
}

// =============================================================================
// SECURE SESSION
// =============================================================================

/// One encrypted datagram session to one remote endpoint.
pub struct SecureSession {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    remote: SocketAddr,
    state: AtomicU8,
    drain_timeout: Duration,
}

impl SecureSession {
    /// Perform the handshake with `remote`.
    ///
    /// `server_name` is used for SNI and, under [`ServerIdentity::Verify`],
    /// for checking the server certificate.
    ///
    /// # Errors
    ///
    /// Every failure is a terminal `HandshakeError`; nothing is retried.
    pub async fn dial(
        remote: SocketAddr,
        server_name: &str,
        credential: &Credential,
        options: &SessionOptions,
    ) -> Result<Self, HandshakeError> {
        let deadline = Instant::now() + options.handshake_timeout;
        let client_config = build_client_config(credential, options)?;

        let bind_addr = options.bind_addr.unwrap_or_else(|| unspecified_for(&remote));
        let endpoint = quinn::Endpoint::client(bind_addr)
            .map_err(|e| HandshakeError::Bind(format!("{}: {}", bind_addr, e)))?;

        debug!(remote = %remote, server_name, "Handshaking");

        let connection = match connect(&endpoint, client_config, remote, server_name, deadline).await {
            Ok(connection) => connection,
            Err(e) => {
                endpoint.close(VarInt::from_u32(0), b"handshake failed");
                return Err(e);
            }
        };

        let session = Self {
            endpoint,
            connection,
            remote,
            state: AtomicU8::new(SessionState::Handshaking.as_u8()),
            drain_timeout: options.drain_timeout,
        };

        if session.connection.max_datagram_size().is_none() {
            session.close();
            return Err(HandshakeError::DatagramsUnsupported {
                remote: remote.to_string(),
            });
        }

        if options.confirm_handshake {
            if let Err(e) = session.confirm(deadline).await {
                session.close();
                return Err(e);
            }
        }

        session
            .state
            .store(SessionState::Established.as_u8(), Ordering::Release);
        info!(
            remote = %remote,
            rtt_ms = session.connection.rtt().as_millis(),
            "Secure session established"
        );
        Ok(session)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Smoothed round-trip estimate.
    pub fn rtt(&self) -> Duration {
        self.connection.rtt()
    }

    /// Largest datagram the path currently carries.
    pub fn max_datagram_size(&self) -> Option<usize> {
        self.connection.max_datagram_size()
    }

    /// Ping the server and wait for its Reset.
    ///
    /// TLS 1.3 lets the client finish before the server has judged the client
    /// certificate; a server that rejects it closes the connection, which
    /// turns this round trip into a handshake failure.
    async fn confirm(&self, deadline: Instant) -> Result<(), HandshakeError> {
        let message_id: u16 = rand::random();
        let ping = Message::ping(message_id)
            .encode()
            .map_err(|e| HandshakeError::Config(e.to_string()))?;
        self.connection
            .send_datagram(ping)
            .map_err(|e| HandshakeError::Unconfirmed {
                remote: self.remote.to_string(),
                reason: e.to_string(),
            })?;

        loop {
            let datagram = match tokio::time::timeout_at(deadline, self.connection.read_datagram()).await {
                Err(_) => {
                    return Err(HandshakeError::Timeout {
                        remote: self.remote.to_string(),
                    })
                }
                Ok(Err(e)) => {
                    return Err(HandshakeError::Unconfirmed {
                        remote: self.remote.to_string(),
                        reason: e.to_string(),
                    })
                }
                Ok(Ok(datagram)) => datagram,
            };

            match Message::decode(datagram) {
                Ok(msg) if msg.mtype == MessageType::Reset && msg.message_id == message_id => {
                    debug!(remote = %self.remote, "Handshake confirmed");
                    return Ok(());
                }
                Ok(msg) => debug!(
                    message_id = msg.message_id,
                    mtype = ?msg.mtype,
                    "Ignoring message during handshake confirmation"
                ),
                Err(e) => debug!(error = %e, "Ignoring undecodable datagram during handshake confirmation"),
            }
        }
    }
}

#[async_trait]
impl DatagramTransport for SecureSession {
    async fn send(&self, datagram: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let size = datagram.len();
        self.connection.send_datagram(datagram).map_err(|e| match e {
            SendDatagramError::TooLarge => SessionError::DatagramTooLarge {
                size,
                max: self.connection.max_datagram_size().unwrap_or(0),
            },
            SendDatagramError::ConnectionLost(reason) => map_connection_error(reason),
            other => SessionError::Send(other.to_string()),
        })
    }

    async fn recv(&self) -> Result<Bytes, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.connection
            .read_datagram()
            .await
            .map_err(map_connection_error)
    }

    fn close(&self) -> bool {
        let previous = self.state.swap(SessionState::Closed.as_u8(), Ordering::AcqRel);
        if SessionState::from_u8(previous) == SessionState::Closed {
            return false;
        }
        self.connection.close(VarInt::from_u32(0), b"observation finished");
        debug!(remote = %self.remote, "Secure session closed");
        true
    }

    fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    async fn drain(&self) {
        if tokio::time::timeout(self.drain_timeout, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!(remote = %self.remote, "Close frame not flushed before drain timeout");
        }
    }
}

impl Drop for SecureSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// DIALER
// =============================================================================

/// Resolves a host and dials a [`SecureSession`] with a fixed credential.
#[derive(Debug, Clone)]
pub struct QuicDialer {
    credential: Credential,
    options: SessionOptions,
}

impl QuicDialer {
    /// Create a dialer.
    pub fn new(credential: Credential, options: SessionOptions) -> Self {
        Self { credential, options }
    }

    /// Session options in use.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }
}

#[async_trait]
impl SessionDialer for QuicDialer {
    type Session = SecureSession;

    async fn dial(&self, host: &str, port: u16) -> Result<SecureSession, HandshakeError> {
        let remote = resolve(host, port, self.options.handshake_timeout).await?;
        if self.options.server_identity == ServerIdentity::TrustAnchorsOnly {
            warn!(
                host,
                "Server identity verification disabled: any certificate chaining to a trusted CA is accepted"
            );
        }
        SecureSession::dial(remote, host, &self.credential, &self.options).await
    }
}

async fn resolve(host: &str, port: u16, deadline: Duration) -> Result<SocketAddr, HandshakeError> {
    let target = format!("{}:{}", host, port);
    first_address(target, deadline, tokio::net::lookup_host((host, port))).await
}

/// First address produced by `lookup`, bounded by `deadline`.
async fn first_address<F, I>(
    target: String,
    deadline: Duration,
    lookup: F,
) -> Result<SocketAddr, HandshakeError>
where
    F: Future<Output = io::Result<I>>,
    I: Iterator<Item = SocketAddr>,
{
    let mut addrs = match tokio::time::timeout(deadline, lookup).await {
        Ok(result) => result.map_err(|e| HandshakeError::Resolve {
            target: target.clone(),
            reason: e.to_string(),
        })?,
        Err(_) => return Err(HandshakeError::Timeout { remote: target }),
    };
    addrs.next().ok_or_else(|| HandshakeError::Resolve {
        target,
        reason: "no addresses".into(),
    })
}

// =============================================================================
// HELPERS
// =============================================================================

async fn connect(
    endpoint: &quinn::Endpoint,
    config: quinn::ClientConfig,
    remote: SocketAddr,
    server_name: &str,
    deadline: Instant,
) -> Result<quinn::Connection, HandshakeError> {
    let connecting = endpoint
        .connect_with(config, remote, server_name)
        .map_err(|e| HandshakeError::Config(e.to_string()))?;

    match tokio::time::timeout_at(deadline, connecting).await {
        Err(_) | Ok(Err(ConnectionError::TimedOut)) => Err(HandshakeError::Timeout {
            remote: remote.to_string(),
        }),
        Ok(Err(e)) => Err(HandshakeError::Rejected {
            remote: remote.to_string(),
            reason: e.to_string(),
        }),
        Ok(Ok(connection)) => Ok(connection),
    }
}

/// Build the rustls + quinn client configuration.
fn build_client_config(
    credential: &Credential,
    options: &SessionOptions,
) -> Result<quinn::ClientConfig, HandshakeError> {
    if !options.require_extended_master_secret {
        return Err(HandshakeError::Config(
            "extended master secret cannot be disabled on TLS 1.3".into(),
        ));
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| HandshakeError::Config(e.to_string()))?;

    let builder = match options.server_identity {
        ServerIdentity::Verify => builder.with_root_certificates(credential.trust_anchors()),
        ServerIdentity::TrustAnchorsOnly => {
            let inner = WebPkiServerVerifier::builder_with_provider(credential.trust_anchors(), provider)
                .build()
                .map_err(|e| HandshakeError::Config(format!("server verifier error: {}", e)))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAnchorOnlyVerifier::new(inner)))
        }
    };

    let mut crypto = builder
        .with_client_auth_cert(credential.cert_chain().to_vec(), credential.key())
        .map_err(|e| HandshakeError::Config(format!("client certificate error: {}", e)))?;
    crypto.alpn_protocols = options.alpn.clone();

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| HandshakeError::Config(format!("QUIC crypto config error: {:?}", e)))?;

    let mut transport = quinn::TransportConfig::default();
    let idle = options
        .idle_timeout
        .try_into()
        .map_err(|_| HandshakeError::Config("idle timeout out of range".into()))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(options.keep_alive_interval);

    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(Arc::new(transport));
    Ok(client_config)
}

fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    if remote.is_ipv6() {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }
}

fn map_connection_error(err: ConnectionError) -> SessionError {
    match err {
        ConnectionError::LocallyClosed => SessionError::Closed,
        other => SessionError::ConnectionLost(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_strict() {
        let options = SessionOptions::default();
        assert!(options.require_extended_master_secret);
        assert_eq!(options.server_identity, ServerIdentity::Verify);
        assert!(options.confirm_handshake);
        assert_eq!(options.alpn, vec![b"coap".to_vec()]);
    }

    #[test]
    fn test_state_encoding() {
        for state in [
            SessionState::Handshaking,
            SessionState::Established,
            SessionState::Closed,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_unspecified_bind_matches_family() {
        let v4: SocketAddr = "192.0.2.1:5684".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:5684".parse().unwrap();
        assert!(unspecified_for(&v4).is_ipv4());
        assert!(unspecified_for(&v6).is_ipv6());
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_host() {
        let err = resolve("host.invalid", 5684, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Resolve { .. } | HandshakeError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_resolver_bounded_by_handshake_deadline() {
        let stalled = std::future::pending::<io::Result<std::vec::IntoIter<SocketAddr>>>();
        let err = first_address("stalled.example:5684".into(), Duration::from_secs(10), stalled)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HandshakeError::Timeout {
                remote: "stalled.example:5684".into()
            }
        );
    }

    #[tokio::test]
    async fn test_first_address_without_results() {
        let empty = async { Ok::<_, io::Error>(Vec::<SocketAddr>::new().into_iter()) };
        let err = first_address("empty.example:5684".into(), Duration::from_secs(1), empty)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Resolve { reason, .. } if reason == "no addresses"));
    }

    #[test]
    fn test_disabling_extended_master_secret_rejected() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let (cert, key) = (cert.pem(), key_pair.serialize_pem());
        let credential =
            Credential::from_pem(cert.as_bytes(), cert.as_bytes(), key.as_bytes()).unwrap();

        let strict = SessionOptions::default();
        assert!(build_client_config(&credential, &strict).is_ok());

        let relaxed = SessionOptions {
            require_extended_master_secret: false,
            ..SessionOptions::default()
        };
        let err = build_client_config(&credential, &relaxed).err();
        assert!(
            matches!(err, Some(HandshakeError::Config(msg)) if msg.contains("extended master secret"))
        );
    }
}
