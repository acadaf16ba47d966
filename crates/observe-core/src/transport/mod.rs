//! Transport layer modules.
//!
//! - `quic` - secure session over QUIC datagrams with mutual TLS
//! - `credential` - client certificate, key and trust anchors
//! - `verifier` - trust-anchor-only server certificate verification

pub mod credential;
pub mod quic;
pub mod verifier;

pub use credential::{Credential, CredentialPaths};
pub use quic::{QuicDialer, SecureSession, ServerIdentity, SessionOptions, SessionState, DEFAULT_ALPN};
pub use verifier::TrustAnchorOnlyVerifier;
