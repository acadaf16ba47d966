//! # Secure Observe Client
//!
//! Observes one resource over a mutually authenticated, encrypted datagram
//! session and stops after a bounded number of fresh notifications.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** tokens, 24-bit sequence freshness, registration
//!   lifecycle, completion gate, error taxonomy
//! - **Codec:** request/notification messages (CoAP message layer + Observe)
//! - **Ports Layer:** datagram transport, session dialer, notification handler
//! - **Transport Layer:** QUIC secure session with mutual TLS
//! - **Registry:** token table, pending exchanges, delivery loop
//! - **Service Layer:** the observe orchestrator state machine
//! - **Adapters Layer:** TOML configuration
//!
//! ## Flow
//!
//! ```text
//! Orchestrator ─dial─→ SecureSession ─register─→ ObservationRegistry
//!      ↑                     │ datagrams                │ fresh notifications
//!      └──── CompletionGate ←┴──────── delivery loop ───┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use observe_core::{
//!     Credential, CredentialPaths, ObserveOrchestrator, ObserveRequest, ObserveSettings,
//!     QuicDialer, SessionOptions,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = CredentialPaths::in_dir("tls-client", "ca-crt.pem", "client1-crt.pem", "client1-key.pem");
//! let credential = Credential::load(&paths)?;
//! let dialer = QuicDialer::new(credential, SessionOptions::default());
//!
//! let orchestrator = ObserveOrchestrator::new(dialer, ObserveSettings::default());
//! let report = orchestrator
//!     .run(&ObserveRequest {
//!         host: "localhost".into(),
//!         port: 5684,
//!         path: "/obs".into(),
//!     })
//!     .await?;
//! println!("{:?} after {} notifications", report.completion, report.delivered);
//! # Ok(())
//! # }
//! ```

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod codec;
pub mod domain;
pub mod ports;
pub mod registry;
pub mod service;

/// Transport layer (QUIC + mutual TLS)
pub mod transport;

/// Adapters for configuration sources.
pub mod adapters;

/// Test utilities (in-memory transport and dialer)
/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// =============================================================================
// RE-EXPORTS
// =============================================================================

// Codec
pub use codec::{Code, CodecError, Message, MessageType, ObserveAction};

// Domain
pub use domain::{
    CompletionGate, CredentialError, Freshness, GateOutcome, HandshakeError, Notification,
    NotificationError, Registration, RegistrationState, Sequence, SessionError, SubscriptionError,
    Token,
};

// Port traits
pub use ports::{DatagramTransport, HandlerError, NotificationHandler, SessionDialer};

// Registry
pub use registry::{spawn_delivery, CancelOutcome, ObservationRegistry, RegistryStats, RetransmitPolicy};

// Service
pub use service::{
    Completion, ObserveError, ObserveOrchestrator, ObserveReport, ObserveRequest, ObserveSettings,
    OrchestratorState, SessionGuard,
};

// Transport
pub use transport::{
    Credential, CredentialPaths, QuicDialer, SecureSession, ServerIdentity, SessionOptions, SessionState,
};

// Adapters
pub use adapters::{ConfigError, ObserveConfig, CONFIG_ENV};

// =============================================================================
// TEST UTILITIES (Requires `test-utils` feature)
// =============================================================================

#[cfg(feature = "test-utils")]
pub use test_utils::{memory_pair, MemoryDialer, MemoryPeer, MemoryTransport};
