//! # Secure-Observe Test Suite
//!
//! Unified test crate driving the client against a real QUIC loopback
//! server with mutual TLS.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── support.rs    # certificate authority + scripted observe server
//!     └── quic_e2e.rs   # end-to-end scenarios
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p observe-tests
//! ```

pub mod integration;
