//! Cross-crate integration tests.

pub mod support;

mod quic_e2e;
