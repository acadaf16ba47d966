//! TOML configuration.
//!
//! Every key is optional; a missing file section falls back to its defaults.
//!
//! # Config File Format
//!
//! ```toml
//! [session]
//! handshake_timeout_ms = 10000
//! idle_timeout_ms = 30000
//! keep_alive_interval_ms = 5000      # 0 disables keep-alive
//! require_extended_master_secret = true
//! verify_server_identity = true
//! confirm_handshake = true
//! alpn = "coap"
//!
//! [observe]
//! threshold = 10
//! registration_timeout_ms = 10000
//! await_timeout_ms = 60000
//! deregister_timeout_ms = 1000
//!
//! [retransmit]
//! ack_timeout_ms = 2000
//! max_retransmit = 4
//!
//! [credentials]
//! dir = "tls-client"
//! ca_cert = "ca-crt.pem"
//! client_key = "client1-key.pem"
//! client_cert = "client1-crt.pem"
//! ```

use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::registry::RetransmitPolicy;
use crate::service::ObserveSettings;
use crate::transport::{CredentialPaths, ServerIdentity, SessionOptions};

/// Environment variable naming an optional config file.
pub const CONFIG_ENV: &str = "OBSERVE_CONFIG";

/// Errors that can occur during config loading.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read {path}: {error}")]
    Io {
        /// Path of the file that failed to load.
        path: String,
        /// Error message from the I/O operation.
        error: String,
    },
    /// TOML parsing error.
    #[error("failed to parse config: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObserveConfig {
    /// Secure session
    pub session: SessionSection,
    /// Observation thresholds and deadlines
    pub observe: ObserveSection,
    /// Registration retransmission
    pub retransmit: RetransmitSection,
    /// Credential files
    pub credentials: CredentialSection,
}

/// `[session]`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSection {
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub require_extended_master_secret: bool,
    pub verify_server_identity: bool,
    pub confirm_handshake: bool,
    pub alpn: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            keep_alive_interval_ms: 5_000,
            require_extended_master_secret: true,
            verify_server_identity: true,
            confirm_handshake: true,
            alpn: "coap".into(),
        }
    }
}

/// `[observe]`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObserveSection {
    pub threshold: u64,
    pub registration_timeout_ms: u64,
    pub await_timeout_ms: u64,
    pub deregister_timeout_ms: u64,
}

impl Default for ObserveSection {
    fn default() -> Self {
        Self {
            threshold: 10,
            registration_timeout_ms: 10_000,
            await_timeout_ms: 60_000,
            deregister_timeout_ms: 1_000,
        }
    }
}

/// `[retransmit]`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetransmitSection {
    pub ack_timeout_ms: u64,
    pub max_retransmit: u32,
}

impl Default for RetransmitSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2_000,
            max_retransmit: 4,
        }
    }
}

/// `[credentials]`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialSection {
    pub dir: PathBuf,
    pub ca_cert: String,
    pub client_key: String,
    pub client_cert: String,
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("tls-client"),
            ca_cert: "ca-crt.pem".into(),
            client_key: "client1-key.pem".into(),
            client_cert: "client1-crt.pem".into(),
        }
    }
}

impl ObserveConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by [`CONFIG_ENV`], or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("observe.threshold", self.observe.threshold),
            ("observe.registration_timeout_ms", self.observe.registration_timeout_ms),
            ("observe.await_timeout_ms", self.observe.await_timeout_ms),
            ("observe.deregister_timeout_ms", self.observe.deregister_timeout_ms),
            ("session.handshake_timeout_ms", self.session.handshake_timeout_ms),
            ("session.idle_timeout_ms", self.session.idle_timeout_ms),
            ("retransmit.ack_timeout_ms", self.retransmit.ack_timeout_ms),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", key)));
        }
        if !self.session.require_extended_master_secret {
            return Err(ConfigError::Invalid(
                "session.require_extended_master_secret cannot be disabled: QUIC runs on TLS 1.3 only".into(),
            ));
        }
        if self.session.alpn.is_empty() {
            return Err(ConfigError::Invalid("session.alpn must not be empty".into()));
        }
        Ok(())
    }

    /// Secure session options.
    pub fn session_options(&self) -> SessionOptions {
        let s = &self.session;
        SessionOptions {
            handshake_timeout: Duration::from_millis(s.handshake_timeout_ms),
            idle_timeout: Duration::from_millis(s.idle_timeout_ms),
            keep_alive_interval: (s.keep_alive_interval_ms > 0)
                .then(|| Duration::from_millis(s.keep_alive_interval_ms)),
            require_extended_master_secret: s.require_extended_master_secret,
            server_identity: if s.verify_server_identity {
                ServerIdentity::Verify
            } else {
                ServerIdentity::TrustAnchorsOnly
            },
            confirm_handshake: s.confirm_handshake,
            alpn: vec![s.alpn.as_bytes().to_vec()],
            ..SessionOptions::default()
        }
    }

    /// Orchestrator settings.
    pub fn observe_settings(&self) -> Result<ObserveSettings, ConfigError> {
        let o = &self.observe;
        let threshold = NonZeroU64::new(o.threshold)
            .ok_or_else(|| ConfigError::Invalid("observe.threshold must be greater than zero".into()))?;
        Ok(ObserveSettings {
            threshold,
            registration_timeout: Duration::from_millis(o.registration_timeout_ms),
            await_timeout: Duration::from_millis(o.await_timeout_ms),
            deregister_timeout: Duration::from_millis(o.deregister_timeout_ms),
            retransmit: RetransmitPolicy {
                ack_timeout: Duration::from_millis(self.retransmit.ack_timeout_ms),
                max_retransmit: self.retransmit.max_retransmit,
            },
        })
    }

    /// Credential file locations.
    pub fn credential_paths(&self) -> CredentialPaths {
        let c = &self.credentials;
        CredentialPaths::in_dir(&c.dir, &c.ca_cert, &c.client_cert, &c.client_key)
    }
}
