//! Client credential: certificate chain, private key and trust anchors.
//!
//! Built once at startup from three PEM files and handed to the dialer.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use zeroize::Zeroizing;

use crate::domain::CredentialError;

/// Locations of the three PEM inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    /// CA bundle (trust anchors)
    pub ca_cert: PathBuf,
    /// Client certificate chain
    pub client_cert: PathBuf,
    /// Client private key
    pub client_key: PathBuf,
}

impl CredentialPaths {
    /// Paths of three files inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>, ca_cert: &str, client_cert: &str, client_key: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            ca_cert: dir.join(ca_cert),
            client_cert: dir.join(client_cert),
            client_key: dir.join(client_key),
        }
    }
}

/// Immutable client credential.
pub struct Credential {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    trust_anchors: Arc<RootCertStore>,
}

impl Credential {
    /// Parse PEM-encoded inputs.
    ///
    /// # Errors
    ///
    /// `CredentialError::Pem` for unparsable input,
    /// `CredentialError::NoCertificates` for an empty chain or CA bundle,
    /// `CredentialError::TrustAnchor` if a CA certificate is unusable.
    pub fn from_pem(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CredentialError> {
        let ca_certs = parse_certificates(ca_pem, "CA certificate")?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| CredentialError::TrustAnchor(e.to_string()))?;
        }

        let cert_chain = parse_certificates(cert_pem, "client certificate")?;
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| CredentialError::Pem {
            what: "client private key",
            reason: e.to_string(),
        })?;

        Ok(Self {
            cert_chain,
            key,
            trust_anchors: Arc::new(roots),
        })
    }

    /// Read and parse the three files.
    pub fn load(paths: &CredentialPaths) -> Result<Self, CredentialError> {
        let ca = read(&paths.ca_cert)?;
        let key = Zeroizing::new(read(&paths.client_key)?);
        let cert = read(&paths.client_cert)?;
        Self::from_pem(&ca, &cert, &key)
    }

    /// Client certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// A copy of the private key.
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Trust anchors for validating the server chain.
    pub fn trust_anchors(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.trust_anchors)
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            trust_anchors: Arc::clone(&self.trust_anchors),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("key", &"<redacted>")
            .field("trust_anchors", &self.trust_anchors.len())
            .finish()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|source| CredentialError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse_certificates(
    pem: &[u8],
    what: &'static str,
) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CredentialError::Pem {
            what,
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(CredentialError::NoCertificates { what });
    }
    Ok(certs)
}
