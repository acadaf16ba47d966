//! Test fixtures: a throwaway certificate authority and a scripted observe
//! server listening on loopback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quinn::ConnectionError;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::task::JoinHandle;

use observe_core::{Code, Credential, Message, MessageType, Token};

// =============================================================================
// CERTIFICATES
// =============================================================================

/// A certificate and its key, in PEM and DER.
pub struct Issued {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
}

/// Self-signed certificate authority.
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().expect("ca key");
        let cert = params.self_signed(&key).expect("ca cert");
        Self { cert, key }
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Server certificate valid for `names` (DNS names or IP addresses).
    pub fn issue_server(&self, names: &[&str]) -> Issued {
        self.issue(names, ExtendedKeyUsagePurpose::ServerAuth)
    }

    /// Client certificate.
    pub fn issue_client(&self, name: &str) -> Issued {
        self.issue(&[name], ExtendedKeyUsagePurpose::ClientAuth)
    }

    fn issue(&self, names: &[&str], usage: ExtendedKeyUsagePurpose) -> Issued {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(names).expect("leaf params");
        params.distinguished_name.push(DnType::CommonName, "observe test leaf");
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate().expect("leaf key");
        let cert = params.signed_by(&key, &self.cert, &self.key).expect("leaf cert");
        Issued {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: key.serialize_der(),
        }
    }

    /// Client credential trusting this CA, for a leaf issued by `issuer`.
    pub fn client_credential(&self, issuer: &TestCa) -> Credential {
        let leaf = issuer.issue_client("observe-client");
        Credential::from_pem(self.pem().as_bytes(), leaf.cert_pem.as_bytes(), leaf.key_pem.as_bytes())
            .expect("client credential")
    }
}

// =============================================================================
// OBSERVE SERVER
// =============================================================================

/// How the scripted server behaves.
#[derive(Debug, Clone, Copy)]
pub struct ServerScript {
    /// Notifications pushed after a registration
    pub notifications: u32,
    /// Gap between notifications
    pub interval: Duration,
    /// Whether cancellations are acknowledged
    pub ack_cancel: bool,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            notifications: 10,
            interval: Duration::from_millis(10),
            ack_cancel: true,
        }
    }
}

/// What the server saw.
#[derive(Debug, Default, Clone)]
pub struct ServerReport {
    /// Server-side handshake failure
    pub handshake_error: Option<String>,
    /// Pings answered
    pub pings: u32,
    /// Tokens of registration requests (retransmissions included)
    pub registrations: Vec<Token>,
    /// Tokens of cancellation requests
    pub cancellations: Vec<Token>,
    /// The client closed the connection at the application level
    pub closed_by_client: bool,
}

/// Loopback observe server accepting one connection.
pub struct ObserveServer {
    pub addr: SocketAddr,
    task: JoinHandle<ServerReport>,
}

impl ObserveServer {
    /// Start a server presenting `server` and trusting clients issued by `client_ca`.
    pub fn start(server: &Issued, client_ca: &TestCa, script: ServerScript) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.add(client_ca.der()).expect("client ca");
        let client_verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .expect("client verifier");

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server.key_der.clone()));
        let mut tls = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("tls13")
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(vec![server.cert_der.clone()], key)
            .expect("server cert");
        tls.alpn_protocols = vec![b"coap".to_vec()];

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).expect("quic server crypto");
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        let endpoint = quinn::Endpoint::server(server_config, SocketAddr::from(([127, 0, 0, 1], 0)))
            .expect("server endpoint");
        let addr = endpoint.local_addr().expect("server addr");

        let task = tokio::spawn(serve(endpoint, script));
        Self { addr, task }
    }

    /// Wait for the connection to end and return what the server saw.
    pub async fn finish(self, within: Duration) -> ServerReport {
        match tokio::time::timeout(within, self.task).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => panic!("server task failed: {}", e),
            Err(_) => panic!("server did not finish within {:?}", within),
        }
    }
}

async fn serve(endpoint: quinn::Endpoint, script: ServerScript) -> ServerReport {
    let mut report = ServerReport::default();

    let Some(incoming) = endpoint.accept().await else {
        return report;
    };
    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(e) => {
            report.handshake_error = Some(e.to_string());
            return report;
        }
    };

    let cancelled = Arc::new(AtomicBool::new(false));
    loop {
        let datagram = match connection.read_datagram().await {
            Ok(datagram) => datagram,
            Err(e) => {
                report.closed_by_client = matches!(e, ConnectionError::ApplicationClosed(_));
                break;
            }
        };
        let Ok(msg) = Message::decode(datagram) else {
            continue;
        };

        match (msg.mtype, msg.is_empty(), msg.observe()) {
            (MessageType::Confirmable, true, _) => {
                report.pings += 1;
                send(&connection, &Message::reset(msg.message_id));
            }
            (MessageType::Confirmable, false, Some(0)) if msg.code == Code::GET => {
                report.registrations.push(msg.token);
                let ack = Message::new(MessageType::Acknowledgement, Code::CONTENT, msg.message_id, msg.token)
                    .with_observe(0)
                    .with_payload("registered");
                send(&connection, &ack);
                tokio::spawn(push_notifications(
                    connection.clone(),
                    msg.token,
                    script,
                    Arc::clone(&cancelled),
                ));
            }
            (MessageType::Confirmable, false, Some(1)) if msg.code == Code::GET => {
                cancelled.store(true, Ordering::SeqCst);
                report.cancellations.push(msg.token);
                if script.ack_cancel {
                    send(
                        &connection,
                        &Message::new(MessageType::Acknowledgement, Code::CONTENT, msg.message_id, msg.token),
                    );
                }
            }
            _ => {}
        }
    }

    endpoint.close(0u32.into(), b"done");
    report
}

async fn push_notifications(
    connection: quinn::Connection,
    token: Token,
    script: ServerScript,
    cancelled: Arc<AtomicBool>,
) {
    for seq in 1..=script.notifications {
        tokio::time::sleep(script.interval).await;
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        let mtype = if seq % 2 == 0 {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        };
        let notification = Message::new(mtype, Code::CONTENT, 1000 + seq as u16, token)
            .with_observe(seq)
            .with_content_format(0)
            .with_payload(format!("reading {}", seq));
        send(&connection, &notification);
    }
}

fn send(connection: &quinn::Connection, msg: &Message) {
    if let Ok(datagram) = msg.encode() {
        let _ = connection.send_datagram(datagram);
    }
}
