//! Test utilities for the observation client.
//!
//! In-memory implementations of the outbound ports, for driving the registry
//! and the orchestrator without a TLS handshake.
//! Enable with the `test-utils` feature flag.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::codec::Message;
use crate::domain::{HandshakeError, SessionError};
use crate::ports::{DatagramTransport, SessionDialer};

/// Create a connected client transport and the peer that drives it.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_client, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_client) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        MemoryTransport {
            outbound: to_peer,
            inbound: tokio::sync::Mutex::new(from_peer),
            closed: closed_tx,
        },
        MemoryPeer {
            inbound: to_client,
            outbound: from_client,
            closed: closed_rx,
        },
    )
}

/// Client side of an in-memory datagram session.
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send(&self, datagram: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outbound
            .send(datagram)
            .map_err(|_| SessionError::ConnectionLost("peer dropped".into()))
    }

    async fn recv(&self) -> Result<Bytes, SessionError> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(SessionError::Closed),
            datagram = inbound.recv() => {
                datagram.ok_or_else(|| SessionError::ConnectionLost("peer dropped".into()))
            }
        }
    }

    fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Server side of an in-memory datagram session.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Bytes>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    closed: watch::Receiver<bool>,
}

impl MemoryPeer {
    /// Deliver a message to the client.
    pub fn push(&self, msg: &Message) {
        if let Ok(datagram) = msg.encode() {
            let _ = self.inbound.send(datagram);
        }
    }

    /// Deliver raw bytes to the client.
    pub fn push_raw(&self, datagram: impl Into<Bytes>) {
        let _ = self.inbound.send(datagram.into());
    }

    /// Next message the client sent, waiting at most `within`.
    pub async fn next_message(&mut self, within: Duration) -> Option<Message> {
        let datagram = tokio::time::timeout(within, self.outbound.recv()).await.ok()??;
        Message::decode(datagram).ok()
    }

    /// Next message already sent by the client, without waiting.
    pub fn try_next_message(&mut self) -> Option<Message> {
        let datagram = self.outbound.try_recv().ok()?;
        Message::decode(datagram).ok()
    }

    /// Whether the client closed its transport.
    pub fn is_client_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the client closes its transport.
    pub async fn wait_client_closed(&mut self, within: Duration) -> bool {
        matches!(
            tokio::time::timeout(within, self.closed.wait_for(|closed| *closed)).await,
            Ok(Ok(_))
        )
    }
}

/// Dialer handing out one pre-built [`MemoryTransport`], or failing.
#[derive(Debug)]
pub struct MemoryDialer {
    session: Mutex<Option<MemoryTransport>>,
    failure: Option<HandshakeError>,
    dials: AtomicUsize,
}

impl MemoryDialer {
    /// Dialer whose first dial returns `session`.
    pub fn new(session: MemoryTransport) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            failure: None,
            dials: AtomicUsize::new(0),
        }
    }

    /// Dialer whose every dial fails with `error`.
    pub fn failing(error: HandshakeError) -> Self {
        Self {
            session: Mutex::new(None),
            failure: Some(error),
            dials: AtomicUsize::new(0),
        }
    }

    /// Number of dial attempts.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionDialer for MemoryDialer {
    type Session = MemoryTransport;

    async fn dial(&self, host: &str, port: u16) -> Result<MemoryTransport, HandshakeError> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.session.lock().take().ok_or_else(|| HandshakeError::Rejected {
            remote: format!("{}:{}", host, port),
            reason: "memory session already taken".into(),
        })
    }
}
