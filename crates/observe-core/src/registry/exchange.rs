//! Pending exchange store.
//!
//! Maps message ids of outstanding confirmable requests to the task waiting
//! for their answer. The delivery loop completes exchanges; the requester
//! awaits the receiver under its own deadline and abandons the exchange when
//! the deadline wins.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::Message;
use crate::domain::Token;

/// What the request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Observe registration (Observe=0).
    Register,
    /// Observe cancellation (Observe=1).
    Deregister,
}

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Piggy-backed or separate response.
    Response(Message),
    /// Peer answered with Reset.
    Reset,
}

/// An outstanding confirmable request.
#[derive(Debug)]
pub struct PendingExchange {
    /// Message id of the request
    pub message_id: u16,
    /// Token of the request
    pub token: Token,
    /// Request kind
    pub kind: ExchangeKind,
    sender: oneshot::Sender<ExchangeOutcome>,
    acked: Arc<AtomicBool>,
    created_at: Instant,
}

impl PendingExchange {
    /// Hand the outcome to the waiting requester.
    ///
    /// Returns `false` if the requester already gave up.
    pub fn complete(self, outcome: ExchangeOutcome) -> bool {
        let delivered = self.sender.send(outcome).is_ok();
        debug!(
            message_id = self.message_id,
            token = %self.token,
            kind = ?self.kind,
            elapsed_ms = self.created_at.elapsed().as_millis(),
            delivered,
            "Exchange completed"
        );
        delivered
    }
}

/// Requester's side of an exchange.
#[derive(Debug)]
pub struct ExchangeHandle {
    /// Message id of the request
    pub message_id: u16,
    /// Resolves when the exchange completes
    pub receiver: oneshot::Receiver<ExchangeOutcome>,
    acked: Arc<AtomicBool>,
}

impl ExchangeHandle {
    /// Whether an empty acknowledgement has arrived.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

/// Exchange statistics.
#[derive(Debug, Default)]
pub struct ExchangeStats {
    /// Exchanges opened
    pub total_opened: AtomicU64,
    /// Exchanges completed by a response or reset
    pub total_completed: AtomicU64,
    /// Exchanges abandoned at their deadline
    pub total_abandoned: AtomicU64,
}

/// Outstanding exchanges keyed by message id.
#[derive(Debug, Default)]
pub struct ExchangeStore {
    pending: DashMap<u16, PendingExchange>,
    stats: ExchangeStats,
}

impl ExchangeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request about to be sent.
    pub fn open(&self, message_id: u16, token: Token, kind: ExchangeKind) -> ExchangeHandle {
        let (sender, receiver) = oneshot::channel();
        let acked = Arc::new(AtomicBool::new(false));
        self.pending.insert(
            message_id,
            PendingExchange {
                message_id,
                token,
                kind,
                sender,
                acked: Arc::clone(&acked),
                created_at: Instant::now(),
            },
        );
        self.stats.total_opened.fetch_add(1, Ordering::Relaxed);
        debug!(message_id, token = %token, kind = ?kind, "Opened exchange");
        ExchangeHandle {
            message_id,
            receiver,
            acked,
        }
    }

    /// Remove the exchange answered by an ACK (with response) or a Reset.
    pub fn take(&self, message_id: u16) -> Option<PendingExchange> {
        let (_, exchange) = self.pending.remove(&message_id)?;
        self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        Some(exchange)
    }

    /// Record an empty acknowledgement: the response will follow separately.
    ///
    /// Returns `false` for unknown message ids.
    pub fn mark_acked(&self, message_id: u16) -> bool {
        match self.pending.get(&message_id) {
            Some(exchange) => {
                exchange.acked.store(true, Ordering::Release);
                debug!(message_id, token = %exchange.token, "Exchange acknowledged, awaiting separate response");
                true
            }
            None => false,
        }
    }

    /// Remove the exchange a separate response belongs to.
    ///
    /// The empty acknowledgement may be lost or overtaken, so an
    /// unacknowledged exchange matches too. A message carrying Observe is a
    /// notification, never the answer to a cancellation that has not been
    /// acknowledged yet.
    pub fn take_by_token(&self, token: &Token, carries_observe: bool) -> Option<PendingExchange> {
        let message_id = self
            .pending
            .iter()
            .find(|entry| {
                entry.token == *token
                    && (entry.kind == ExchangeKind::Register
                        || !carries_observe
                        || entry.acked.load(Ordering::Acquire))
            })
            .map(|entry| *entry.key())?;
        self.take(message_id)
    }

    /// Drop an exchange whose requester stopped waiting.
    pub fn abandon(&self, message_id: u16) -> bool {
        if self.pending.remove(&message_id).is_some() {
            self.stats.total_abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(message_id, "Abandoned exchange");
            true
        } else {
            false
        }
    }

    /// Number of outstanding exchanges.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Statistics.
    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Code, MessageType};

    #[tokio::test]
    async fn test_piggybacked_response_completes_by_message_id() {
        let store = ExchangeStore::new();
        let token = Token::random();
        let handle = store.open(7, token, ExchangeKind::Register);

        let ack = Message::new(MessageType::Acknowledgement, Code::CONTENT, 7, token);
        let exchange = store.take(7).unwrap();
        assert_eq!(exchange.kind, ExchangeKind::Register);
        assert!(exchange.complete(ExchangeOutcome::Response(ack.clone())));

        assert_eq!(handle.receiver.await.unwrap(), ExchangeOutcome::Response(ack));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.stats().total_completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_separate_registration_response_matches_without_ack() {
        let store = ExchangeStore::new();
        let token = Token::random();
        let handle = store.open(9, token, ExchangeKind::Register);

        assert!(!handle.is_acked());
        assert_eq!(store.take_by_token(&token, true).map(|e| e.message_id), Some(9));
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_notification_does_not_answer_unacked_cancellation() {
        let store = ExchangeStore::new();
        let token = Token::random();
        let handle = store.open(11, token, ExchangeKind::Deregister);

        assert!(store.take_by_token(&token, true).is_none());
        assert!(store.mark_acked(11));
        assert!(handle.is_acked());
        assert_eq!(store.take_by_token(&token, true).map(|e| e.message_id), Some(11));
    }

    #[test]
    fn test_plain_response_answers_unacked_cancellation() {
        let store = ExchangeStore::new();
        let token = Token::random();
        let _handle = store.open(12, token, ExchangeKind::Deregister);

        assert!(store.take_by_token(&Token::random(), false).is_none());
        assert_eq!(store.take_by_token(&token, false).map(|e| e.message_id), Some(12));
    }

    #[test]
    fn test_mark_acked_unknown() {
        let store = ExchangeStore::new();
        assert!(!store.mark_acked(1));
    }

    #[test]
    fn test_abandon_counts_once() {
        let store = ExchangeStore::new();
        let _handle = store.open(3, Token::random(), ExchangeKind::Register);
        assert!(store.abandon(3));
        assert!(!store.abandon(3));
        assert_eq!(store.stats().total_abandoned.load(Ordering::Relaxed), 1);
        assert!(store.take(3).is_none());
    }

    #[test]
    fn test_complete_after_requester_gone() {
        let store = ExchangeStore::new();
        let handle = store.open(4, Token::random(), ExchangeKind::Deregister);
        drop(handle);
        let exchange = store.take(4).unwrap();
        assert!(!exchange.complete(ExchangeOutcome::Reset));
    }
}
