//! # Observation Registry
//!
//! Tracks observe registrations keyed by token and routes every inbound
//! datagram of a session:
//!
//! | Inbound                           | Action                                   |
//! |-----------------------------------|------------------------------------------|
//! | ACK with response                 | complete exchange by message id          |
//! | empty ACK                         | mark exchange acknowledged               |
//! | Reset                             | complete exchange with reset             |
//! | response for acknowledged request | complete exchange by token (ACK if CON)  |
//! | notification, live token          | ACK if CON, freshness check, dispatch    |
//! | notification, unknown token       | Reset if CON, drop                       |
//! | ping or request                   | Reset if CON                             |
//!
//! The token table is behind one mutex; registration, dispatch and
//! deregistration all serialize on it. Handlers run outside the lock.

mod delivery;
mod exchange;


pub use delivery::spawn_delivery;
pub use exchange::{ExchangeHandle, ExchangeKind, ExchangeOutcome, ExchangeStats, ExchangeStore, PendingExchange};

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::codec::{Message, MessageType, ObserveAction};
use crate::domain::{
    Freshness, Notification, NotificationError, Registration, RegistrationState, Sequence,
    SessionError, SubscriptionError, Token,
};
use crate::ports::{DatagramTransport, NotificationHandler};

/// Retransmission parameters for confirmable registration requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    /// Initial acknowledgement timeout (randomized up to 1.5x)
    pub ack_timeout: Duration,
    /// Retransmissions after the first send
    pub max_retransmit: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            max_retransmit: 4,
        }
    }
}

/// Result of a deregistration. Every variant leaves no registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The peer answered the cancellation.
    Acknowledged,
    /// No answer before the deadline, or the request could not be sent.
    Unacknowledged,
    /// No registration to cancel (unknown token or already cancelling).
    NotRegistered,
}

/// Delivery statistics.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Notifications handed to a handler
    pub delivered: AtomicU64,
    /// Datagrams or notifications dropped
    pub dropped: AtomicU64,
    /// Handler errors and panics
    pub handler_failures: AtomicU64,
}

struct Entry {
    registration: Registration,
    handler: Arc<dyn NotificationHandler>,
}

/// Observe registrations over one datagram session.
pub struct ObservationRegistry<T: DatagramTransport> {
    transport: Arc<T>,
    table: Mutex<HashMap<Token, Entry>>,
    exchanges: ExchangeStore,
    next_message_id: AtomicU16,
    retransmit: RetransmitPolicy,
    stats: RegistryStats,
}

impl<T: DatagramTransport> ObservationRegistry<T> {
    /// Create a registry sending over `transport`.
    pub fn new(transport: Arc<T>, retransmit: RetransmitPolicy) -> Self {
        Self {
            transport,
            table: Mutex::new(HashMap::new()),
            exchanges: ExchangeStore::new(),
            next_message_id: AtomicU16::new(rand::random()),
            retransmit,
            stats: RegistryStats::default(),
        }
    }

    /// Session this registry sends over.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    // =========================================================================
    // REGISTER
    // =========================================================================

    /// Register interest in `path` and wait for the acknowledgement.
    ///
    /// The request is retransmitted with exponential back-off until the peer
    /// acknowledges it or `deadline` elapses. On any error no entry remains.
    pub async fn register<H: NotificationHandler>(
        &self,
        path: &str,
        handler: H,
        deadline: Duration,
    ) -> Result<Token, SubscriptionError> {
        if self.transport.is_closed() {
            return Err(SubscriptionError::Transport(SessionError::Closed));
        }

        let token = self.insert_establishing(path, Arc::new(handler));
        let message_id = self.next_message_id();
        let request = match Message::observe_request(message_id, token, path, ObserveAction::Register).encode() {
            Ok(request) => request,
            Err(e) => {
                self.remove(&token);
                return Err(e.into());
            }
        };

        debug!(token = %token, path, message_id, "Registering observation");
        let mut handle = self.exchanges.open(message_id, token, ExchangeKind::Register);

        let outcome = match self.await_registration(path, request, &mut handle, deadline).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.exchanges.abandon(message_id);
                self.remove(&token);
                return Err(e);
            }
        };

        match outcome {
            ExchangeOutcome::Response(response) if response.code.is_success() => {
                if response.observe().is_none() {
                    self.remove(&token);
                    return Err(SubscriptionError::NotObservable { path: path.to_string() });
                }
                info!(token = %token, path, code = %response.code, "Observation registered");
                Ok(token)
            }
            ExchangeOutcome::Response(response) => {
                self.remove(&token);
                Err(SubscriptionError::Rejected {
                    path: path.to_string(),
                    code: response.code,
                })
            }
            ExchangeOutcome::Reset => {
                self.remove(&token);
                Err(SubscriptionError::Reset { path: path.to_string() })
            }
        }
    }

    async fn await_registration(
        &self,
        path: &str,
        request: Bytes,
        handle: &mut ExchangeHandle,
        deadline: Duration,
    ) -> Result<ExchangeOutcome, SubscriptionError> {
        let deadline_at = Instant::now() + deadline;
        let timed_out = || SubscriptionError::Timeout {
            path: path.to_string(),
            after_ms: deadline.as_millis(),
        };

        let mut timeout = self.initial_ack_timeout();
        let mut retransmissions = 0;
        self.transport.send(request.clone()).await?;

        loop {
            let retransmit_due = !handle.is_acked() && retransmissions < self.retransmit.max_retransmit;
            let wait_until = if retransmit_due {
                (Instant::now() + timeout).min(deadline_at)
            } else {
                deadline_at
            };

            match tokio::time::timeout_at(wait_until, &mut handle.receiver).await {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(_)) => return Err(SubscriptionError::Transport(SessionError::Closed)),
                Err(_) if Instant::now() >= deadline_at => return Err(timed_out()),
                Err(_) => {
                    if handle.is_acked() {
                        continue;
                    }
                    retransmissions += 1;
                    timeout *= 2;
                    debug!(
                        path,
                        message_id = handle.message_id,
                        attempt = retransmissions,
                        "Retransmitting registration"
                    );
                    self.transport.send(request.clone()).await?;
                }
            }
        }
    }

    fn insert_establishing(&self, path: &str, handler: Arc<dyn NotificationHandler>) -> Token {
        let mut table = self.table.lock();
        let token = loop {
            let candidate = Token::random();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };
        table.insert(
            token,
            Entry {
                registration: Registration::establishing(token, path),
                handler,
            },
        );
        token
    }

    fn initial_ack_timeout(&self) -> Duration {
        let base = self.retransmit.ack_timeout;
        base + base.mul_f64(rand::random::<f64>() * 0.5)
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Deliver a notification to its registration's handler.
    ///
    /// Unknown tokens, inactive registrations and stale sequence numbers are
    /// rejected without touching the handler. Handler failures are logged
    /// and swallowed.
    pub fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        let token = notification.token;
        let handler = {
            let mut table = self.table.lock();
            let entry = table
                .get_mut(&token)
                .ok_or(NotificationError::UnknownToken(token))?;
            match entry.registration.accept(notification.sequence) {
                Freshness::Fresh => Arc::clone(&entry.handler),
                Freshness::Stale { last_seen } => {
                    return Err(NotificationError::Stale {
                        token,
                        sequence: notification.sequence,
                        last_seen,
                    })
                }
                Freshness::NotActive(state) => return Err(NotificationError::NotActive { token, state }),
            }
        };

        info!(
            token = %token,
            seq = notification.sequence.value(),
            payload = %notification.payload_lossy(),
            "Got notification"
        );
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_notification(&notification))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(token = %token, error = %e, "Notification handler failed");
            }
            Err(_) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(token = %token, "Notification handler panicked");
            }
        }
        Ok(())
    }

    // =========================================================================
    // DEREGISTER
    // =========================================================================

    /// Cancel a registration.
    ///
    /// Sends one cancellation request and waits at most `deadline` for the
    /// answer. The entry is removed whatever the outcome.
    pub async fn deregister(&self, token: &Token, deadline: Duration) -> CancelOutcome {
        let path = {
            let mut table = self.table.lock();
            let Some(entry) = table.get_mut(token) else {
                debug!(token = %token, "Deregister for unknown token");
                return CancelOutcome::NotRegistered;
            };
            if !entry.registration.begin_cancel() {
                debug!(token = %token, state = %entry.registration.state(), "Cancellation already in progress");
                return CancelOutcome::NotRegistered;
            }
            entry.registration.path().to_string()
        };

        let outcome = self.send_cancel(token, &path, deadline).await;

        if let Some(mut entry) = self.table.lock().remove(token) {
            entry.registration.finish_cancel();
            debug!(
                token = %token,
                path = entry.registration.path(),
                delivered = entry.registration.delivered(),
                "Registration cancelled"
            );
        }
        outcome
    }

    async fn send_cancel(&self, token: &Token, path: &str, deadline: Duration) -> CancelOutcome {
        if self.transport.is_closed() {
            warn!(token = %token, "Session closed, cancellation not sent");
            return CancelOutcome::Unacknowledged;
        }

        let message_id = self.next_message_id();
        let request = match Message::observe_request(message_id, *token, path, ObserveAction::Deregister).encode() {
            Ok(request) => request,
            Err(e) => {
                warn!(token = %token, error = %e, "Failed to encode cancellation");
                return CancelOutcome::Unacknowledged;
            }
        };
        let handle = self.exchanges.open(message_id, *token, ExchangeKind::Deregister);

        let exchange = async {
            self.transport.send(request).await?;
            Ok::<_, SessionError>(handle.receiver.await)
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(Ok(ExchangeOutcome::Response(response)))) => {
                debug!(token = %token, code = %response.code, "Cancellation acknowledged");
                CancelOutcome::Acknowledged
            }
            Ok(Ok(Ok(ExchangeOutcome::Reset))) => {
                debug!(token = %token, "Cancellation answered with reset");
                CancelOutcome::Acknowledged
            }
            Ok(Ok(Err(_))) => {
                self.exchanges.abandon(message_id);
                CancelOutcome::Unacknowledged
            }
            Ok(Err(e)) => {
                self.exchanges.abandon(message_id);
                warn!(token = %token, error = %e, "Failed to send cancellation");
                CancelOutcome::Unacknowledged
            }
            Err(_) => {
                self.exchanges.abandon(message_id);
                warn!(
                    token = %token,
                    deadline_ms = deadline.as_millis(),
                    "Cancellation not acknowledged before deadline"
                );
                CancelOutcome::Unacknowledged
            }
        }
    }

    // =========================================================================
    // INBOUND ROUTING
    // =========================================================================

    /// Route one inbound datagram.
    ///
    /// Errors describe why the datagram was dropped; none of them are fatal.
    pub async fn handle_datagram(&self, datagram: Bytes) -> Result<(), NotificationError> {
        let msg = Message::decode(datagram)?;

        match msg.mtype {
            MessageType::Acknowledgement if msg.is_empty() => {
                if !self.exchanges.mark_acked(msg.message_id) {
                    debug!(message_id = msg.message_id, "Unmatched empty acknowledgement");
                }
                Ok(())
            }
            MessageType::Acknowledgement => {
                match self.exchanges.take(msg.message_id) {
                    Some(exchange) => self.complete_exchange(exchange, msg),
                    None => debug!(message_id = msg.message_id, "Unmatched acknowledgement"),
                }
                Ok(())
            }
            MessageType::Reset => {
                match self.exchanges.take(msg.message_id) {
                    Some(exchange) => {
                        exchange.complete(ExchangeOutcome::Reset);
                    }
                    None => debug!(message_id = msg.message_id, "Unmatched reset"),
                }
                Ok(())
            }
            MessageType::Confirmable | MessageType::NonConfirmable => self.handle_inbound(msg).await,
        }
    }

    async fn handle_inbound(&self, msg: Message) -> Result<(), NotificationError> {
        let confirmable = msg.mtype == MessageType::Confirmable;

        if msg.is_empty() || msg.code.is_request() {
            if confirmable {
                debug!(message_id = msg.message_id, code = %msg.code, "Rejecting inbound ping or request");
                self.reply(Message::reset(msg.message_id)).await;
            }
            return Ok(());
        }

        if let Some(exchange) = self.exchanges.take_by_token(&msg.token, msg.observe().is_some()) {
            if confirmable {
                self.reply(Message::empty_ack(msg.message_id)).await;
            }
            self.complete_exchange(exchange, msg);
            return Ok(());
        }

        let known = self.table.lock().contains_key(&msg.token);
        if !known {
            if confirmable {
                self.reply(Message::reset(msg.message_id)).await;
            }
            return Err(NotificationError::UnknownToken(msg.token));
        }
        if confirmable {
            self.reply(Message::empty_ack(msg.message_id)).await;
        }

        let Some(sequence) = msg.observe() else {
            warn!(token = %msg.token, code = %msg.code, "Server ended observation");
            return Ok(());
        };
        let content_format = msg.content_format();
        self.dispatch(Notification {
            token: msg.token,
            sequence: Sequence::new(sequence),
            code: msg.code,
            content_format,
            payload: msg.payload,
        })
    }

    fn complete_exchange(&self, exchange: PendingExchange, response: Message) {
        if exchange.kind == ExchangeKind::Register && response.code.is_success() {
            if let Some(baseline) = response.observe() {
                let mut table = self.table.lock();
                if let Some(entry) = table.get_mut(&exchange.token) {
                    entry.registration.activate(Sequence::new(baseline));
                }
            }
        }
        exchange.complete(ExchangeOutcome::Response(response));
    }

    async fn reply(&self, msg: Message) {
        let result = match msg.encode() {
            Ok(datagram) => self.transport.send(datagram).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            debug!(message_id = msg.message_id, mtype = ?msg.mtype, error = %e, "Failed to send reply");
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Snapshot of a registration.
    pub fn get(&self, token: &Token) -> Option<Registration> {
        self.table.lock().get(token).map(|e| e.registration.clone())
    }

    /// Number of registrations in any state.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether the registry holds no registrations.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Number of `Active` registrations.
    pub fn active_count(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|e| e.registration.state() == RegistrationState::Active)
            .count()
    }

    /// Outstanding confirmable exchanges.
    pub fn pending_exchanges(&self) -> usize {
        self.exchanges.pending_count()
    }

    /// Delivery statistics.
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    fn remove(&self, token: &Token) {
        self.table.lock().remove(token);
    }

    fn next_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }
}
