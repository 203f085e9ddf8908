//! Per-connection state
//!
//! A [`Connection`] is shared between its reader loop, its writer task and
//! every broadcaster that wants to enqueue a frame for it. Identity and
//! `connected_at` never change; `user_id` and `close_reason` are write-once.

use parking_lot::Mutex;
use realtime_config::{close_codes, OverflowPolicy};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::outbound::{EnqueueOutcome, Outbox, QueueStats};
use crate::protocol::{now_millis, ErrorCode, ServerMessage};
use crate::rate_limit::{BreachReason, RateLimitEvent, RateLimitEventLog};

pub type ConnectionId = Uuid;

/// Why a connection ended; exactly one per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    RateLimit,
    AuthTimeout,
    AuthFailed,
    Capacity,
    Error,
    QueueOverflow,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::RateLimit => "rate_limit",
            CloseReason::AuthTimeout => "auth_timeout",
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::Capacity => "capacity",
            CloseReason::Error => "error",
            CloseReason::QueueOverflow => "queue_overflow",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band instructions for the writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Ping,
    /// A final text frame that must precede the close frame
    Notice(Arc<str>),
    /// Send a close frame, then stop
    Close { code: u16, reason: String },
    /// Stop without a close handshake
    Terminate,
}

/// Settings every new connection is created with
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_queue_size: usize,
    pub overflow_policy: OverflowPolicy,
}

pub struct Connection {
    pub id: ConnectionId,
    connected_at: Instant,
    user_id: OnceLock<String>,
    auth_deadline: Mutex<Option<Instant>>,
    outbox: Outbox,
    control_tx: mpsc::UnboundedSender<Control>,
    close_reason: OnceLock<CloseReason>,
    closed: Notify,
    alive: AtomicBool,
    torn_down: AtomicBool,
    rate_events: Arc<RateLimitEventLog>,
    queue_stats: Arc<QueueStats>,
}

impl Connection {
    pub fn new(
        settings: ConnectionSettings,
        queue_stats: Arc<QueueStats>,
        rate_events: Arc<RateLimitEventLog>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Control>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            connected_at: Instant::now(),
            user_id: OnceLock::new(),
            auth_deadline: Mutex::new(None),
            outbox: Outbox::new(
                settings.max_queue_size,
                settings.overflow_policy,
                queue_stats.clone(),
            ),
            control_tx,
            close_reason: OnceLock::new(),
            closed: Notify::new(),
            alive: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
            rate_events,
            queue_stats,
        });
        (connection, control_rx)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.get().is_some()
    }

    /// Bind the authenticated user; false if one was already bound
    ///
    /// Clears the authentication deadline on success.
    pub(crate) fn bind_user(&self, user_id: String) -> bool {
        if self.user_id.set(user_id).is_err() {
            return false;
        }
        self.auth_deadline.lock().take();
        true
    }

    pub(crate) fn set_auth_deadline(&self, deadline: Instant) {
        if !self.is_authenticated() {
            *self.auth_deadline.lock() = Some(deadline);
        }
    }

    pub fn auth_deadline(&self) -> Option<Instant> {
        *self.auth_deadline.lock()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn queue_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.outbox.dropped()
    }

    pub fn is_open(&self) -> bool {
        self.close_reason.get().is_none()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Serialize and enqueue one server message
    pub fn send(&self, message: &ServerMessage) -> EnqueueOutcome {
        match message.to_json() {
            Ok(json) => self.enqueue(Arc::from(json)),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to serialize outbound message");
                EnqueueOutcome::DroppedNewest
            }
        }
    }

    /// Enqueue an already-serialized frame, applying the overflow policy
    pub fn enqueue(&self, message: Arc<str>) -> EnqueueOutcome {
        if !self.is_open() {
            return EnqueueOutcome::DroppedNewest;
        }

        let outcome = self.outbox.enqueue(message);

        if outcome == EnqueueOutcome::Overflow {
            let limit = self.outbox.len() as u64;
            self.rate_events.record(RateLimitEvent {
                timestamp: now_millis(),
                connection_id: self.id,
                user_id: self.user_id().map(str::to_string),
                reason: BreachReason::QueueOverflow,
                count: limit + 1,
                limit,
            });
            self.queue_stats.record_overflow_disconnect();
            warn!(
                connection_id = %self.id,
                user_id = ?self.user_id(),
                queue_size = limit,
                "Outbound queue overflow, disconnecting"
            );
            self.close_with(
                CloseReason::QueueOverflow,
                close_codes::QUEUE_OVERFLOW,
                "Queue overflow",
                &ServerMessage::error(
                    ErrorCode::QueueOverflow,
                    format!("Outbound queue exceeded {} messages", limit),
                ),
            );
        }

        outcome
    }

    /// Begin closing with a close frame; only the first call has any effect
    pub fn close(&self, reason: CloseReason, code: u16, message: &str) -> bool {
        self.finish(
            reason,
            None,
            Control::Close {
                code,
                reason: message.to_string(),
            },
        )
    }

    /// Like [`close`](Self::close), but `notice` is written just before the
    /// close frame even though the queue is discarded
    pub fn close_with(
        &self,
        reason: CloseReason,
        code: u16,
        message: &str,
        notice: &ServerMessage,
    ) -> bool {
        let notice = match notice.to_json() {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to serialize close notice");
                None
            }
        };
        self.finish(
            reason,
            notice,
            Control::Close {
                code,
                reason: message.to_string(),
            },
        )
    }

    /// Begin closing without a close handshake (dead or vanished peer)
    pub fn terminate(&self, reason: CloseReason) -> bool {
        self.finish(reason, None, Control::Terminate)
    }

    fn finish(&self, reason: CloseReason, notice: Option<Arc<str>>, control: Control) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }

        debug!(connection_id = %self.id, reason = %reason, "Connection closing");
        if let Some(notice) = notice {
            let _ = self.control_tx.send(Control::Notice(notice));
        }
        let _ = self.control_tx.send(control);
        self.outbox.discard();
        self.closed.notify_one();
        true
    }

    /// Resolves once [`close`](Self::close) or [`terminate`](Self::terminate) ran
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if !self.is_open() {
            return;
        }
        notified.await
    }

    pub(crate) fn ping(&self) -> bool {
        self.control_tx.send(Control::Ping).is_ok()
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Read and reset the liveness flag for one heartbeat round
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// True exactly once; guards teardown accounting
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("queue_len", &self.queue_len())
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(policy: OverflowPolicy, size: usize) -> (Arc<Connection>, mpsc::UnboundedReceiver<Control>) {
        Connection::new(
            ConnectionSettings {
                max_queue_size: size,
                overflow_policy: policy,
            },
            Arc::new(QueueStats::default()),
            Arc::new(RateLimitEventLog::new(10)),
        )
    }

    #[test]
    fn test_user_binding_is_write_once() {
        let (conn, _rx) = connection(OverflowPolicy::DropOldest, 4);
        conn.set_auth_deadline(Instant::now());
        assert!(conn.auth_deadline().is_some());

        assert!(conn.bind_user("alice".to_string()));
        assert!(conn.auth_deadline().is_none());
        assert!(!conn.bind_user("mallory".to_string()));
        assert_eq!(conn.user_id(), Some("alice"));

        // Deadline cannot be re-armed once authenticated
        conn.set_auth_deadline(Instant::now());
        assert!(conn.auth_deadline().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, mut rx) = connection(OverflowPolicy::DropOldest, 4);
        assert!(conn.close(CloseReason::RateLimit, close_codes::POLICY_VIOLATION, "Rate limit"));
        assert!(!conn.close(CloseReason::Normal, close_codes::NORMAL, ""));
        assert!(!conn.terminate(CloseReason::Error));

        assert_eq!(conn.close_reason(), Some(CloseReason::RateLimit));
        assert_eq!(
            rx.try_recv().unwrap(),
            Control::Close {
                code: close_codes::POLICY_VIOLATION,
                reason: "Rate limit".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_policy_closes_with_overflow_code() {
        let (conn, mut rx) = connection(OverflowPolicy::Disconnect, 2);
        assert_eq!(conn.enqueue(Arc::from("a")), EnqueueOutcome::Queued);
        assert_eq!(conn.enqueue(Arc::from("b")), EnqueueOutcome::Queued);
        assert_eq!(conn.enqueue(Arc::from("c")), EnqueueOutcome::Overflow);

        assert_eq!(conn.close_reason(), Some(CloseReason::QueueOverflow));
        assert!(conn.queue_len() <= 2);
        match rx.try_recv().unwrap() {
            Control::Notice(text) => assert!(text.contains("QUEUE_OVERFLOW")),
            other => panic!("unexpected control {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Control::Close { code, .. } => assert_eq!(code, close_codes::QUEUE_OVERFLOW),
            other => panic!("unexpected control {:?}", other),
        }
        assert_eq!(conn.rate_events.len(), 1);
    }

    #[test]
    fn test_teardown_guard_fires_once() {
        let (conn, _rx) = connection(OverflowPolicy::DropOldest, 1);
        assert!(conn.begin_teardown());
        assert!(!conn.begin_teardown());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (conn, _rx) = connection(OverflowPolicy::DropOldest, 1);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        conn.terminate(CloseReason::Error);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
