//! WebSocket client management
//!
//! [`ClientManager`] owns every live [`Connection`], the per-user index used
//! for the per-user ceiling, and the [`SubscriptionRegistry`]. All admission
//! decisions (global ceiling, authentication, per-user ceiling, subscription
//! rules) and the single teardown path live here.

use dashmap::DashMap;
use realtime_config::{close_codes, LimitSettings, QueueSettings, RealtimeConfig};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::auth::{TokenVerifier, WalletAccess};
use crate::bridge::LocalBroadcast;
use crate::connection::{CloseReason, Connection, ConnectionId, ConnectionSettings, Control};
use crate::outbound::QueueStats;
use crate::protocol::{
    now_millis, BatchSubscribeResult, BatchUnsubscribeResult, ChannelFailure, ErrorCode,
    ServerMessage,
};
use crate::rate_limit::{RateLimitBreach, RateLimitEvent, RateLimitEventLog};
use crate::router::{channels_for, user_channel, wallet_id_of, DomainEvent};
use crate::subscription::{ChannelInfo, RegistryError, SubscribeOutcome, SubscriptionRegistry};

/// Why a single subscribe request was refused; the connection stays open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("Subscription limit reached ({limit})")]
    LimitExceeded { limit: usize },

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Access denied")]
    AccessDenied,

    #[error("Connection closed")]
    Closed,
}

impl SubscribeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SubscribeError::LimitExceeded { .. } => ErrorCode::SubscriptionLimitExceeded,
            SubscribeError::AuthenticationRequired => ErrorCode::AuthenticationRequired,
            SubscribeError::AccessDenied => ErrorCode::AccessDenied,
            SubscribeError::Closed => ErrorCode::InvalidMessage,
        }
    }
}

/// A freshly accepted transport
pub struct OpenedConnection {
    pub connection: Arc<Connection>,
    pub control_rx: mpsc::UnboundedReceiver<Control>,
    /// False when the connection was refused and is already closing
    pub admitted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub max_queue_size: usize,
    pub overflow_policy: String,
    pub pending: usize,
    pub sent: u64,
    pub dropped: u64,
    pub overflow_disconnects: u64,
}

/// Operational snapshot served from `/status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub client_count: usize,
    pub authenticated_users: usize,
    pub channel_count: usize,
    pub total_subscriptions: usize,
    pub channels: Vec<ChannelInfo>,
    pub limits: LimitSettings,
    pub queue: QueueSnapshot,
    pub messages_received: u64,
    pub recent_rate_limit_events: Vec<RateLimitEvent>,
}

/// Manages all connected WebSocket clients
pub struct ClientManager {
    limits: LimitSettings,
    queue: QueueSettings,
    heartbeat_interval: Duration,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    users: DashMap<String, HashSet<ConnectionId>>,
    registry: SubscriptionRegistry,
    verifier: Arc<dyn TokenVerifier>,
    wallet_access: Arc<dyn WalletAccess>,
    rate_events: Arc<RateLimitEventLog>,
    queue_stats: Arc<QueueStats>,
    active: AtomicUsize,
    messages_received: AtomicU64,
    shutting_down: AtomicBool,
    shutdown: Notify,
}

impl ClientManager {
    pub fn new(
        config: &RealtimeConfig,
        verifier: Arc<dyn TokenVerifier>,
        wallet_access: Arc<dyn WalletAccess>,
    ) -> Self {
        Self {
            limits: config.limits.clone(),
            queue: config.queue.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat.interval_ms),
            connections: DashMap::new(),
            users: DashMap::new(),
            registry: SubscriptionRegistry::new(config.limits.max_subscriptions_per_connection),
            verifier,
            wallet_access,
            rate_events: Arc::new(RateLimitEventLog::new(config.limits.max_rate_limit_events)),
            queue_stats: Arc::new(QueueStats::default()),
            active: AtomicUsize::new(0),
            messages_received: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn limits(&self) -> &LimitSettings {
        &self.limits
    }

    pub fn transport_high_water_bytes(&self) -> usize {
        self.queue.transport_high_water_bytes
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn rate_events(&self) -> &RateLimitEventLog {
        &self.rate_events
    }

    /// Accept a transport, enforcing the global connection ceiling
    ///
    /// A refused connection is returned already closing (policy violation,
    /// or going-away during shutdown) so the caller can still flush the
    /// close frame to the peer.
    pub fn open_connection(&self) -> OpenedConnection {
        let (connection, control_rx) = Connection::new(
            ConnectionSettings {
                max_queue_size: self.queue.max_queue_size,
                overflow_policy: self.queue.overflow_policy,
            },
            self.queue_stats.clone(),
            self.rate_events.clone(),
        );

        if self.shutting_down.load(Ordering::Acquire) {
            connection.close(
                CloseReason::Normal,
                close_codes::GOING_AWAY,
                "Server shutting down",
            );
            return OpenedConnection {
                connection,
                control_rx,
                admitted: false,
            };
        }

        let max = self.limits.max_connections;
        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();

        if !reserved {
            warn!(
                connection_id = %connection.id,
                max_connections = max,
                "Rejecting connection, server at capacity"
            );
            metrics::counter!("realtime_connections_rejected_total", "reason" => "capacity")
                .increment(1);
            connection.close(
                CloseReason::Capacity,
                close_codes::POLICY_VIOLATION,
                "Server at capacity",
            );
            return OpenedConnection {
                connection,
                control_rx,
                admitted: false,
            };
        }

        connection.set_auth_deadline(
            Instant::now() + Duration::from_millis(self.limits.auth_timeout_ms),
        );
        self.registry.register_connection(connection.id);
        self.connections.insert(connection.id, connection.clone());

        let active = self.active.load(Ordering::Acquire);
        metrics::gauge!("realtime_connections_active").set(active as f64);
        info!(
            connection_id = %connection.id,
            "Added client, total connections: {}", active
        );

        OpenedConnection {
            connection,
            control_rx,
            admitted: true,
        }
    }

    /// Bind a verified user to `connection`
    ///
    /// Returns true when the connection ends up authenticated. A connection
    /// that is already authenticated gets a repeat acknowledgement and keeps
    /// its user. Verification failure and the per-user ceiling close it.
    pub async fn authenticate(&self, connection: &Arc<Connection>, token: &str) -> bool {
        if connection.is_authenticated() {
            debug!(connection_id = %connection.id, "Already authenticated");
            return true;
        }

        let user_id = match self.verifier.verify(token).await {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!(connection_id = %connection.id, error = %e, "Authentication failed");
                metrics::counter!("realtime_connections_rejected_total", "reason" => "auth_failed")
                    .increment(1);
                connection.close_with(
                    CloseReason::AuthFailed,
                    close_codes::POLICY_VIOLATION,
                    "Authentication failed",
                    &ServerMessage::error(ErrorCode::AuthenticationFailed, "Authentication failed"),
                );
                return false;
            }
        };

        if !connection.is_open() {
            return false;
        }

        {
            let mut user_connections = self.users.entry(user_id.clone()).or_default();
            if user_connections.len() >= self.limits.max_per_user {
                drop(user_connections);
                warn!(
                    connection_id = %connection.id,
                    user_id = %user_id,
                    max_per_user = self.limits.max_per_user,
                    "Rejecting connection, per-user limit reached"
                );
                metrics::counter!("realtime_connections_rejected_total", "reason" => "per_user")
                    .increment(1);
                connection.close(
                    CloseReason::Capacity,
                    close_codes::POLICY_VIOLATION,
                    "Too many connections for user",
                );
                return false;
            }

            if !connection.bind_user(user_id.clone()) {
                return connection.is_authenticated();
            }
            user_connections.insert(connection.id);
        }

        info!(connection_id = %connection.id, user_id = %user_id, "Client authenticated");
        true
    }

    /// Apply the admission rules for one channel and record the subscription
    pub async fn subscribe(
        &self,
        connection: &Connection,
        channel: &str,
    ) -> Result<SubscribeOutcome, SubscribeError> {
        if !connection.is_open() {
            return Err(SubscribeError::Closed);
        }

        let limit = self.registry.max_per_connection();
        if self.registry.subscription_count(&connection.id) >= limit
            && !self.registry.is_subscribed(&connection.id, channel)
        {
            return Err(SubscribeError::LimitExceeded { limit });
        }

        if channel.starts_with("wallet:") {
            let user_id = connection
                .user_id()
                .ok_or(SubscribeError::AuthenticationRequired)?;
            let wallet_id = wallet_id_of(channel).ok_or(SubscribeError::AccessDenied)?;

            let access = self
                .wallet_access
                .check_wallet_access(wallet_id, user_id)
                .await;
            if !access.has_access {
                debug!(
                    connection_id = %connection.id,
                    user_id = %user_id,
                    wallet_id = %wallet_id,
                    "Wallet access denied"
                );
                return Err(SubscribeError::AccessDenied);
            }
        }

        match self.registry.subscribe(connection.id, channel) {
            Ok(SubscribeOutcome::Added) => {
                metrics::gauge!("realtime_subscriptions_active").increment(1.0);
                Ok(SubscribeOutcome::Added)
            }
            Ok(SubscribeOutcome::AlreadySubscribed) => Ok(SubscribeOutcome::AlreadySubscribed),
            Err(RegistryError::LimitExceeded { limit }) => {
                Err(SubscribeError::LimitExceeded { limit })
            }
            Err(RegistryError::UnknownConnection) => Err(SubscribeError::Closed),
        }
    }

    /// Returns false (and changes nothing) if not subscribed
    pub fn unsubscribe(&self, connection: &Connection, channel: &str) -> bool {
        let removed = self.registry.unsubscribe(&connection.id, channel);
        if removed {
            metrics::gauge!("realtime_subscriptions_active").decrement(1.0);
        }
        removed
    }

    /// Subscribe to each channel independently
    pub async fn subscribe_batch(
        &self,
        connection: &Connection,
        channels: &[String],
    ) -> BatchSubscribeResult {
        let mut result = BatchSubscribeResult {
            subscribed: Vec::with_capacity(channels.len()),
            errors: Vec::new(),
        };

        for channel in channels {
            match self.subscribe(connection, channel).await {
                Ok(_) => result.subscribed.push(channel.clone()),
                Err(e) => result.errors.push(ChannelFailure {
                    channel: channel.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        result
    }

    pub fn unsubscribe_batch(
        &self,
        connection: &Connection,
        channels: &[String],
    ) -> BatchUnsubscribeResult {
        for channel in channels {
            self.unsubscribe(connection, channel);
        }
        BatchUnsubscribeResult {
            unsubscribed: channels.to_vec(),
        }
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("realtime_messages_received_total").increment(1);
    }

    /// Report a rate-limit breach to the client, log it, and close
    pub fn reject_for_rate(&self, connection: &Connection, breach: RateLimitBreach) {
        warn!(
            connection_id = %connection.id,
            user_id = ?connection.user_id(),
            reason = breach.reason.as_str(),
            count = breach.count,
            limit = breach.limit,
            "Rate limit exceeded"
        );

        self.rate_events.record(RateLimitEvent {
            timestamp: now_millis(),
            connection_id: connection.id,
            user_id: connection.user_id().map(str::to_string),
            reason: breach.reason,
            count: breach.count,
            limit: breach.limit,
        });
        connection.close_with(
            CloseReason::RateLimit,
            close_codes::POLICY_VIOLATION,
            "Rate limit exceeded",
            &ServerMessage::error_with_hint(
                ErrorCode::RateLimitExceeded,
                breach.describe(),
                "Reduce message rate and reconnect after backoff",
            ),
        );
    }

    /// Unwind every trace of `connection`; safe to call more than once
    pub fn teardown(&self, connection: &Connection) {
        if !connection.begin_teardown() {
            return;
        }

        if connection.is_open() {
            connection.terminate(CloseReason::Normal);
        }

        let registered = self.connections.remove(&connection.id).is_some();

        if let Some(user_id) = connection.user_id() {
            if let Some(mut user_connections) = self.users.get_mut(user_id) {
                user_connections.remove(&connection.id);
            }
            self.users
                .remove_if(user_id, |_, user_connections| user_connections.is_empty());
        }

        let removed = self.registry.remove_connection(&connection.id);
        if removed > 0 {
            metrics::gauge!("realtime_subscriptions_active").decrement(removed as f64);
        }

        let reason = connection.close_reason().unwrap_or(CloseReason::Normal);
        let duration = connection.connected_at().elapsed();
        metrics::histogram!("realtime_connection_duration_seconds", "reason" => reason.as_str())
            .record(duration.as_secs_f64());

        if registered {
            let active = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
            metrics::gauge!("realtime_connections_active").set(active as f64);
            info!(
                connection_id = %connection.id,
                user_id = ?connection.user_id(),
                reason = %reason,
                duration_ms = duration.as_millis() as u64,
                subscriptions = removed,
                "Removed client, total connections: {}", active
            );
        }
    }

    /// Enqueue one frame per connection subscribed to any matching channel
    pub fn broadcast_event(&self, event: &DomainEvent) -> usize {
        let channels = channels_for(event);
        let targets = self.registry.subscribers_of_any(&channels);
        if targets.is_empty() {
            return 0;
        }

        let mut frames: HashMap<&str, Arc<str>> = HashMap::new();
        let mut delivered = 0;

        for (connection_id, channel) in targets {
            let Some(connection) = self.connections.get(&connection_id).map(|c| c.value().clone()) else {
                continue;
            };

            let frame = match frames.get(channel) {
                Some(frame) => frame.clone(),
                None => match event_frame(event, channel) {
                    Some(frame) => {
                        frames.insert(channel, frame.clone());
                        frame
                    }
                    None => return delivered,
                },
            };

            if connection.enqueue(frame).inserted() {
                delivered += 1;
            }
        }

        debug!(
            event = event.event_type(),
            channels = channels.len(),
            delivered,
            "Broadcast event"
        );
        delivered
    }

    /// Deliver `event` to every connection of one user, on `user:<id>`
    pub fn send_to_user(&self, user_id: &str, event: &DomainEvent) -> usize {
        let ids: Vec<ConnectionId> = match self.users.get(user_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return 0,
        };

        let channel = user_channel(user_id);
        let Some(frame) = event_frame(event, &channel) else {
            return 0;
        };

        ids.into_iter()
            .filter_map(|id| self.connections.get(&id).map(|c| c.value().clone()))
            .filter(|connection| connection.enqueue(frame.clone()).inserted())
            .count()
    }

    /// One heartbeat round: terminate peers that missed the last ping,
    /// ping the rest. Returns `(pinged, terminated)`.
    pub fn heartbeat_sweep(&self) -> (usize, usize) {
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|c| c.value().clone()).collect();
        let mut pinged = 0;
        let mut terminated = 0;

        for connection in connections {
            if !connection.is_open() {
                continue;
            }

            if !connection.take_alive() || !connection.ping() {
                warn!(connection_id = %connection.id, "Heartbeat missed, terminating");
                connection.terminate(CloseReason::Error);
                terminated += 1;
            } else {
                pinged += 1;
            }
        }

        if terminated > 0 {
            info!(pinged, terminated, "Heartbeat sweep");
        } else {
            debug!(pinged, "Heartbeat sweep");
        }
        (pinged, terminated)
    }

    /// Periodic heartbeat; returns after [`shutdown`](Self::shutdown)
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.is_shutting_down() {
                        break;
                    }
                    self.heartbeat_sweep();
                }
                _ = self.shutdown.notified() => break,
            }
        }

        debug!("Heartbeat task stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Close every connection with going-away and stop the heartbeat
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.notify_waiters();

        let closed = self
            .connections
            .iter()
            .filter(|entry| {
                entry.value().close(
                    CloseReason::Normal,
                    close_codes::GOING_AWAY,
                    "Server shutting down",
                )
            })
            .count();

        info!(closed, "Client manager shut down");
        closed
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    pub fn stats(&self) -> RealtimeStats {
        RealtimeStats {
            client_count: self.client_count(),
            authenticated_users: self.users.len(),
            channel_count: self.registry.channel_count(),
            total_subscriptions: self.registry.total_subscriptions(),
            channels: self.registry.channel_info(),
            limits: self.limits.clone(),
            queue: QueueSnapshot {
                max_queue_size: self.queue.max_queue_size,
                overflow_policy: self.queue.overflow_policy.to_string(),
                pending: self.connections.iter().map(|c| c.queue_len()).sum(),
                sent: self.queue_stats.sent(),
                dropped: self.queue_stats.dropped(),
                overflow_disconnects: self.queue_stats.overflow_disconnects(),
            },
            messages_received: self.messages_received.load(Ordering::Relaxed),
            recent_rate_limit_events: self.rate_events.recent(),
        }
    }
}

impl LocalBroadcast for ClientManager {
    fn broadcast_local(&self, event: &DomainEvent) -> usize {
        self.broadcast_event(event)
    }
}

fn event_frame(event: &DomainEvent, channel: &str) -> Option<Arc<str>> {
    let message = ServerMessage::event(event.event_type(), event.data().clone(), channel);
    match message.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(event = event.event_type(), error = %e, "Failed to serialize event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllWalletAccess, StaticTokenVerifier, StaticWalletAccess};
    use serde_json::json;

    fn manager_with(config: RealtimeConfig) -> ClientManager {
        let verifier = StaticTokenVerifier::default()
            .with_token("t-alice", "alice")
            .with_token("t-bob", "bob");
        let access = StaticWalletAccess::default()
            .grant("alice", "w1")
            .grant("alice", "w2");
        ClientManager::new(&config, Arc::new(verifier), Arc::new(access))
    }

    fn manager() -> ClientManager {
        manager_with(RealtimeConfig::default())
    }

    fn drain_text(connection: &Connection) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        let (mut tx, mut rx) = futures::channel::mpsc::unbounded();
        futures::executor::block_on(connection.outbox().drain_into(&mut tx, usize::MAX, || true))
            .unwrap();
        drop(tx);
        while let Ok(Some(crate::outbound::Frame::Text(text))) = rx.try_next() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_client_manager() {
        let manager = manager();
        assert_eq!(manager.client_count(), 0);

        let opened = manager.open_connection();
        assert!(opened.admitted);
        assert!(opened.connection.auth_deadline().is_some());
        assert_eq!(manager.client_count(), 1);

        manager.teardown(&opened.connection);
        manager.teardown(&opened.connection);
        assert_eq!(manager.client_count(), 0);
        assert_eq!(manager.active.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_global_ceiling() {
        let mut config = RealtimeConfig::default();
        config.limits.max_connections = 1;
        let manager = manager_with(config);

        let first = manager.open_connection();
        let second = manager.open_connection();
        assert!(first.admitted);
        assert!(!second.admitted);
        assert_eq!(second.connection.close_reason(), Some(CloseReason::Capacity));

        // Rejected connection must not disturb the active count
        manager.teardown(&second.connection);
        assert_eq!(manager.active.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_authentication_is_idempotent() {
        let manager = manager();
        let opened = manager.open_connection();
        let conn = opened.connection;

        assert!(manager.authenticate(&conn, "t-alice").await);
        assert!(conn.auth_deadline().is_none());
        assert!(manager.authenticate(&conn, "t-bob").await);
        assert_eq!(conn.user_id(), Some("alice"));
        assert_eq!(manager.user_connection_count("alice"), 1);
    }

    #[tokio::test]
    async fn test_failed_authentication_closes() {
        let manager = manager();
        let conn = manager.open_connection().connection;

        assert!(!manager.authenticate(&conn, "bogus").await);
        assert_eq!(conn.close_reason(), Some(CloseReason::AuthFailed));
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_per_user_ceiling() {
        let mut config = RealtimeConfig::default();
        config.limits.max_per_user = 2;
        let manager = manager_with(config);

        let conns: Vec<_> = (0..3).map(|_| manager.open_connection().connection).collect();
        assert!(manager.authenticate(&conns[0], "t-alice").await);
        assert!(manager.authenticate(&conns[1], "t-alice").await);
        assert!(!manager.authenticate(&conns[2], "t-alice").await);
        assert_eq!(conns[2].close_reason(), Some(CloseReason::Capacity));
        assert_eq!(manager.user_connection_count("alice"), 2);

        manager.teardown(&conns[0]);
        assert_eq!(manager.user_connection_count("alice"), 1);
    }

    #[tokio::test]
    async fn test_wallet_channel_rules() {
        let manager = manager();
        let conn = manager.open_connection().connection;

        assert_eq!(
            manager.subscribe(&conn, "wallet:w1").await,
            Err(SubscribeError::AuthenticationRequired)
        );
        assert!(manager.subscribe(&conn, "blocks").await.is_ok());

        manager.authenticate(&conn, "t-alice").await;
        assert!(manager.subscribe(&conn, "wallet:w1:balance").await.is_ok());
        assert_eq!(
            manager.subscribe(&conn, "wallet:w9").await,
            Err(SubscribeError::AccessDenied)
        );
        assert!(!manager.registry().is_subscribed(&conn.id, "wallet:w9"));
    }

    #[tokio::test]
    async fn test_subscription_ceiling_is_structured_error() {
        let mut config = RealtimeConfig::default();
        config.limits.max_subscriptions_per_connection = 2;
        let manager = manager_with(config);
        let conn = manager.open_connection().connection;

        let channels: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let result = manager.subscribe_batch(&conn, &channels).await;
        assert_eq!(result.subscribed, vec!["a", "b"]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].channel, "c");
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_batch_subscribe_partial_success() {
        let manager = manager();
        let conn = manager.open_connection().connection;
        manager.authenticate(&conn, "t-alice").await;

        let channels: Vec<String> = vec![
            "wallet:w1".into(),
            "wallet:w2".into(),
            "blocks".into(),
            "wallet:w3".into(),
        ];
        let result = manager.subscribe_batch(&conn, &channels).await;
        assert_eq!(result.subscribed.len(), 3);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].channel, "wallet:w3");
        assert_eq!(result.errors[0].reason, "Access denied");
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_deduplicates() {
        let config = RealtimeConfig::default();
        let manager = ClientManager::new(
            &config,
            Arc::new(StaticTokenVerifier::default().with_token("t", "u")),
            Arc::new(AllowAllWalletAccess),
        );

        let wallet = manager.open_connection().connection;
        let all = manager.open_connection().connection;
        let neither = manager.open_connection().connection;
        manager.authenticate(&wallet, "t").await;

        manager.subscribe(&wallet, "wallet:W").await.unwrap();
        manager.subscribe(&wallet, "transactions:all").await.unwrap();
        manager.subscribe(&all, "transactions:all").await.unwrap();
        manager.subscribe(&neither, "blocks").await.unwrap();

        let event = DomainEvent::Transaction {
            wallet_id: "W".into(),
            address_id: None,
            data: json!({"txid": "t1"}),
        };
        assert_eq!(manager.broadcast_event(&event), 2);
        assert_eq!(drain_text(&wallet).len(), 1);
        let frames = drain_text(&all);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "event");
        assert_eq!(frames[0]["event"], "transaction");
        assert_eq!(frames[0]["channel"], "transactions:all");
        assert!(drain_text(&neither).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_unwinds_subscriptions_once() {
        let manager = manager();
        let conn = manager.open_connection().connection;
        manager.subscribe(&conn, "blocks").await.unwrap();
        manager.subscribe(&conn, "mempool").await.unwrap();

        assert!(!manager.unsubscribe(&conn, "sync:all"));
        manager.teardown(&conn);
        manager.teardown(&conn);
        assert_eq!(manager.registry().channel_count(), 0);
        assert!(manager.registry().is_consistent());
    }

    #[tokio::test]
    async fn test_send_to_user() {
        let manager = manager();
        let a = manager.open_connection().connection;
        let b = manager.open_connection().connection;
        manager.authenticate(&a, "t-alice").await;
        manager.authenticate(&b, "t-bob").await;

        let notice = DomainEvent::ModelDownload { data: json!({"progress": 50}) };
        assert_eq!(manager.send_to_user("alice", &notice), 1);
        let frames = drain_text(&a);
        assert_eq!(frames[0]["channel"], "user:alice");
        assert!(drain_text(&b).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_terminates_silent_peers() {
        let manager = manager();
        let opened = manager.open_connection();
        let conn = opened.connection.clone();

        assert_eq!(manager.heartbeat_sweep(), (1, 0));
        // No pong arrived since the previous sweep
        assert_eq!(manager.heartbeat_sweep(), (0, 1));
        assert_eq!(conn.close_reason(), Some(CloseReason::Error));

        let live_opened = manager.open_connection();
        let live = live_opened.connection.clone();
        manager.heartbeat_sweep();
        live.mark_alive();
        manager.heartbeat_sweep();
        assert!(live.is_open());
    }

    #[tokio::test]
    async fn test_shutdown_closes_with_going_away() {
        let manager = manager();
        let opened = manager.open_connection();
        let mut control = opened.control_rx;

        assert_eq!(manager.shutdown(), 1);
        assert_eq!(
            control.recv().await,
            Some(Control::Close {
                code: close_codes::GOING_AWAY,
                reason: "Server shutting down".to_string()
            })
        );
        assert!(!manager.open_connection().admitted);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let manager = manager();
        let conn = manager.open_connection().connection;
        manager.subscribe(&conn, "blocks").await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.client_count, 1);
        assert_eq!(stats.channels.len(), 1);
        assert_eq!(stats.channels[0].subscribers, 1);
        assert_eq!(stats.queue.overflow_policy, "drop_oldest");

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["limits"]["max_per_user"], 10);
    }
}
