//! One connection's lifetime
//!
//! Each accepted transport gets a reader loop (this task) and a writer task:
//!
//! ```text
//! transport ──frames──> run_session ──> ClientManager (auth, subscribe, rate)
//!                                 │
//! transport <──frames── writer <──┴── Outbox + Control channel
//! ```
//!
//! The reader processes a connection's own messages strictly in order. The
//! writer is the only consumer of the outbox, so at most one drain runs per
//! connection. Both are transport-agnostic: anything that is a `Stream` of
//! [`InboundFrame`] and a `Sink` of [`Frame`] can be served.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{ClientManager, OpenedConnection};
use crate::connection::{CloseReason, Connection, Control};
use crate::outbound::Frame;
use crate::protocol::{close_codes, ClientMessage, ServerMessage};
use crate::rate_limit::{RateLimiter, RatePolicy};

/// How long a closing connection may spend flushing its final frames
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// A frame received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

/// Serve one connection until it closes, then tear it down
pub async fn run_session<R, S, E>(
    manager: Arc<ClientManager>,
    opened: OpenedConnection,
    initial_token: Option<String>,
    mut inbound: R,
    sink: S,
) where
    R: Stream<Item = Result<InboundFrame, E>> + Unpin + Send,
    E: Display + Send,
    S: Sink<Frame> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    let OpenedConnection {
        connection,
        control_rx,
        admitted,
    } = opened;

    let mut writer = tokio::spawn(write_loop(
        connection.clone(),
        control_rx,
        sink,
        manager.transport_high_water_bytes(),
    ));

    if admitted {
        let authenticated = match initial_token {
            Some(token) => manager.authenticate(&connection, &token).await,
            None => false,
        };

        if connection.is_open() {
            let user_id = connection.user_id().map(str::to_string);
            connection.send(&ServerMessage::connected(user_id));
            if !authenticated {
                debug!(connection_id = %connection.id, "Awaiting in-band authentication");
            }
            read_loop(&manager, &connection, &mut inbound).await;
        }
    }

    manager.teardown(&connection);

    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        debug!(connection_id = %connection.id, "Writer did not finish in time, aborting");
        writer.abort();
    }
}

async fn read_loop<R, E>(manager: &ClientManager, connection: &Arc<Connection>, inbound: &mut R)
where
    R: Stream<Item = Result<InboundFrame, E>> + Unpin,
    E: Display,
{
    let mut limiter = RateLimiter::new(
        RatePolicy::from(manager.limits()),
        connection.connected_at(),
    );

    loop {
        let deadline = connection.auth_deadline();
        let auth_timer = async move {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = connection.closed() => break,
            _ = auth_timer => {
                if !connection.is_authenticated() {
                    warn!(connection_id = %connection.id, "Authentication timeout");
                    connection.close(
                        CloseReason::AuthTimeout,
                        close_codes::AUTH_TIMEOUT,
                        "Authentication timeout",
                    );
                    break;
                }
            }
            frame = inbound.next() => match frame {
                Some(Ok(InboundFrame::Text(text))) => {
                    connection.mark_alive();
                    if !admit_message(manager, connection, &mut limiter) {
                        break;
                    }
                    handle_text(manager, connection, &text).await;
                }
                Some(Ok(InboundFrame::Binary(bytes))) => {
                    connection.mark_alive();
                    if !admit_message(manager, connection, &mut limiter) {
                        break;
                    }
                    debug!(
                        connection_id = %connection.id,
                        len = bytes.len(),
                        "Dropping binary frame"
                    );
                }
                Some(Ok(InboundFrame::Ping)) | Some(Ok(InboundFrame::Pong)) => {
                    connection.mark_alive();
                }
                Some(Ok(InboundFrame::Close)) | None => {
                    info!(connection_id = %connection.id, "Client disconnected");
                    connection.terminate(CloseReason::Normal);
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection_id = %connection.id, error = %e, "WebSocket error");
                    connection.terminate(CloseReason::Error);
                    break;
                }
            }
        }
    }
}

/// Count one data frame; false if the connection was closed for it
fn admit_message(
    manager: &ClientManager,
    connection: &Connection,
    limiter: &mut RateLimiter,
) -> bool {
    manager.record_received();
    match limiter.check(Instant::now()) {
        Ok(()) => true,
        Err(breach) => {
            manager.reject_for_rate(connection, breach);
            false
        }
    }
}

async fn handle_text(manager: &ClientManager, connection: &Arc<Connection>, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(connection_id = %connection.id, error = %e, "Dropping invalid message");
            return;
        }
    };

    debug!(connection_id = %connection.id, kind = message.kind(), "Received message");

    match message {
        ClientMessage::Auth { token } => {
            if manager.authenticate(connection, &token).await {
                if let Some(user_id) = connection.user_id() {
                    connection.send(&ServerMessage::authenticated(user_id));
                }
            }
        }
        ClientMessage::Subscribe { channel } => {
            let reply = match manager.subscribe(connection, &channel).await {
                Ok(_) => ServerMessage::subscribed(channel),
                Err(e) => ServerMessage::error(e.code(), format!("{}: {}", e, channel)),
            };
            connection.send(&reply);
        }
        ClientMessage::Unsubscribe { channel } => {
            manager.unsubscribe(connection, &channel);
            connection.send(&ServerMessage::unsubscribed(channel));
        }
        ClientMessage::SubscribeBatch { channels } => {
            let result = manager.subscribe_batch(connection, &channels).await;
            connection.send(&ServerMessage::subscribed_batch(result));
        }
        ClientMessage::UnsubscribeBatch { channels } => {
            let result = manager.unsubscribe_batch(connection, &channels);
            connection.send(&ServerMessage::unsubscribed_batch(result));
        }
        ClientMessage::Ping => {
            connection.send(&ServerMessage::pong());
        }
        ClientMessage::Pong => connection.mark_alive(),
    }
}

/// Sole writer for one connection
///
/// Control instructions take priority over queued messages. A drain that is
/// suspended on transport backpressure is abandoned (without losing the
/// message at the head) when a control instruction arrives.
async fn write_loop<S>(
    connection: Arc<Connection>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut sink: S,
    high_water_bytes: usize,
) where
    S: Sink<Frame> + Unpin,
    S::Error: Display + Send,
{
    loop {
        let backlog = !connection.outbox().is_empty();

        tokio::select! {
            biased;

            instruction = control.recv() => match instruction {
                Some(Control::Ping) => {
                    if let Err(e) = sink.send(Frame::Ping).await {
                        debug!(connection_id = %connection.id, error = %e, "Ping failed");
                        connection.terminate(CloseReason::Error);
                        break;
                    }
                }
                Some(Control::Notice(text)) => {
                    if sink.send(Frame::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close { code, reason }) => {
                    let _ = sink.send(Frame::Close { code, reason }).await;
                    let _ = sink.close().await;
                    break;
                }
                Some(Control::Terminate) | None => break,
            },

            drained = async {
                if !backlog {
                    connection.outbox().ready().await;
                }
                let open = connection.clone();
                connection
                    .outbox()
                    .drain_into(&mut sink, high_water_bytes, move || open.is_open())
                    .await
            } => {
                if let Err(e) = drained {
                    warn!(connection_id = %connection.id, error = %e, "Failed to send to client");
                    connection.terminate(CloseReason::Error);
                    break;
                }
            }
        }
    }

    debug!(connection_id = %connection.id, "Writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticTokenVerifier, StaticWalletAccess};
    use futures::channel::mpsc as fmpsc;
    use realtime_config::RealtimeConfig;
    use serde_json::Value;

    struct Harness {
        manager: Arc<ClientManager>,
        to_server: fmpsc::UnboundedSender<Result<InboundFrame, String>>,
        from_server: fmpsc::UnboundedReceiver<Frame>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(config: RealtimeConfig, token: Option<&str>) -> Harness {
        let manager = Arc::new(ClientManager::new(
            &config,
            Arc::new(StaticTokenVerifier::default().with_token("t-alice", "alice")),
            Arc::new(StaticWalletAccess::default().grant("alice", "w1")),
        ));
        let (to_server, inbound) = fmpsc::unbounded();
        let (sink, from_server) = fmpsc::unbounded();
        let opened = manager.open_connection();
        let task = tokio::spawn(run_session(
            manager.clone(),
            opened,
            token.map(str::to_string),
            inbound,
            sink,
        ));
        Harness {
            manager,
            to_server,
            from_server,
            task,
        }
    }

    impl Harness {
        fn send(&self, value: Value) {
            self.to_server
                .unbounded_send(Ok(InboundFrame::Text(value.to_string())))
                .unwrap();
        }

        async fn next(&mut self) -> Frame {
            tokio::time::timeout(Duration::from_secs(2), self.from_server.next())
                .await
                .expect("frame in time")
                .expect("stream open")
        }

        async fn next_json(&mut self) -> Value {
            match self.next().await {
                Frame::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected text, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_header_token_authenticates_before_connected() {
        let mut h = start(RealtimeConfig::default(), Some("t-alice"));
        let connected = h.next_json().await;
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["data"]["authenticated"], true);
        assert_eq!(connected["data"]["userId"], "alice");
    }

    #[tokio::test]
    async fn test_in_band_auth_and_subscribe() {
        let mut h = start(RealtimeConfig::default(), None);
        assert_eq!(h.next_json().await["data"]["authenticated"], false);

        h.send(serde_json::json!({"type": "subscribe", "data": {"channel": "wallet:w1"}}));
        let denied = h.next_json().await;
        assert_eq!(denied["data"]["code"], "AUTHENTICATION_REQUIRED");

        h.send(serde_json::json!({"type": "auth", "data": {"token": "t-alice"}}));
        let auth = h.next_json().await;
        assert_eq!(auth["type"], "authenticated");
        assert_eq!(auth["data"]["userId"], "alice");

        h.send(serde_json::json!({"type": "subscribe", "data": {"channel": "wallet:w1"}}));
        assert_eq!(h.next_json().await["type"], "subscribed");

        // Malformed frames are dropped without a reply
        h.to_server
            .unbounded_send(Ok(InboundFrame::Text("{not json".to_string())))
            .unwrap();
        h.send(serde_json::json!({"type": "ping"}));
        assert_eq!(h.next_json().await["type"], "pong");
    }

    #[tokio::test]
    async fn test_auth_timeout_closes_with_4001() {
        let mut config = RealtimeConfig::default();
        config.limits.auth_timeout_ms = 50;
        let mut h = start(config, None);
        assert_eq!(h.next_json().await["type"], "connected");

        match h.next().await {
            Frame::Close { code, .. } => assert_eq!(code, close_codes::AUTH_TIMEOUT),
            other => panic!("expected close, got {:?}", other),
        }
        h.task.await.unwrap();
        assert_eq!(h.manager.client_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_sends_error_then_closes() {
        let mut config = RealtimeConfig::default();
        config.limits.grace_period_message_limit = 3;
        let mut h = start(config, Some("t-alice"));
        h.next_json().await;

        for _ in 0..3 {
            h.send(serde_json::json!({"type": "ping"}));
            assert_eq!(h.next_json().await["type"], "pong");
        }
        h.send(serde_json::json!({"type": "ping"}));
        let error = h.next_json().await;
        assert_eq!(error["data"]["code"], "RATE_LIMIT_EXCEEDED");
        match h.next().await {
            Frame::Close { code, .. } => assert_eq!(code, close_codes::POLICY_VIOLATION),
            other => panic!("expected close, got {:?}", other),
        }
        h.task.await.unwrap();
        assert_eq!(h.manager.rate_events().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_initial_token_closes() {
        let mut h = start(RealtimeConfig::default(), Some("forged"));
        let error = h.next_json().await;
        assert_eq!(error["data"]["code"], "AUTHENTICATION_FAILED");
        assert!(matches!(h.next().await, Frame::Close { code: 1008, .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_pong_keeps_peer_then_silence_terminates() {
        let mut h = start(RealtimeConfig::default(), Some("t-alice"));
        h.next_json().await;

        assert_eq!(h.manager.heartbeat_sweep(), (1, 0));
        assert!(matches!(h.next().await, Frame::Ping));

        h.to_server.unbounded_send(Ok(InboundFrame::Pong)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.manager.heartbeat_sweep(), (1, 0));
        assert!(matches!(h.next().await, Frame::Ping));

        assert_eq!(h.manager.heartbeat_sweep(), (0, 1));
        tokio::time::timeout(Duration::from_secs(2), &mut h.task)
            .await
            .expect("session ends after terminate")
            .unwrap();
        assert_eq!(h.manager.client_count(), 0);
        assert_eq!(h.manager.user_connection_count("alice"), 0);
        assert_eq!(h.manager.registry().total_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_tears_down() {
        let mut h = start(RealtimeConfig::default(), None);
        h.next_json().await;
        h.to_server.unbounded_send(Ok(InboundFrame::Close)).unwrap();
        h.task.await.unwrap();
        assert_eq!(h.manager.client_count(), 0);
    }
}
