//! Main realtime WebSocket server

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, SinkExt, StreamExt};
use realtime_config::{service::realtime, RealtimeConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::auth::{TokenVerifier, WalletAccess};
use crate::bridge::{BridgeStats, EventBridge, PubSubMedium, RelaySocketMedium};
use crate::broadcast::EventBroadcaster;
use crate::client::{ClientManager, RealtimeStats};
use crate::error::{RealtimeError, Result};
use crate::outbound::Frame;
use crate::session::{run_session, InboundFrame};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub clients: RealtimeStats,
    pub bridge: BridgeStats,
}

/// Main realtime server
pub struct RealtimeServer {
    config: RealtimeConfig,
    manager: Arc<ClientManager>,
    bridge: Arc<EventBridge>,
    shutdown_tx: watch::Sender<bool>,
}

impl RealtimeServer {
    pub fn new(
        config: RealtimeConfig,
        verifier: Arc<dyn TokenVerifier>,
        wallet_access: Arc<dyn WalletAccess>,
    ) -> Self {
        let manager = Arc::new(ClientManager::new(&config, verifier, wallet_access));
        let bridge = Arc::new(EventBridge::new(&config.bridge));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            manager,
            bridge,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn broadcaster(&self) -> EventBroadcaster {
        EventBroadcaster::new(self.manager.clone(), self.bridge.clone())
    }

    /// Connect the bridge to the configured relay socket, if enabled
    pub async fn connect_bridge(&self) -> bool {
        if !self.config.bridge.enabled {
            info!("Event bridge disabled, broadcasting locally only");
            return false;
        }
        let Some(path) = self.config.bridge.relay_socket_path.clone() else {
            warn!("Event bridge enabled without a relay socket path");
            return false;
        };
        self.connect_bridge_with(Arc::new(RelaySocketMedium::new(path)))
            .await
    }

    pub async fn connect_bridge_with(&self, medium: Arc<dyn PubSubMedium>) -> bool {
        self.bridge.initialize(medium, self.manager.clone()).await
    }

    pub fn status(&self) -> StatusReport {
        status_report(&self.manager, &self.bridge)
    }

    /// Start the server and run until [`shutdown`](Self::shutdown)
    pub async fn start(&self) -> Result<()> {
        info!("Starting realtime WebSocket server");
        info!("Configuration: {:?}", self.config);

        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        )
        .parse()
        .map_err(|e| RealtimeError::Configuration {
            message: format!("Invalid bind address: {}", e),
        })?;

        let heartbeat = tokio::spawn(self.manager.clone().run_heartbeat());
        let (bound, server) = self.bind(addr)?;
        info!("WebSocket server listening on {}", bound);

        server.await;
        heartbeat.abort();
        info!("Realtime server stopped");
        Ok(())
    }

    /// Serve on an OS-assigned localhost port in the background
    pub fn bind_ephemeral(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let heartbeat = tokio::spawn(self.manager.clone().run_heartbeat());
        let (bound, server) = self.bind(([127, 0, 0, 1], 0).into())?;
        let handle = tokio::spawn(async move {
            server.await;
            heartbeat.abort();
        });
        Ok((bound, handle))
    }

    /// Close every client with going-away, stop the bridge and the listener
    pub fn shutdown(&self) {
        self.manager.shutdown();
        self.bridge.shutdown();
        let _ = self.shutdown_tx.send(true);
    }

    fn bind(&self, addr: SocketAddr) -> Result<(SocketAddr, BoxFuture<'static, ()>)> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let signal = async move {
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        };

        let routes = routes(self.manager.clone(), self.bridge.clone());

        if self.config.server.enable_cors {
            let cors = warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET"])
                .allow_headers(vec!["authorization"]);
            let (bound, server) = warp::serve(routes.with(cors))
                .try_bind_with_graceful_shutdown(addr, signal)?;
            Ok((bound, server.boxed()))
        } else {
            let (bound, server) =
                warp::serve(routes).try_bind_with_graceful_shutdown(addr, signal)?;
            Ok((bound, server.boxed()))
        }
    }
}

fn status_report(manager: &ClientManager, bridge: &EventBridge) -> StatusReport {
    StatusReport {
        status: if manager.is_shutting_down() {
            "stopping"
        } else {
            "running"
        },
        service: "wallet-realtime",
        version: env!("CARGO_PKG_VERSION"),
        clients: manager.stats(),
        bridge: bridge.stats(),
    }
}

/// `/ws`, `/health` and `/status`
pub fn routes(
    manager: Arc<ClientManager>,
    bridge: Arc<EventBridge>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ws_manager = manager.clone();
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<HashMap<String, String>>())
        .map(
            move |ws: warp::ws::Ws,
                  authorization: Option<String>,
                  query: HashMap<String, String>| {
                let manager = ws_manager.clone();
                let token = extract_token(authorization.as_deref(), &query);
                ws.max_message_size(realtime::MAX_INBOUND_FRAME_BYTES)
                    .max_frame_size(realtime::MAX_INBOUND_FRAME_BYTES)
                    .on_upgrade(move |socket| handle_socket(manager, socket, token))
            },
        );

    let health_route = warp::path("health")
        .and(warp::path::end())
        .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

    let status_route = warp::path("status")
        .and(warp::path::end())
        .map(move || warp::reply::json(&status_report(&manager, &bridge)));

    warp::get().and(ws_route.or(health_route).or(status_route))
}

/// Bearer header first; the query-string token is a deprecated fallback
pub fn extract_token(
    authorization: Option<&str>,
    query: &HashMap<String, String>,
) -> Option<String> {
    if let Some(header) = authorization {
        let header = header.trim();
        let is_bearer = header
            .get(..7)
            .map_or(false, |scheme| scheme.eq_ignore_ascii_case("bearer "));
        if is_bearer {
            let token = header.get(7..).unwrap_or_default().trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let token = query.get("token").filter(|t| !t.is_empty())?;
    warn!("Token passed in query string; use the Authorization header instead");
    Some(token.clone())
}

async fn handle_socket(manager: Arc<ClientManager>, socket: WebSocket, token: Option<String>) {
    let opened = manager.open_connection();
    let (ws_sender, ws_receiver) = socket.split();

    let sink = ws_sender.with(|frame: Frame| future::ready(Ok::<_, warp::Error>(to_message(frame))));
    let inbound = ws_receiver.map(|message| message.map(from_message));

    run_session(manager, opened, token, inbound, sink).await;
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::text(text.as_ref()),
        Frame::Ping => Message::ping(Vec::new()),
        Frame::Close { code, reason } => Message::close_with(code, reason),
    }
}

fn from_message(message: Message) -> InboundFrame {
    if message.is_close() {
        InboundFrame::Close
    } else if message.is_ping() {
        InboundFrame::Ping
    } else if message.is_pong() {
        InboundFrame::Pong
    } else if message.is_text() {
        match message.to_str() {
            Ok(text) => InboundFrame::Text(text.to_string()),
            Err(()) => InboundFrame::Binary(message.into_bytes()),
        }
    } else {
        InboundFrame::Binary(message.into_bytes())
    }
}
