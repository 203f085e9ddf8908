//! Wallet Realtime Server
//!
//! Authenticated WebSocket push service for wallet events. Clients subscribe
//! to named channels (`blocks`, `wallet:<id>`, `wallet:<id>:transaction`,
//! ...) and receive every matching domain event at most once. Several
//! processes behind one load balancer stay consistent through the event
//! bridge.

#![recursion_limit = "256"]

pub mod auth;
pub mod bridge;
pub mod broadcast;
pub mod client;
pub mod connection;
pub mod error;
pub mod outbound;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod session;
pub mod subscription;

pub use auth::{
    AllowAllWalletAccess, StaticAuthFile, StaticTokenVerifier, StaticWalletAccess,
    TokenVerifier, WalletAccess, WalletAccessResult,
};
pub use bridge::{
    BridgeEnvelope, BridgeStats, EventBridge, LocalBroadcast, MemoryMedium, PubSubMedium,
    RelayHub, RelaySocketMedium,
};
pub use broadcast::EventBroadcaster;
pub use client::{ClientManager, OpenedConnection, RealtimeStats, SubscribeError};
pub use connection::{CloseReason, Connection, ConnectionId};
pub use error::{AuthError, BridgeError, RealtimeError, Result};
pub use protocol::{ClientMessage, ErrorCode, ServerMessage};
pub use router::{channels_for, DomainEvent};
pub use server::{RealtimeServer, StatusReport};

/// Re-export the configuration crate so embedders need a single dependency
pub use realtime_config::{self as config, RealtimeConfig};
