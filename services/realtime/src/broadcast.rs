//! Public broadcast entry points
//!
//! Every entry point publishes to the bridge first and then delivers
//! locally, so this process's own clients are served even while the bridge
//! is disabled or failing.

use serde_json::Value;
use std::sync::Arc;

use crate::bridge::{EventBridge, LocalBroadcast};
use crate::client::ClientManager;
use crate::router::DomainEvent;

#[derive(Clone)]
pub struct EventBroadcaster {
    manager: Arc<ClientManager>,
    bridge: Arc<EventBridge>,
}

impl EventBroadcaster {
    pub fn new(manager: Arc<ClientManager>, bridge: Arc<EventBridge>) -> Self {
        Self { manager, bridge }
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    /// Publish to other instances, then deliver locally
    ///
    /// Returns the number of local connections the event was queued for.
    pub fn broadcast(&self, event: DomainEvent) -> usize {
        self.bridge.publish(&event);
        self.manager.broadcast_local(&event)
    }

    pub fn broadcast_transaction(
        &self,
        wallet_id: impl Into<String>,
        address_id: Option<String>,
        data: Value,
    ) -> usize {
        self.broadcast(DomainEvent::Transaction {
            wallet_id: wallet_id.into(),
            address_id,
            data,
        })
    }

    pub fn broadcast_balance(
        &self,
        wallet_id: impl Into<String>,
        address_id: Option<String>,
        data: Value,
    ) -> usize {
        self.broadcast(DomainEvent::Balance {
            wallet_id: wallet_id.into(),
            address_id,
            data,
        })
    }

    pub fn broadcast_confirmation(&self, wallet_id: impl Into<String>, data: Value) -> usize {
        self.broadcast(DomainEvent::Confirmation {
            wallet_id: wallet_id.into(),
            address_id: None,
            data,
        })
    }

    /// Sent as `newBlock`, the event name browser clients listen for
    pub fn broadcast_block(&self, data: Value) -> usize {
        self.broadcast(DomainEvent::NewBlock { data })
    }

    pub fn broadcast_mempool(&self, data: Value) -> usize {
        self.broadcast(DomainEvent::Mempool { data })
    }

    pub fn broadcast_sync(&self, wallet_id: Option<String>, data: Value) -> usize {
        self.broadcast(DomainEvent::Sync { wallet_id, data })
    }

    pub fn broadcast_log(&self, wallet_id: Option<String>, data: Value) -> usize {
        self.broadcast(DomainEvent::Log { wallet_id, data })
    }

    pub fn broadcast_model_download(&self, data: Value) -> usize {
        self.broadcast(DomainEvent::ModelDownload { data })
    }

    /// Account-level notice for one user; never bridged
    pub fn send_to_user(&self, user_id: &str, event: &DomainEvent) -> usize {
        self.manager.send_to_user(user_id, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllWalletAccess, StaticTokenVerifier};
    use realtime_config::RealtimeConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_delivery_without_bridge() {
        let config = RealtimeConfig::default();
        let manager = Arc::new(ClientManager::new(
            &config,
            Arc::new(StaticTokenVerifier::default()),
            Arc::new(AllowAllWalletAccess),
        ));
        let bridge = Arc::new(EventBridge::new(&config.bridge));
        let broadcaster = EventBroadcaster::new(manager.clone(), bridge.clone());

        let opened = manager.open_connection();
        manager.subscribe(&opened.connection, "blocks").await.unwrap();

        assert_eq!(broadcaster.broadcast_block(json!({"height": 1})), 1);
        assert_eq!(broadcaster.broadcast_mempool(json!({})), 0);
        assert_eq!(bridge.stats().published, 0);
        assert_eq!(opened.connection.queue_len(), 1);
    }
}
