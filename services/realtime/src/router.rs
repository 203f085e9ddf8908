//! Event → channel routing
//!
//! Pure mapping from a [`DomainEvent`] to the channel names whose subscribers
//! should see it. Deduplication by connection happens at delivery time, not
//! here: one event may legitimately resolve to several channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A business-level occurrence to broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    Transaction {
        wallet_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address_id: Option<String>,
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Balance {
        wallet_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address_id: Option<String>,
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Confirmation {
        wallet_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address_id: Option<String>,
        data: Value,
    },
    Block {
        data: Value,
    },
    NewBlock {
        data: Value,
    },
    Mempool {
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Sync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        data: Value,
    },
    ModelDownload {
        data: Value,
    },
}

impl DomainEvent {
    /// Name carried in the `event` field of outbound frames
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::Transaction { .. } => "transaction",
            DomainEvent::Balance { .. } => "balance",
            DomainEvent::Confirmation { .. } => "confirmation",
            DomainEvent::Block { .. } => "block",
            DomainEvent::NewBlock { .. } => "newBlock",
            DomainEvent::Mempool { .. } => "mempool",
            DomainEvent::Sync { .. } => "sync",
            DomainEvent::Log { .. } => "log",
            DomainEvent::ModelDownload { .. } => "modelDownload",
        }
    }

    pub fn data(&self) -> &Value {
        match self {
            DomainEvent::Transaction { data, .. }
            | DomainEvent::Balance { data, .. }
            | DomainEvent::Confirmation { data, .. }
            | DomainEvent::Block { data }
            | DomainEvent::NewBlock { data }
            | DomainEvent::Mempool { data }
            | DomainEvent::Sync { data, .. }
            | DomainEvent::Log { data, .. }
            | DomainEvent::ModelDownload { data } => data,
        }
    }

    pub fn wallet_id(&self) -> Option<&str> {
        match self {
            DomainEvent::Transaction { wallet_id, .. }
            | DomainEvent::Balance { wallet_id, .. }
            | DomainEvent::Confirmation { wallet_id, .. } => Some(wallet_id),
            DomainEvent::Sync { wallet_id, .. } | DomainEvent::Log { wallet_id, .. } => {
                wallet_id.as_deref()
            }
            DomainEvent::Block { .. }
            | DomainEvent::NewBlock { .. }
            | DomainEvent::Mempool { .. }
            | DomainEvent::ModelDownload { .. } => None,
        }
    }
}

/// Channels whose subscribers receive `event`, most specific last
pub fn channels_for(event: &DomainEvent) -> Vec<String> {
    let mut channels = Vec::with_capacity(4);

    match event {
        DomainEvent::Block { .. } | DomainEvent::NewBlock { .. } => {
            channels.push("blocks".to_string());
        }
        DomainEvent::Mempool { .. } => channels.push("mempool".to_string()),
        DomainEvent::Sync { .. } => channels.push("sync:all".to_string()),
        DomainEvent::Log { .. } => channels.push("logs:all".to_string()),
        DomainEvent::ModelDownload { .. } => channels.push("system".to_string()),
        DomainEvent::Transaction { address_id, .. }
        | DomainEvent::Balance { address_id, .. }
        | DomainEvent::Confirmation { address_id, .. } => {
            channels.push("transactions:all".to_string());
            if let Some(address_id) = address_id {
                channels.push(format!("address:{}", address_id));
            }
        }
    }

    if let Some(wallet_id) = event.wallet_id() {
        channels.push(format!("wallet:{}", wallet_id));
        channels.push(format!("wallet:{}:{}", wallet_id, event.event_type()));
    }

    channels
}

/// Wallet id named by a `wallet:<id>[:<suffix>]` channel
pub fn wallet_id_of(channel: &str) -> Option<&str> {
    let rest = channel.strip_prefix("wallet:")?;
    let wallet_id = rest.split(':').next().unwrap_or(rest);
    if wallet_id.is_empty() {
        None
    } else {
        Some(wallet_id)
    }
}

/// Channel used for targeted per-user delivery
pub fn user_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}
