//! # Subscription Registry - Channel ↔ Connection Index
//!
//! Bidirectional index between connections and the channels they listen on:
//!
//! ```text
//! by_connection: ConnectionId -> {channel, ...}
//! by_channel:    channel      -> {ConnectionId, ...}
//! ```
//!
//! Both directions live behind one lock so every mutation keeps them
//! symmetric. A channel exists only while it has at least one subscriber;
//! the last unsubscribe prunes it. Removing a connection walks only that
//! connection's own channel set.
//!
//! Admission rules that need collaborators (wallet access) are applied by
//! the caller before [`SubscriptionRegistry::subscribe`]; the registry itself
//! enforces the per-connection ceiling and refuses unknown connections.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::connection::ConnectionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("subscription limit of {limit} reached")]
    LimitExceeded { limit: usize },

    #[error("connection is not registered")]
    UnknownConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadySubscribed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel: String,
    pub subscribers: usize,
}

#[derive(Default)]
struct Indices {
    by_connection: HashMap<ConnectionId, HashSet<String>>,
    by_channel: HashMap<String, HashSet<ConnectionId>>,
}

/// Registry for channel-based message routing
pub struct SubscriptionRegistry {
    indices: RwLock<Indices>,
    max_per_connection: usize,
}

impl SubscriptionRegistry {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            max_per_connection,
        }
    }

    pub fn max_per_connection(&self) -> usize {
        self.max_per_connection
    }

    /// Make a connection eligible for subscriptions
    pub fn register_connection(&self, connection_id: ConnectionId) {
        self.indices
            .write()
            .by_connection
            .entry(connection_id)
            .or_default();
    }

    /// Subscribe a connection to a channel
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        channel: &str,
    ) -> Result<SubscribeOutcome, RegistryError> {
        let mut indices = self.indices.write();
        let Indices {
            by_connection,
            by_channel,
        } = &mut *indices;

        let channels = by_connection
            .get_mut(&connection_id)
            .ok_or(RegistryError::UnknownConnection)?;

        if channels.contains(channel) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        if channels.len() >= self.max_per_connection {
            return Err(RegistryError::LimitExceeded {
                limit: self.max_per_connection,
            });
        }

        channels.insert(channel.to_string());
        by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id);

        debug!("Connection {} subscribed to channel {}", connection_id, channel);
        Ok(SubscribeOutcome::Added)
    }

    /// Unsubscribe a connection from a channel; false if it was not subscribed
    pub fn unsubscribe(&self, connection_id: &ConnectionId, channel: &str) -> bool {
        let mut indices = self.indices.write();
        let Indices {
            by_connection,
            by_channel,
        } = &mut *indices;

        let removed = by_connection
            .get_mut(connection_id)
            .map(|channels| channels.remove(channel))
            .unwrap_or(false);

        if removed {
            Self::detach(by_channel, connection_id, channel);
            debug!("Connection {} unsubscribed from channel {}", connection_id, channel);
        }

        removed
    }

    /// Drop a connection from every channel; returns how many it held
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> usize {
        let mut indices = self.indices.write();
        let Indices {
            by_connection,
            by_channel,
        } = &mut *indices;

        let Some(channels) = by_connection.remove(connection_id) else {
            return 0;
        };

        for channel in &channels {
            Self::detach(by_channel, connection_id, channel);
        }

        channels.len()
    }

    fn detach(
        by_channel: &mut HashMap<String, HashSet<ConnectionId>>,
        connection_id: &ConnectionId,
        channel: &str,
    ) {
        if let Some(subscribers) = by_channel.get_mut(channel) {
            subscribers.remove(connection_id);
            if subscribers.is_empty() {
                by_channel.remove(channel);
            }
        }
    }

    /// Get all subscribers for a channel
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.indices
            .read()
            .by_channel
            .get(channel)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct subscribers across `channels`, each paired with the first
    /// channel (in argument order) it matched
    pub fn subscribers_of_any<'a>(
        &self,
        channels: &'a [String],
    ) -> HashMap<ConnectionId, &'a str> {
        let indices = self.indices.read();
        let mut matched: HashMap<ConnectionId, &'a str> = HashMap::new();

        for channel in channels {
            if let Some(subscribers) = indices.by_channel.get(channel) {
                for id in subscribers {
                    matched.entry(*id).or_insert(channel.as_str());
                }
            }
        }

        matched
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.indices
            .read()
            .by_channel
            .get(channel)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn subscription_count(&self, connection_id: &ConnectionId) -> usize {
        self.indices
            .read()
            .by_connection
            .get(connection_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, connection_id: &ConnectionId, channel: &str) -> bool {
        self.indices
            .read()
            .by_connection
            .get(connection_id)
            .map(|channels| channels.contains(channel))
            .unwrap_or(false)
    }

    pub fn channels_of(&self, connection_id: &ConnectionId) -> Vec<String> {
        self.indices
            .read()
            .by_connection
            .get(connection_id)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All live channels with their subscriber counts, sorted by name
    pub fn channel_info(&self) -> Vec<ChannelInfo> {
        let indices = self.indices.read();
        let mut channels: Vec<ChannelInfo> = indices
            .by_channel
            .iter()
            .map(|(channel, subscribers)| ChannelInfo {
                channel: channel.clone(),
                subscribers: subscribers.len(),
            })
            .collect();
        channels.sort_by(|a, b| a.channel.cmp(&b.channel));
        channels
    }

    pub fn channel_count(&self) -> usize {
        self.indices.read().by_channel.len()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.indices
            .read()
            .by_connection
            .values()
            .map(HashSet::len)
            .sum()
    }

    /// Both directions agree and no channel is empty
    pub fn is_consistent(&self) -> bool {
        let indices = self.indices.read();

        let forward_ok = indices.by_connection.iter().all(|(id, channels)| {
            channels.len() <= self.max_per_connection
                && channels.iter().all(|channel| {
                    indices
                        .by_channel
                        .get(channel)
                        .map(|subscribers| subscribers.contains(id))
                        .unwrap_or(false)
                })
        });

        let reverse_ok = indices.by_channel.iter().all(|(channel, subscribers)| {
            !subscribers.is_empty()
                && subscribers.iter().all(|id| {
                    indices
                        .by_connection
                        .get(id)
                        .map(|channels| channels.contains(channel))
                        .unwrap_or(false)
                })
        });

        forward_ok && reverse_ok
    }
}
