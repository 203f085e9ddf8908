//! Service Configuration Module
//!
//! Layered configuration for the realtime push service. Values are resolved
//! in order: built-in defaults, an optional TOML/JSON file, `REALTIME_*`
//! environment variables (nested with `__`), then the flat legacy variable
//! names older deployments already export.

use crate::service::{bridge, realtime};
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// What to do when a connection's outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the head of the queue, then append the new message
    #[default]
    DropOldest,
    /// Discard the incoming message
    DropNewest,
    /// Close the connection with the queue-overflow code
    Disconnect,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::DropOldest => "drop_oldest",
            OverflowPolicy::DropNewest => "drop_newest",
            OverflowPolicy::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "drop_newest" => Ok(OverflowPolicy::DropNewest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(format!("unknown overflow policy '{}'", other)),
        }
    }
}

/// HTTP/WebSocket listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3002,
            enable_cors: true,
        }
    }
}

/// Connection, rate and subscription ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_connections: usize,
    pub max_per_user: usize,
    pub max_messages_per_second: u32,
    pub max_subscriptions_per_connection: usize,
    pub grace_period_message_limit: u32,
    pub grace_period_ms: u64,
    pub auth_timeout_ms: u64,
    pub max_rate_limit_events: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_connections: realtime::MAX_CONNECTIONS,
            max_per_user: realtime::MAX_PER_USER,
            max_messages_per_second: realtime::MAX_MESSAGES_PER_SECOND,
            max_subscriptions_per_connection: realtime::MAX_SUBSCRIPTIONS_PER_CONNECTION,
            grace_period_message_limit: realtime::GRACE_PERIOD_MESSAGE_LIMIT,
            grace_period_ms: realtime::GRACE_PERIOD_MS,
            auth_timeout_ms: realtime::AUTH_TIMEOUT_MS,
            max_rate_limit_events: realtime::MAX_RATE_LIMIT_EVENTS,
        }
    }
}

/// Outbound queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_queue_size: usize,
    pub overflow_policy: OverflowPolicy,
    pub transport_high_water_bytes: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: realtime::MAX_QUEUE_SIZE,
            overflow_policy: OverflowPolicy::default(),
            transport_high_water_bytes: realtime::TRANSPORT_HIGH_WATER_BYTES,
        }
    }
}

/// Dead-peer detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: realtime::HEARTBEAT_INTERVAL_MS,
        }
    }
}

/// Cross-instance bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub enabled: bool,
    pub relay_socket_path: Option<PathBuf>,
    pub channel: String,
    pub connect_timeout_ms: u64,
    pub publish_buffer: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_socket_path: None,
            channel: bridge::CHANNEL.to_string(),
            connect_timeout_ms: bridge::CONNECT_TIMEOUT_MS,
            publish_buffer: bridge::PUBLISH_BUFFER,
        }
    }
}

/// Main realtime service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeConfig {
    pub server: ServerSettings,
    pub limits: LimitSettings,
    pub queue: QueueSettings,
    pub heartbeat: HeartbeatSettings,
    pub bridge: BridgeSettings,
}

impl RealtimeConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&RealtimeConfig::default())
            .context("Failed to seed configuration defaults")?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            info!("Loading realtime config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("REALTIME")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut realtime: RealtimeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        realtime.apply_legacy_env(|name| std::env::var(name).ok());
        realtime.validate()?;

        debug!("Resolved realtime config: {:?}", realtime);
        Ok(realtime)
    }

    /// Apply the flat variable names (`MAX_WEBSOCKET_CONNECTIONS`, ...)
    ///
    /// Unparsable values are reported and leave the current value in place.
    pub fn apply_legacy_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_into<T: FromStr>(name: &str, raw: Option<String>, slot: &mut T) {
            if let Some(raw) = raw {
                match raw.trim().parse::<T>() {
                    Ok(value) => *slot = value,
                    Err(_) => warn!("Ignoring invalid value for {}: {:?}", name, raw),
                }
            }
        }

        parse_into(
            "MAX_WEBSOCKET_CONNECTIONS",
            lookup("MAX_WEBSOCKET_CONNECTIONS"),
            &mut self.limits.max_connections,
        );
        parse_into(
            "MAX_WEBSOCKET_PER_USER",
            lookup("MAX_WEBSOCKET_PER_USER"),
            &mut self.limits.max_per_user,
        );
        parse_into(
            "MAX_MESSAGES_PER_SECOND",
            lookup("MAX_MESSAGES_PER_SECOND"),
            &mut self.limits.max_messages_per_second,
        );
        parse_into(
            "MAX_SUBSCRIPTIONS_PER_CONNECTION",
            lookup("MAX_SUBSCRIPTIONS_PER_CONNECTION"),
            &mut self.limits.max_subscriptions_per_connection,
        );
        parse_into(
            "WS_GRACE_PERIOD_LIMIT",
            lookup("WS_GRACE_PERIOD_LIMIT"),
            &mut self.limits.grace_period_message_limit,
        );
        parse_into(
            "WS_MAX_QUEUE_SIZE",
            lookup("WS_MAX_QUEUE_SIZE"),
            &mut self.queue.max_queue_size,
        );
        parse_into(
            "WS_QUEUE_OVERFLOW_POLICY",
            lookup("WS_QUEUE_OVERFLOW_POLICY"),
            &mut self.queue.overflow_policy,
        );
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_connections == 0 || limits.max_per_user == 0 {
            bail!("connection limits must be greater than zero");
        }
        if limits.max_messages_per_second == 0 || limits.grace_period_message_limit == 0 {
            bail!("message rate limits must be greater than zero");
        }
        if limits.max_subscriptions_per_connection == 0 {
            bail!("max_subscriptions_per_connection must be greater than zero");
        }
        if limits.max_rate_limit_events == 0 {
            bail!("max_rate_limit_events must be greater than zero");
        }
        if self.queue.max_queue_size == 0 {
            bail!("max_queue_size must be greater than zero");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.bridge.enabled && self.bridge.relay_socket_path.is_none() {
            bail!("bridge is enabled but no relay_socket_path is configured");
        }
        Ok(())
    }
}

/// Convenience function to load configuration with defaults
pub fn load_config(path: Option<&Path>) -> Result<RealtimeConfig> {
    RealtimeConfig::load(path)
}
