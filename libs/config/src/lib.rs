//! # Realtime Centralized Configuration
//!
//! This crate provides centralized configuration management and defaults
//! for the realtime push service, so the service and its tests agree on a
//! single set of limits.
//!
//! ## Features
//!
//! - **Service Defaults**: connection ceilings, rate limits, queue bounds
//! - **Close Codes**: WebSocket close codes shared with clients
//! - **Layered Loading**: defaults, file, `REALTIME_*` environment, legacy names
//!
//! ## Usage
//!
//! ```rust,no_run
//! use realtime_config::{load_config, service::realtime};
//!
//! let config = load_config(None)?;
//! assert!(config.limits.max_per_user <= realtime::MAX_CONNECTIONS);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod service;
pub mod service_config;

// Re-export commonly used types
pub use service::*;
pub use service_config::{
    load_config, BridgeSettings, HeartbeatSettings, LimitSettings, OverflowPolicy,
    QueueSettings, RealtimeConfig, ServerSettings,
};
