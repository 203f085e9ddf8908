//! Service defaults and well-known values
//!
//! Default limits, timeouts and close codes used by the realtime push
//! service. Anything here can be overridden through [`crate::RealtimeConfig`];
//! the constants only describe what an empty configuration resolves to.

/// Realtime WebSocket service defaults
pub mod realtime {
    /// Global ceiling on simultaneously open WebSocket connections
    pub const MAX_CONNECTIONS: usize = 10_000;

    /// Ceiling on authenticated connections held by a single user
    pub const MAX_PER_USER: usize = 10;

    /// Steady-state inbound message budget per connection
    pub const MAX_MESSAGES_PER_SECOND: u32 = 30;

    /// Ceiling on channels a single connection may hold
    pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 1_100;

    /// Total inbound messages tolerated during the grace window
    pub const GRACE_PERIOD_MESSAGE_LIMIT: u32 = 500;

    /// Length of the lenient window after connect (milliseconds)
    pub const GRACE_PERIOD_MS: u64 = 5_000;

    /// How long an unauthenticated connection may stay open (milliseconds)
    pub const AUTH_TIMEOUT_MS: u64 = 30_000;

    /// Size of the recent rate-limit event log
    pub const MAX_RATE_LIMIT_EVENTS: usize = 100;

    /// Per-connection outbound queue bound
    pub const MAX_QUEUE_SIZE: usize = 100;

    /// Transport write buffer level at which draining pauses (bytes)
    pub const TRANSPORT_HIGH_WATER_BYTES: usize = 64 * 1024;

    /// Ping sweep interval (milliseconds)
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

    /// Largest inbound frame accepted from a browser client (bytes)
    pub const MAX_INBOUND_FRAME_BYTES: usize = 64 * 1024;
}

/// Cross-instance bridge defaults
pub mod bridge {
    /// Well-known pub/sub channel every instance publishes to
    pub const CHANNEL: &str = "wallet-realtime:events";

    /// Connection establishment timeout for the shared medium (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Envelopes buffered for the publisher task before new ones are dropped
    pub const PUBLISH_BUFFER: usize = 1_024;

    /// Largest relay frame accepted (bytes)
    pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
}

/// WebSocket close codes
pub mod close_codes {
    /// Normal closure
    pub const NORMAL: u16 = 1000;

    /// Server is going away (shutdown)
    pub const GOING_AWAY: u16 = 1001;

    /// Policy violation: rate limits, capacity ceilings, failed authentication
    pub const POLICY_VIOLATION: u16 = 1008;

    /// Unexpected server-side or transport error
    pub const INTERNAL_ERROR: u16 = 1011;

    /// No authentication arrived before the deadline
    pub const AUTH_TIMEOUT: u16 = 4001;

    /// Outbound queue overflowed under the `disconnect` policy
    pub const QUEUE_OVERFLOW: u16 = 4009;
}
