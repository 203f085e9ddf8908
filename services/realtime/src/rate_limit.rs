//! Per-connection inbound rate limiting
//!
//! Two regimes, picked by time since connect:
//!
//! ```text
//! connect ──grace_period──> steady state
//!   total messages <= grace limit     messages in current 1s window <= per-second limit
//! ```
//!
//! The grace window lets a fresh client authenticate and fire a large
//! `subscribe_batch` burst without being mistaken for abuse.

use parking_lot::Mutex;
use realtime_config::LimitSettings;
use ringbuffer::{AllocRingBuffer, RingBuffer};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::connection::ConnectionId;

const WINDOW: Duration = Duration::from_millis(1000);

/// Which rule a connection broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachReason {
    GracePeriodExceeded,
    PerSecondExceeded,
    QueueOverflow,
}

impl BreachReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachReason::GracePeriodExceeded => "grace_period_exceeded",
            BreachReason::PerSecondExceeded => "per_second_exceeded",
            BreachReason::QueueOverflow => "queue_overflow",
        }
    }
}

/// Details of a rate-limit breach, reported to the client and the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitBreach {
    pub reason: BreachReason,
    pub count: u64,
    pub limit: u64,
}

impl RateLimitBreach {
    pub fn describe(&self) -> String {
        match self.reason {
            BreachReason::GracePeriodExceeded => format!(
                "Rate limit exceeded: {} messages during connection grace period (max {})",
                self.count, self.limit
            ),
            BreachReason::PerSecondExceeded => format!(
                "Rate limit exceeded: {} messages in one second (max {})",
                self.count, self.limit
            ),
            BreachReason::QueueOverflow => format!(
                "Outbound queue overflow: {} messages pending (max {})",
                self.count, self.limit
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub grace_period: Duration,
    pub grace_limit: u32,
    pub per_second: u32,
}

impl From<&LimitSettings> for RatePolicy {
    fn from(limits: &LimitSettings) -> Self {
        Self {
            grace_period: Duration::from_millis(limits.grace_period_ms),
            grace_limit: limits.grace_period_message_limit,
            per_second: limits.max_messages_per_second,
        }
    }
}

/// Counters for one connection; owned by that connection's reader loop
#[derive(Debug)]
pub struct RateLimiter {
    policy: RatePolicy,
    connected_at: Instant,
    total_messages: u64,
    window_started: Instant,
    window_messages: u32,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy, connected_at: Instant) -> Self {
        Self {
            policy,
            connected_at,
            total_messages: 0,
            window_started: connected_at,
            window_messages: 0,
        }
    }

    /// Account for one inbound message received at `now`
    pub fn check(&mut self, now: Instant) -> Result<(), RateLimitBreach> {
        self.total_messages += 1;

        if now.saturating_duration_since(self.connected_at) < self.policy.grace_period {
            if self.total_messages > u64::from(self.policy.grace_limit) {
                return Err(RateLimitBreach {
                    reason: BreachReason::GracePeriodExceeded,
                    count: self.total_messages,
                    limit: u64::from(self.policy.grace_limit),
                });
            }
            return Ok(());
        }

        if now.saturating_duration_since(self.window_started) >= WINDOW {
            self.window_started = now;
            self.window_messages = 0;
        }

        self.window_messages += 1;
        if self.window_messages > self.policy.per_second {
            return Err(RateLimitBreach {
                reason: BreachReason::PerSecondExceeded,
                count: u64::from(self.window_messages),
                limit: u64::from(self.policy.per_second),
            });
        }

        Ok(())
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }
}

/// One entry of the recent rate-limit log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEvent {
    pub timestamp: i64,
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    pub reason: BreachReason,
    pub count: u64,
    pub limit: u64,
}

/// Fixed-capacity log of the most recent breaches
pub struct RateLimitEventLog {
    events: Mutex<AllocRingBuffer<RateLimitEvent>>,
}

impl RateLimitEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(AllocRingBuffer::new(capacity.max(1))),
        }
    }

    pub fn record(&self, event: RateLimitEvent) {
        metrics::counter!("realtime_rate_limit_hits_total", "reason" => event.reason.as_str())
            .increment(1);
        self.events.lock().push(event);
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<RateLimitEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn policy() -> RatePolicy {
        RatePolicy {
            grace_period: Duration::from_millis(5000),
            grace_limit: 500,
            per_second: 30,
        }
    }

    #[test]
    fn test_grace_period_boundary() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(policy(), start);
        let during_grace = start + Duration::from_millis(100);

        for _ in 0..500 {
            assert!(limiter.check(during_grace).is_ok());
        }

        let breach = limiter.check(during_grace).unwrap_err();
        assert_eq!(breach.reason, BreachReason::GracePeriodExceeded);
        assert_eq!(breach.count, 501);
        assert_eq!(breach.limit, 500);
    }

    #[test]
    fn test_steady_state_per_second_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(policy(), start);
        let steady = start + Duration::from_secs(6);

        for _ in 0..30 {
            assert!(limiter.check(steady).is_ok());
        }
        let breach = limiter.check(steady).unwrap_err();
        assert_eq!(breach.reason, BreachReason::PerSecondExceeded);
        assert_eq!(breach.limit, 30);
    }

    #[test]
    fn test_window_resets_after_one_second() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(policy(), start);
        let steady = start + Duration::from_secs(6);

        for _ in 0..30 {
            assert!(limiter.check(steady).is_ok());
        }
        let next_window = steady + Duration::from_millis(1000);
        for _ in 0..30 {
            assert!(limiter.check(next_window).is_ok());
        }
        assert_eq!(limiter.total_messages(), 60);
    }

    #[test]
    fn test_burst_in_grace_does_not_count_against_steady_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(policy(), start);

        for _ in 0..400 {
            assert!(limiter.check(start + Duration::from_millis(4900)).is_ok());
        }
        // First steady-state message opens a fresh window
        assert!(limiter.check(start + Duration::from_millis(5100)).is_ok());
    }

    #[test]
    fn test_event_log_is_bounded() {
        let log = RateLimitEventLog::new(3);
        for i in 0..5u64 {
            log.record(RateLimitEvent {
                timestamp: i as i64,
                connection_id: Uuid::new_v4(),
                user_id: None,
                reason: BreachReason::PerSecondExceeded,
                count: 31 + i,
                limit: 30,
            });
        }

        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].count, 33);
        assert_eq!(recent[2].count, 35);
    }
}
