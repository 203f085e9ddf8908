//! Outbound queue and transport drain
//!
//! Every connection owns one bounded FIFO of serialized frames. Producers
//! (broadcasts, replies) push into it from any task; a single writer task per
//! connection drains it into the transport. The bound is enforced before
//! insertion according to the configured [`OverflowPolicy`].
//!
//! Draining only takes a message off the head once the transport reports it
//! can accept another frame, so a stalled peer leaves the backlog in the
//! queue (where the overflow policy applies) instead of in an unbounded
//! transport buffer. Buffered bytes are flushed whenever they reach the
//! high-water mark, suspending the writer until the transport has drained.

use futures_util::future::poll_fn;
use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use realtime_config::OverflowPolicy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A frame handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    Ping,
    Close { code: u16, reason: String },
}

/// Result of a single enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended; the queue had room
    Queued,
    /// Appended after evicting the oldest message
    DroppedOldest,
    /// The incoming message was discarded
    DroppedNewest,
    /// Queue full under the `disconnect` policy; nothing was inserted
    Overflow,
}

impl EnqueueOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued | EnqueueOutcome::DroppedOldest)
    }
}

/// Bounded FIFO for one connection
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Arc<str>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
            dropped: 0,
        }
    }

    pub fn push(&mut self, message: Arc<str>) -> EnqueueOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(message);
            return EnqueueOutcome::Queued;
        }

        match self.policy {
            OverflowPolicy::DropOldest => {
                self.items.pop_front();
                self.dropped += 1;
                self.items.push_back(message);
                EnqueueOutcome::DroppedOldest
            }
            OverflowPolicy::DropNewest => {
                self.dropped += 1;
                EnqueueOutcome::DroppedNewest
            }
            OverflowPolicy::Disconnect => EnqueueOutcome::Overflow,
        }
    }

    pub fn pop_front(&mut self) -> Option<Arc<str>> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let discarded = self.items.len();
        self.items.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Process-wide queue counters, shared by every connection's outbox
#[derive(Debug, Default)]
pub struct QueueStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    overflow_disconnects: AtomicU64,
}

impl QueueStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn overflow_disconnects(&self) -> u64 {
        self.overflow_disconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn record_overflow_disconnect(&self) {
        self.overflow_disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

/// A connection's queue plus the signal that wakes its writer
pub struct Outbox {
    queue: Mutex<OutboundQueue>,
    ready: Notify,
    stats: Arc<QueueStats>,
}

impl Outbox {
    pub fn new(capacity: usize, policy: OverflowPolicy, stats: Arc<QueueStats>) -> Self {
        Self {
            queue: Mutex::new(OutboundQueue::new(capacity, policy)),
            ready: Notify::new(),
            stats,
        }
    }

    /// Apply the overflow policy, insert if allowed, and wake the writer
    pub fn enqueue(&self, message: Arc<str>) -> EnqueueOutcome {
        let outcome = self.queue.lock().push(message);

        match outcome {
            EnqueueOutcome::DroppedOldest | EnqueueOutcome::DroppedNewest => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("realtime_messages_dropped_total").increment(1);
            }
            EnqueueOutcome::Queued | EnqueueOutcome::Overflow => {}
        }

        if outcome.inserted() {
            self.ready.notify_one();
        }

        outcome
    }

    /// Wait until something has been enqueued since the last wake-up
    pub async fn ready(&self) {
        self.ready.notified().await
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.lock().dropped()
    }

    /// Discard everything still pending; returns how many were discarded
    pub fn discard(&self) -> usize {
        self.queue.lock().clear()
    }

    /// Move queued messages into `sink` in order until the queue is empty
    ///
    /// Stops immediately, leaving the remainder unsent, once `is_open`
    /// reports the connection is going away.
    pub async fn drain_into<S>(
        &self,
        sink: &mut S,
        high_water_bytes: usize,
        is_open: impl Fn() -> bool,
    ) -> Result<usize, S::Error>
    where
        S: Sink<Frame> + Unpin,
    {
        let mut buffered_bytes = 0usize;
        let mut sent = 0usize;

        loop {
            if !is_open() {
                return Ok(sent);
            }

            // Wait for transport capacity before taking the head off the queue
            poll_fn(|cx| sink.poll_ready_unpin(cx)).await?;

            if !is_open() {
                return Ok(sent);
            }

            let next = self.queue.lock().pop_front();
            let Some(message) = next else {
                break;
            };

            buffered_bytes += message.len();
            sink.start_send_unpin(Frame::Text(message))?;
            sent += 1;
            self.stats.sent.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("realtime_messages_sent_total").increment(1);

            if buffered_bytes >= high_water_bytes {
                sink.flush().await?;
                buffered_bytes = 0;
            }
        }

        if buffered_bytes > 0 {
            sink.flush().await?;
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn msg(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn test_drop_oldest_keeps_bound_and_order() {
        let mut queue = OutboundQueue::new(3, OverflowPolicy::DropOldest);
        for i in 0..5 {
            queue.push(msg(&i.to_string()));
            assert!(queue.len() <= 3);
        }

        assert_eq!(queue.dropped(), 2);
        let drained: Vec<String> = std::iter::from_fn(|| queue.pop_front())
            .map(|m| m.to_string())
            .collect();
        assert_eq!(drained, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_drop_newest_discards_incoming() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropNewest);
        assert_eq!(queue.push(msg("a")), EnqueueOutcome::Queued);
        assert_eq!(queue.push(msg("b")), EnqueueOutcome::Queued);
        assert_eq!(queue.push(msg("c")), EnqueueOutcome::DroppedNewest);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop_front().as_deref(), Some("a"));
        assert_eq!(queue.pop_front().as_deref(), Some("b"));
    }

    #[test]
    fn test_disconnect_policy_never_inserts_past_bound() {
        let mut queue = OutboundQueue::new(1, OverflowPolicy::Disconnect);
        assert_eq!(queue.push(msg("a")), EnqueueOutcome::Queued);
        assert_eq!(queue.push(msg("b")), EnqueueOutcome::Overflow);
        assert_eq!(queue.len(), 1);
        // Overflow under disconnect is not a silent drop
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_outbox_counts_global_drops() {
        let stats = Arc::new(QueueStats::default());
        let a = Outbox::new(1, OverflowPolicy::DropOldest, stats.clone());
        let b = Outbox::new(1, OverflowPolicy::DropNewest, stats.clone());

        a.enqueue(msg("1"));
        a.enqueue(msg("2"));
        b.enqueue(msg("1"));
        b.enqueue(msg("2"));

        assert_eq!(stats.dropped(), 2);
        assert_eq!(a.dropped(), 1);
        assert_eq!(b.dropped(), 1);
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let stats = Arc::new(QueueStats::default());
        let outbox = Outbox::new(10, OverflowPolicy::DropOldest, stats.clone());
        for i in 0..5 {
            outbox.enqueue(msg(&format!("m{}", i)));
        }

        let (mut tx, rx) = futures::channel::mpsc::channel::<Frame>(16);
        let sent = outbox.drain_into(&mut tx, 64 * 1024, || true).await.unwrap();
        assert_eq!(sent, 5);
        drop(tx);

        let frames: Vec<Frame> = rx.collect().await;
        let expected: Vec<Frame> = (0..5)
            .map(|i| Frame::Text(msg(&format!("m{}", i))))
            .collect();
        assert_eq!(frames, expected);
        assert_eq!(stats.sent(), 5);
    }

    #[tokio::test]
    async fn test_drain_suspends_on_backpressure_and_resumes() {
        let stats = Arc::new(QueueStats::default());
        let outbox = Arc::new(Outbox::new(10, OverflowPolicy::DropOldest, stats));
        for i in 0..6 {
            outbox.enqueue(msg(&format!("m{}", i)));
        }

        // Zero-buffer channel: each send blocks until the reader takes a frame
        let (mut tx, mut rx) = futures::channel::mpsc::channel::<Frame>(0);
        let drainer = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.drain_into(&mut tx, 1, || true).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Writer is blocked, most of the backlog is still queued
        assert!(outbox.len() >= 4);

        let mut received = Vec::new();
        while received.len() < 6 {
            match rx.next().await {
                Some(Frame::Text(text)) => received.push(text.to_string()),
                other => panic!("unexpected frame {:?}", other),
            }
        }

        assert_eq!(drainer.await.unwrap().unwrap(), 6);
        assert_eq!(received, vec!["m0", "m1", "m2", "m3", "m4", "m5"]);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_drain_stops_when_connection_closes() {
        let stats = Arc::new(QueueStats::default());
        let outbox = Outbox::new(10, OverflowPolicy::DropOldest, stats);
        for i in 0..3 {
            outbox.enqueue(msg(&i.to_string()));
        }

        let (mut tx, _rx) = futures::channel::mpsc::channel::<Frame>(16);
        let sent = outbox.drain_into(&mut tx, 1024, || false).await.unwrap();
        assert_eq!(sent, 0);
        assert_eq!(outbox.len(), 3);
    }
}
