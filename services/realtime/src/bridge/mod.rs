//! # Cross-Instance Bridge
//!
//! Keeps broadcasts consistent when several server processes sit behind one
//! load balancer. Every process publishes the events it raises to a shared
//! pub/sub medium and replays events published by the others into its own
//! local broadcast path:
//!
//! ```text
//! process A: broadcast(ev) ──publish──> [medium] ──> process B: broadcast_local(ev)
//!            └─ broadcast_local(ev)         └──────> process A: own id, skipped
//! ```
//!
//! The medium is injected ([`PubSubMedium`]), so tests run several bridges
//! over an in-process [`MemoryMedium`] while deployments use a
//! [`RelaySocketMedium`] against a [`RelayHub`]. A medium that cannot be
//! reached at startup leaves the bridge disabled; local delivery is never
//! affected.

mod memory;
mod relay;

pub use memory::MemoryMedium;
pub use relay::{
    decode_frame_header, encode_frame, read_frame, RelayFrame, RelayHub, RelaySocketMedium,
    PUBLISH_ONLY_CHANNEL,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use realtime_config::BridgeSettings;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::now_millis;
use crate::router::DomainEvent;

/// Anything that can deliver an event to this process's own clients
pub trait LocalBroadcast: Send + Sync + 'static {
    /// Returns how many connections the event was queued for
    fn broadcast_local(&self, event: &DomainEvent) -> usize;
}

/// Wire form of a bridged event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEnvelope {
    pub event: DomainEvent,
    pub origin_instance_id: String,
    pub timestamp: i64,
}

/// Sending half of a medium connection
#[async_trait]
pub trait MediumPublisher: Send {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> BridgeResult<()>;
}

/// A shared pub/sub medium
///
/// Publishing and subscribing use separate connections.
#[async_trait]
pub trait PubSubMedium: Send + Sync {
    async fn publisher(&self) -> BridgeResult<Box<dyn MediumPublisher>>;

    /// Payloads published on `channel` by anyone, including this process
    async fn subscriber(&self, channel: &str) -> BridgeResult<mpsc::Receiver<Vec<u8>>>;
}

#[derive(Debug, Default)]
struct BridgeCounters {
    published: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    self_skipped: AtomicU64,
}

impl BridgeCounters {
    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("realtime_bridge_errors_total").increment(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    pub instance_id: String,
    /// Connected and still receiving from the medium
    pub enabled: bool,
    /// Initialized, even if the subscription has since ended
    pub initialized: bool,
    pub published: u64,
    pub received: u64,
    pub errors: u64,
    pub self_skipped: u64,
}

struct Running {
    publish_tx: mpsc::Sender<Vec<u8>>,
    subscribed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct EventBridge {
    instance_id: String,
    channel: String,
    connect_timeout: Duration,
    publish_buffer: usize,
    running: Mutex<Option<Running>>,
    counters: Arc<BridgeCounters>,
}

impl EventBridge {
    pub fn new(settings: &BridgeSettings) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            channel: settings.channel.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            publish_buffer: settings.publish_buffer.max(1),
            running: Mutex::new(None),
            counters: Arc::new(BridgeCounters::default()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Connected and still receiving from the medium
    pub fn is_enabled(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |running| running.subscribed.load(Ordering::Acquire))
    }

    /// Connect to `medium` and start relaying into `local`
    ///
    /// Returns false, leaving the bridge disabled, if either connection
    /// cannot be established in time.
    pub async fn initialize(
        &self,
        medium: Arc<dyn PubSubMedium>,
        local: Arc<dyn LocalBroadcast>,
    ) -> bool {
        match self.connect(medium, local).await {
            Ok(running) => {
                if let Some(previous) = self.running.lock().replace(running) {
                    previous.tasks.iter().for_each(JoinHandle::abort);
                }
                info!(
                    instance_id = %self.instance_id,
                    channel = %self.channel,
                    "Event bridge initialized"
                );
                true
            }
            Err(e) => {
                self.counters.error();
                warn!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "Event bridge unavailable, continuing with local-only broadcast"
                );
                false
            }
        }
    }

    async fn connect(
        &self,
        medium: Arc<dyn PubSubMedium>,
        local: Arc<dyn LocalBroadcast>,
    ) -> BridgeResult<Running> {
        let timeout_ms = self.connect_timeout.as_millis() as u64;

        let mut publisher = tokio::time::timeout(self.connect_timeout, medium.publisher())
            .await
            .map_err(|_| BridgeError::Timeout(timeout_ms))??;
        let mut subscription =
            tokio::time::timeout(self.connect_timeout, medium.subscriber(&self.channel))
                .await
                .map_err(|_| BridgeError::Timeout(timeout_ms))??;

        let (publish_tx, mut publish_rx) = mpsc::channel::<Vec<u8>>(self.publish_buffer);

        let publish_task = {
            let channel = self.channel.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                while let Some(payload) = publish_rx.recv().await {
                    match publisher.publish(&channel, &payload).await {
                        Ok(()) => {
                            counters.published.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("realtime_bridge_published_total").increment(1);
                        }
                        Err(e) => {
                            counters.error();
                            warn!(error = %e, "Bridge publish failed");
                        }
                    }
                }
                debug!("Bridge publisher stopped");
            })
        };

        let subscribed = Arc::new(AtomicBool::new(true));

        let subscribe_task = {
            let instance_id = self.instance_id.clone();
            let counters = self.counters.clone();
            let subscribed = subscribed.clone();
            tokio::spawn(async move {
                while let Some(payload) = subscription.recv().await {
                    let envelope: BridgeEnvelope = match serde_json::from_slice(&payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            counters.error();
                            warn!(error = %e, "Discarding malformed bridge envelope");
                            continue;
                        }
                    };

                    if envelope.origin_instance_id == instance_id {
                        counters.self_skipped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    counters.received.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("realtime_bridge_received_total").increment(1);
                    let delivered = local.broadcast_local(&envelope.event);
                    debug!(
                        origin = %envelope.origin_instance_id,
                        event = envelope.event.event_type(),
                        delivered,
                        "Replayed bridged event"
                    );
                }
                subscribed.store(false, Ordering::Release);
                counters.error();
                error!("Bridge subscription closed, remote events will not be delivered");
            })
        };

        Ok(Running {
            publish_tx,
            subscribed,
            tasks: vec![publish_task, subscribe_task],
        })
    }

    /// Hand `event` to the medium; a no-op while disabled
    ///
    /// Never waits: a full publish buffer counts as an error and the event
    /// is still delivered locally by the caller.
    pub fn publish(&self, event: &DomainEvent) -> bool {
        let publish_tx = match self.running.lock().as_ref() {
            Some(running) => running.publish_tx.clone(),
            None => return false,
        };

        let envelope = BridgeEnvelope {
            event: event.clone(),
            origin_instance_id: self.instance_id.clone(),
            timestamp: now_millis(),
        };

        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.error();
                warn!(error = %e, "Failed to serialize bridge envelope");
                return false;
            }
        };

        match publish_tx.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                self.counters.error();
                warn!(error = %e, "Bridge publish buffer unavailable, event stays local");
                false
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            instance_id: self.instance_id.clone(),
            enabled: self.is_enabled(),
            initialized: self.running.lock().is_some(),
            published: self.counters.published.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            self_skipped: self.counters.self_skipped.load(Ordering::Relaxed),
        }
    }

    /// Stop relaying; later publishes become no-ops
    pub fn shutdown(&self) {
        if let Some(running) = self.running.lock().take() {
            running.tasks.iter().for_each(JoinHandle::abort);
            info!(instance_id = %self.instance_id, "Event bridge shut down");
        }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
