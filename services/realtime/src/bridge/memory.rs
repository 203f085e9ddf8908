//! In-process medium shared by every bridge holding a clone

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{MediumPublisher, PubSubMedium};
use crate::error::BridgeResult;

type Published = (Arc<str>, Arc<Vec<u8>>);

#[derive(Clone)]
pub struct MemoryMedium {
    tx: broadcast::Sender<Published>,
    capacity: usize,
}

impl MemoryMedium {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct MemoryPublisher {
    tx: broadcast::Sender<Published>,
}

#[async_trait]
impl MediumPublisher for MemoryPublisher {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> BridgeResult<()> {
        // No subscribers is not an error
        let _ = self.tx.send((Arc::from(channel), Arc::new(payload.to_vec())));
        Ok(())
    }
}

#[async_trait]
impl PubSubMedium for MemoryMedium {
    async fn publisher(&self) -> BridgeResult<Box<dyn MediumPublisher>> {
        Ok(Box::new(MemoryPublisher {
            tx: self.tx.clone(),
        }))
    }

    async fn subscriber(&self, channel: &str) -> BridgeResult<mpsc::Receiver<Vec<u8>>> {
        let mut rx = self.tx.subscribe();
        let (tx, out) = mpsc::channel(self.capacity);
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((published_on, payload)) => {
                        if *published_on != *channel {
                            continue;
                        }
                        if tx.send(payload.as_ref().clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory medium subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_filtering() {
        let medium = MemoryMedium::new(16);
        let mut events = medium.subscriber("events").await.unwrap();
        let mut publisher = medium.publisher().await.unwrap();

        publisher.publish("other", b"ignored").await.unwrap();
        publisher.publish("events", b"kept").await.unwrap();

        assert_eq!(events.recv().await.unwrap(), b"kept".to_vec());
    }
}
