//! Message broker consumer surface.
//!
//! A realtime fetch stage subscribes to one topic and receives already
//! decoded [`StockAggregate`] events. A frame that fails to decode is reported
//! as [`BrokerError::Decode`] and the consumer moves on to the next one.
//!
//! [`MemoryConsumer`] is an in-process consumer fed through a [`MemoryFeed`];
//! frames are JSON-encoded aggregates tagged with a topic.

use std::time::Duration;

use async_trait::async_trait;
use tf_core::StockAggregate;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    /// A frame could not be decoded into a domain event.
    #[error("failed to decode frame on {topic}: {reason}")]
    Decode { topic: String, reason: String },

    /// `recv` was called before `subscribe`.
    #[error("not subscribed")]
    NotSubscribed,

    /// The health probe got no answer before the deadline.
    #[error("no response before deadline")]
    DeadlineExceeded,

    /// The connection to the broker failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Consumer side of a broker subscription.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Subscribe to `topic`. Subsequent `recv` calls yield its events.
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Next event. `None` once the feed has ended.
    async fn recv(&mut self) -> Option<Result<StockAggregate, BrokerError>>;

    /// Health probe. Fails with [`BrokerError::DeadlineExceeded`] if the broker
    /// does not answer before `deadline`.
    async fn ping(&self, deadline: Instant) -> Result<(), BrokerError>;
}

/// One raw frame on the in-memory feed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Producer handle for a [`MemoryConsumer`]. Dropping every handle ends the feed.
#[derive(Debug, Clone)]
pub struct MemoryFeed {
    tx: mpsc::Sender<Frame>,
}

impl MemoryFeed {
    /// Publish a raw frame.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        self.tx
            .send(Frame {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .await
            .map_err(|_| BrokerError::Transport("consumer dropped".to_string()))
    }

    /// Publish an aggregate encoded as JSON.
    pub async fn publish_aggregate(&self, topic: &str, agg: &StockAggregate) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(agg).map_err(|e| BrokerError::Transport(e.to_string()))?;
        self.publish(topic, payload).await
    }
}

/// In-process [`EventConsumer`].
#[derive(Debug)]
pub struct MemoryConsumer {
    rx: mpsc::Receiver<Frame>,
    topic: Option<String>,
    ping_latency: Duration,
}

impl MemoryConsumer {
    /// Create a connected feed / consumer pair.
    pub fn channel(capacity: usize) -> (MemoryFeed, MemoryConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            MemoryFeed { tx },
            MemoryConsumer {
                rx,
                topic: None,
                ping_latency: Duration::ZERO,
            },
        )
    }

    /// Simulate a broker that takes `latency` to answer health probes.
    pub fn with_ping_latency(mut self, latency: Duration) -> Self {
        self.ping_latency = latency;
        self
    }
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<StockAggregate, BrokerError>> {
        let Some(topic) = self.topic.clone() else {
            return Some(Err(BrokerError::NotSubscribed));
        };
        loop {
            let frame = self.rx.recv().await?;
            if frame.topic != topic {
                debug!("skipping frame for unsubscribed topic {}", frame.topic);
                continue;
            }
            return Some(serde_json::from_slice(&frame.payload).map_err(|e| BrokerError::Decode {
                topic: frame.topic,
                reason: e.to_string(),
            }));
        }
    }

    async fn ping(&self, deadline: Instant) -> Result<(), BrokerError> {
        tokio::time::timeout_at(deadline, tokio::time::sleep(self.ping_latency))
            .await
            .map_err(|_| BrokerError::DeadlineExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(open_time: i64) -> StockAggregate {
        StockAggregate {
            open_time,
            closed_time: open_time + 60,
            open: 1.0,
            closed: 2.0,
            high: 3.0,
            low: 0.5,
            volume: 10.0,
        }
    }

    #[tokio::test]
    async fn recv_requires_subscription() {
        let (_feed, mut consumer) = MemoryConsumer::channel(4);
        assert_eq!(consumer.recv().await, Some(Err(BrokerError::NotSubscribed)));
    }

    #[tokio::test]
    async fn decodes_filters_and_ends() {
        let (feed, mut consumer) = MemoryConsumer::channel(8);
        consumer.subscribe("aapl").await.unwrap();

        feed.publish_aggregate("msft", &agg(0)).await.unwrap();
        feed.publish_aggregate("aapl", &agg(60)).await.unwrap();
        feed.publish("aapl", "not json").await.unwrap();
        drop(feed);

        assert_eq!(consumer.recv().await, Some(Ok(agg(60))));
        assert!(matches!(consumer.recv().await, Some(Err(BrokerError::Decode { .. }))));
        assert_eq!(consumer.recv().await, None);
    }

    #[tokio::test]
    async fn ping_respects_deadline() {
        let (_feed, consumer) = MemoryConsumer::channel(1);
        consumer.ping(Instant::now() + Duration::from_secs(1)).await.unwrap();

        let slow = consumer.with_ping_latency(Duration::from_millis(200));
        let err = slow.ping(Instant::now() + Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, BrokerError::DeadlineExceeded);
    }
}
