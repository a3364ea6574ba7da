//! Realtime fetch stage.
//!
//! Warms up with the most recent stored bars, then follows a broker topic.
//! Sequence numbers continue from the prefetched bars into the live feed.
//!
//! ```text
//! repository ── last `prefetch` bars ──┐
//!                                      ├──► Aggregate packets (seq 0, 1, 2, ...)
//! broker ── ping ── subscribe ── recv ─┘
//! ```
//!
//! Frames that fail to decode are skipped and reported as recoverable faults.
//! Repository and broker failures end the stage with a fatal fault.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tf_core::error::{ConfigError, StageError, StageFault};
use tf_core::options::{StageOptions, keys};
use tf_core::stage::{
    FaultReceiver, FaultSender, PacketReceiver, PacketSender, Stage, StageWorker, fault_stream, send_or_stop,
    stream, until_stopped,
};
use tf_core::stop::StopNotifier;
use tf_core::{Packet, Payload, PayloadKind, StockAggregate};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, EventConsumer};
use crate::past::repository_error;
use crate::repository::StockRepository;
use crate::target::Target;

/// Health probe deadline when `pingTimeoutMs` is not given.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefetches stored bars, then forwards live broker events.
pub struct RealtimeStockFetcher {
    worker: StageWorker,
    target: Target,
    prefetch: usize,
    topic: String,
    ping_timeout: Duration,
    repo: Option<Box<dyn StockRepository>>,
    consumer: Option<Box<dyn EventConsumer>>,
    out_tx: Option<PacketSender>,
    out_rx: Option<PacketReceiver>,
    fault_tx: Option<FaultSender>,
    fault_rx: Option<FaultReceiver>,
}

impl RealtimeStockFetcher {
    pub fn new(
        repo: Box<dyn StockRepository>,
        consumer: Box<dyn EventConsumer>,
        options: &StageOptions,
    ) -> Result<Self, ConfigError> {
        let target = Target::from_options(options)?;
        let prefetch = options.parse::<usize>(keys::PREFETCH)?.unwrap_or(0);
        let topic = options.get(keys::TOPIC).unwrap_or(target.product_id.as_str()).to_string();
        let ping_timeout = options
            .parse::<u64>(keys::PING_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PING_TIMEOUT);

        let (out_tx, out_rx) = stream();
        let (fault_tx, fault_rx) = fault_stream();
        Ok(Self {
            worker: StageWorker::new("fetch"),
            target,
            prefetch,
            topic,
            ping_timeout,
            repo: Some(repo),
            consumer: Some(consumer),
            out_tx: Some(out_tx),
            out_rx: Some(out_rx),
            fault_tx: Some(fault_tx),
            fault_rx: Some(fault_rx),
        })
    }
}

#[async_trait]
impl Stage for RealtimeStockFetcher {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn output_kind(&self) -> Option<PayloadKind> {
        Some(PayloadKind::Aggregate)
    }

    fn take_output(&mut self) -> Option<PacketReceiver> {
        self.out_rx.take()
    }

    fn take_faults(&mut self) -> Option<FaultReceiver> {
        self.fault_rx.take()
    }

    fn execute(&mut self) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        let (Some(mut repo), Some(mut consumer), Some(out), Some(faults)) = (
            self.repo.take(),
            self.consumer.take(),
            self.out_tx.take(),
            self.fault_tx.take(),
        ) else {
            return Err(StageError::AlreadyExecuted);
        };

        let follow = Follow {
            name: self.worker.name().to_string(),
            target: self.target.clone(),
            prefetch: self.prefetch,
            topic: self.topic.clone(),
            ping_timeout: self.ping_timeout,
            out,
            faults,
            stop: self.worker.stop_notifier(),
        };

        self.worker.spawn(async move {
            if let Err(e) = follow.run(repo.as_mut(), consumer.as_mut()).await {
                error!("[{}] stopped on error: {e}", follow.name);
                let _ = follow.faults.send(StageFault::fatal(&follow.name, e));
            }
        })
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let result = self.worker.close().await;
        self.out_tx.take();
        self.fault_tx.take();
        result
    }
}

struct Follow {
    name: String,
    target: Target,
    prefetch: usize,
    topic: String,
    ping_timeout: Duration,
    out: PacketSender,
    faults: FaultSender,
    stop: StopNotifier,
}

impl Follow {
    async fn run(
        &self,
        repo: &mut dyn StockRepository,
        consumer: &mut dyn EventConsumer,
    ) -> Result<(), StageError> {
        let mut sequence = 0i64;
        if !self.prefetch(repo, &mut sequence).await? {
            return Ok(());
        }

        let deadline = Instant::now() + self.ping_timeout;
        match until_stopped(&self.stop, consumer.ping(deadline)).await {
            None => return Ok(()),
            Some(result) => result.map_err(broker_error)?,
        }
        match until_stopped(&self.stop, consumer.subscribe(&self.topic)).await {
            None => return Ok(()),
            Some(result) => result.map_err(broker_error)?,
        }
        info!("[{}] following topic {}", self.name, self.topic);

        while let Some(event) = until_stopped(&self.stop, consumer.recv()).await.flatten() {
            match event {
                Ok(agg) => {
                    if !self.send(sequence, agg).await {
                        return Ok(());
                    }
                    sequence += 1;
                }
                Err(e @ BrokerError::Decode { .. }) => {
                    warn!("[{}] skipping undecodable frame: {e}", self.name);
                    let _ = self
                        .faults
                        .send(StageFault::recoverable(&self.name, StageError::Decode(e.to_string())));
                }
                Err(e) => return Err(broker_error(e)),
            }
        }
        info!("[{}] feed ended after sequence {sequence}", self.name);
        Ok(())
    }

    /// Send the most recent `prefetch` stored bars. Returns `false` if the
    /// stage should wind down.
    async fn prefetch(&self, repo: &mut dyn StockRepository, sequence: &mut i64) -> Result<bool, StageError> {
        repo.set_target(&self.target.product_id, &self.target.time_slice);
        if self.prefetch == 0 {
            return Ok(true);
        }

        let Some(total) = until_stopped(&self.stop, repo.count()).await else {
            return Ok(false);
        };
        let total = total.map_err(repository_error)?;
        let quantity = self.prefetch.min(total);
        info!("[{}] prefetching {quantity} bar(s) of {}", self.name, self.target.product_id);

        let mut docs = repo.documents(total - quantity, quantity);
        while let Some(next) = until_stopped(&self.stop, docs.next()).await.flatten() {
            let doc = next.map_err(repository_error)?;
            if !self.send(*sequence, StockAggregate::from_document(&doc, self.target.slice_secs)).await {
                return Ok(false);
            }
            *sequence += 1;
        }
        Ok(!self.stop.is_stop_requested())
    }

    async fn send(&self, sequence: i64, agg: StockAggregate) -> bool {
        send_or_stop(&self.out, Packet::new(sequence, Payload::Aggregate(agg)), &self.stop).await
    }
}

fn broker_error(e: BrokerError) -> StageError {
    StageError::Broker(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryConsumer;
    use crate::repository::{MemoryRepository, bar};

    const PRODUCT: &str = "stock.aapl.usa";

    fn repo(n: i64) -> Box<dyn StockRepository> {
        let docs = (0..n).map(|i| bar(1_000 + i * 60, i as f32)).collect();
        Box::new(MemoryRepository::new().with_series(PRODUCT, "1m", docs))
    }

    fn live(open_time: i64) -> StockAggregate {
        StockAggregate {
            open_time,
            closed_time: open_time + 60,
            open: 1.0,
            closed: 1.5,
            high: 2.0,
            low: 0.5,
            volume: 42.0,
        }
    }

    fn open_time(p: &Packet) -> i64 {
        match &p.data {
            Payload::Aggregate(a) => a.open_time,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn prefetch_then_follow() {
        let (feed, consumer) = MemoryConsumer::channel(8);
        let opts = StageOptions::new().with(keys::PRODUCT_ID, PRODUCT).with(keys::PREFETCH, "2");
        let mut fetch = RealtimeStockFetcher::new(repo(5), Box::new(consumer), &opts).unwrap();
        let mut rx = fetch.take_output().unwrap();
        let mut faults = fetch.take_faults().unwrap();
        fetch.execute().unwrap();

        feed.publish_aggregate(PRODUCT, &live(5_000)).await.unwrap();
        feed.publish(PRODUCT, "{broken").await.unwrap();
        feed.publish_aggregate(PRODUCT, &live(5_060)).await.unwrap();
        drop(feed);

        let mut got = Vec::new();
        while let Some(p) = rx.recv().await {
            got.push((p.sequence, open_time(&p)));
        }
        assert_eq!(got, vec![(0, 1_180), (1, 1_240), (2, 5_000), (3, 5_060)]);

        let fault = faults.recv().await.unwrap();
        assert!(!fault.is_fatal());
        assert!(matches!(fault.error, StageError::Decode(_)));
        fetch.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_health_probe_is_fatal() {
        let (_feed, consumer) = MemoryConsumer::channel(1);
        let consumer = consumer.with_ping_latency(Duration::from_secs(5));
        let opts = StageOptions::new()
            .with(keys::PRODUCT_ID, PRODUCT)
            .with(keys::PING_TIMEOUT_MS, "10");
        let mut fetch = RealtimeStockFetcher::new(repo(0), Box::new(consumer), &opts).unwrap();
        let mut rx = fetch.take_output().unwrap();
        let mut faults = fetch.take_faults().unwrap();
        fetch.execute().unwrap();

        assert!(rx.recv().await.is_none());
        let fault = faults.recv().await.unwrap();
        assert!(fault.is_fatal());
        assert_eq!(
            fault.error,
            StageError::Broker(BrokerError::DeadlineExceeded.to_string())
        );
        fetch.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_while_waiting_on_feed() {
        let (_feed, consumer) = MemoryConsumer::channel(1);
        let opts = StageOptions::new().with(keys::PRODUCT_ID, PRODUCT);
        let mut fetch = RealtimeStockFetcher::new(repo(0), Box::new(consumer), &opts).unwrap();
        let mut rx = fetch.take_output().unwrap();
        fetch.execute().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        fetch.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
