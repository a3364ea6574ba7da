//! Historical fetch stage.
//!
//! Replays stored bars for one product from a [`StockRepository`] as
//! `Aggregate` packets numbered from 0. Options:
//!
//! | Key         | Required | Meaning                                         |
//! |-------------|----------|-------------------------------------------------|
//! | `productId` | yes      | series to replay                                |
//! | `timeSlice` | no       | bar interval, default `1m`                      |
//! | `startDate` | no       | unix seconds; replay from the latest bar at or before it |
//! | `endDate`   | no       | unix seconds; stop after the last bar at or before it   |

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
use tracing::{error, info};

use crate::repository::{RepositoryError, StockRepository};
use crate::target::Target;

/// Replays stored bars.
pub struct PastStockFetcher {
    worker: StageWorker,
    target: Target,
    start_date: Option<i64>,
    end_date: Option<i64>,
    repo: Option<Box<dyn StockRepository>>,
    out_tx: Option<PacketSender>,
    out_rx: Option<PacketReceiver>,
    fault_tx: Option<FaultSender>,
    fault_rx: Option<FaultReceiver>,
}

impl PastStockFetcher {
    pub fn new(repo: Box<dyn StockRepository>, options: &StageOptions) -> Result<Self, ConfigError> {
        let target = Target::from_options(options)?;
        let start_date = options.parse::<i64>(keys::START_DATE)?;
        let end_date = options.parse::<i64>(keys::END_DATE)?;
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if end < start {
                return Err(ConfigError::InvalidOption {
                    key: keys::END_DATE.to_string(),
                    value: end.to_string(),
                    reason: format!("before startDate {start}"),
                });
            }
        }

        let (out_tx, out_rx) = stream();
        let (fault_tx, fault_rx) = fault_stream();
        Ok(Self {
            worker: StageWorker::new("fetch"),
            target,
            start_date,
            end_date,
            repo: Some(repo),
            out_tx: Some(out_tx),
            out_rx: Some(out_rx),
            fault_tx: Some(fault_tx),
            fault_rx: Some(fault_rx),
        })
    }
}

#[async_trait]
impl Stage for PastStockFetcher {
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
        let (Some(mut repo), Some(out), Some(faults)) = (self.repo.take(), self.out_tx.take(), self.fault_tx.take())
        else {
            return Err(StageError::AlreadyExecuted);
        };

        let replay = Replay {
            name: self.worker.name().to_string(),
            target: self.target.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            out,
            stop: self.worker.stop_notifier(),
        };

        self.worker.spawn(async move {
            match replay.run(repo.as_mut()).await {
                Ok(sent) => info!("[{}] replay finished, {sent} bar(s) sent", replay.name),
                Err(e) => {
                    error!("[{}] replay failed: {e}", replay.name);
                    let _ = faults.send(StageFault::fatal(&replay.name, e));
                }
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

struct Replay {
    name: String,
    target: Target,
    start_date: Option<i64>,
    end_date: Option<i64>,
    out: PacketSender,
    stop: StopNotifier,
}

impl Replay {
    /// Returns the number of bars sent. A stop request ends the replay early
    /// without error.
    async fn run(&self, repo: &mut dyn StockRepository) -> Result<i64, StageError> {
        repo.set_target(&self.target.product_id, &self.target.time_slice);

        let Some(total) = self.call(repo.count()).await? else {
            return Ok(0);
        };
        let start = match self.start_date {
            Some(ts) => match self.call(repo.find_latest_index_by(ts)).await? {
                Some(index) => index,
                None => return Ok(0),
            },
            None => 0,
        };
        let quantity = total.saturating_sub(start);
        info!(
            "[{}] replaying {quantity} bar(s) of {} ({}) from index {start}",
            self.name, self.target.product_id, self.target.time_slice
        );

        let mut docs = repo.documents(start, quantity);
        let mut sequence = 0i64;
        while let Some(next) = until_stopped(&self.stop, docs.next()).await.flatten() {
            let doc = next.map_err(repository_error)?;
            if self.end_date.is_some_and(|end| doc.timestamp > end) {
                break;
            }
            let agg = StockAggregate::from_document(&doc, self.target.slice_secs);
            if !send_or_stop(&self.out, Packet::new(sequence, Payload::Aggregate(agg)), &self.stop).await {
                break;
            }
            sequence += 1;
        }
        Ok(sequence)
    }

    /// Await a repository call; `Ok(None)` if a stop arrived first.
    async fn call<T, F>(&self, fut: F) -> Result<Option<T>, StageError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        until_stopped(&self.stop, fut).await.transpose().map_err(repository_error)
    }
}

pub(crate) fn repository_error(e: RepositoryError) -> StageError {
    StageError::Repository(e.to_string())
}

#[cfg(test)]
mod tests {
    use futures_util::stream::BoxStream;
    use tf_core::StockDocument;

    use super::*;
    use crate::repository::{MemoryRepository, bar};

    const PRODUCT: &str = "stock.aapl.usa";

    fn repo(n: i64) -> Box<dyn StockRepository> {
        let docs = (0..n).map(|i| bar(1_000 + i * 60, 150.0)).collect();
        Box::new(MemoryRepository::new().with_series(PRODUCT, "1m", docs))
    }

    fn options() -> StageOptions {
        StageOptions::new().with(keys::PRODUCT_ID, PRODUCT)
    }

    async fn drain(rx: &mut PacketReceiver) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(p) = rx.recv().await {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn replays_full_range() {
        let mut fetch = PastStockFetcher::new(repo(100), &options()).unwrap();
        let mut rx = fetch.take_output().unwrap();
        fetch.execute().unwrap();

        let packets = drain(&mut rx).await;
        assert_eq!(packets.len(), 100);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.sequence, i as i64);
            let Payload::Aggregate(agg) = &p.data else {
                panic!("unexpected payload {:?}", p.data);
            };
            assert_eq!(agg.open_time, 1_000 + i as i64 * 60);
            assert_eq!(agg.closed_time, agg.open_time + 60);
            assert_eq!(agg.closed, 150.0);
        }
        fetch.close().await.unwrap();
    }

    #[tokio::test]
    async fn respects_start_and_end_dates() {
        let opts = options().with(keys::START_DATE, "1130").with(keys::END_DATE, "1300");
        let mut fetch = PastStockFetcher::new(repo(10), &opts).unwrap();
        let mut rx = fetch.take_output().unwrap();
        fetch.execute().unwrap();

        let packets = drain(&mut rx).await;
        let opens: Vec<_> = packets
            .iter()
            .map(|p| match &p.data {
                Payload::Aggregate(a) => a.open_time,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(opens, vec![1_120, 1_180, 1_240, 1_300]);
        assert_eq!(packets[0].sequence, 0);
        fetch.close().await.unwrap();
    }

    #[test]
    fn rejects_inverted_range() {
        let opts = options().with(keys::START_DATE, "2000").with(keys::END_DATE, "1000");
        assert!(matches!(
            PastStockFetcher::new(repo(1), &opts),
            Err(ConfigError::InvalidOption { key, .. }) if key == "endDate"
        ));
    }

    #[test]
    fn requires_product_id() {
        assert!(matches!(
            PastStockFetcher::new(repo(1), &StageOptions::new()),
            Err(ConfigError::MissingOption(_))
        ));
    }

    struct DownRepository;

    #[async_trait]
    impl StockRepository for DownRepository {
        fn set_target(&mut self, _: &str, _: &str) {}

        async fn count(&self) -> Result<usize, RepositoryError> {
            Err(RepositoryError::Unavailable("connection refused".into()))
        }

        async fn find_latest_index_by(&self, _: i64) -> Result<usize, RepositoryError> {
            Ok(0)
        }

        fn documents(&self, _: usize, _: usize) -> BoxStream<'_, Result<StockDocument, RepositoryError>> {
            futures_util::stream::empty().boxed()
        }
    }

    #[tokio::test]
    async fn repository_failure_is_a_fatal_fault() {
        let mut fetch = PastStockFetcher::new(Box::new(DownRepository), &options()).unwrap();
        let mut rx = fetch.take_output().unwrap();
        let mut faults = fetch.take_faults().unwrap();
        fetch.execute().unwrap();

        assert!(rx.recv().await.is_none());
        let fault = faults.recv().await.unwrap();
        assert!(fault.is_fatal());
        assert_eq!(fault.stage, "fetch");
        assert!(matches!(fault.error, StageError::Repository(_)));
        fetch.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_mid_replay_closes_output() {
        let mut fetch = PastStockFetcher::new(repo(1_000), &options()).unwrap();
        let mut rx = fetch.take_output().unwrap();
        fetch.execute().unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        fetch.close().await.unwrap();
        let rest = drain(&mut rx).await;
        assert!(rest.len() < 999);
        assert_eq!(fetch.execute(), Err(StageError::AlreadyExecuted));
    }

    #[tokio::test]
    async fn close_without_execute_closes_output() {
        let mut fetch = PastStockFetcher::new(repo(1), &options()).unwrap();
        let mut rx = fetch.take_output().unwrap();
        fetch.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
