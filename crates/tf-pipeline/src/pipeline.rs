//! Pipeline orchestrator.
//!
//! Two fixed topologies, both built by one assembly routine:
//!
//! ```text
//! with adapter:
//!   fetch ─► mux ─┬─► model ─► adapter ─► join(model) ─► analyze ─► transmit
//!                 └───────────────────────► join(ref)
//!
//! direct:
//!   fetch ─► mux ─┬─► model ─► join(model) ─► analyze ─► transmit
//!                 └──────────► join(ref)
//! ```
//!
//! Payload kinds of every adjacent pair are checked before anything is
//! wired, so a pipeline that exists is always well-typed.

use tf_core::PayloadKind;
use tf_core::config::{ErrorPolicy, JoinerConfig};
use tf_core::error::{ConfigError, PipelineError, ShutdownError, StageError, WiringError};
use tf_core::stage::{Downstream, FaultReceiver, PacketReceiver, Stage};
use tf_core::stop::StopNotifier;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, error, info, info_span, warn};
use uuid::Uuid;

use crate::joiner::SequenceJoiner;
use crate::mux::ChannelMux;
use crate::supervisor::{FaultSummary, spawn_supervisor};

/// Which of the two fixed graphs a pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Model output passes through an adapter before the joiner.
    WithAdapter,
    /// Model output feeds the joiner directly.
    Direct,
}

/// Orchestrator settings that do not depend on the stages themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub joiner: JoinerConfig,
    pub error_policy: ErrorPolicy,
}

/// Owns every stage and their combined lifecycle.
pub struct Pipeline {
    run_id: Uuid,
    span: Span,
    topology: Topology,
    policy: ErrorPolicy,
    fetch: Box<dyn Stage>,
    mux: ChannelMux,
    model: Box<dyn Downstream>,
    adapter: Option<Box<dyn Downstream>>,
    join: SequenceJoiner,
    analyze: Box<dyn Downstream>,
    transmit: Box<dyn Downstream>,
    halt: StopNotifier,
    supervisor: Option<JoinHandle<FaultSummary>>,
    summary: Option<FaultSummary>,
}

impl Pipeline {
    /// fetch → mux → model → adapter → join → analyze → transmit.
    pub fn with_adapter(
        fetch: Box<dyn Stage>,
        model: Box<dyn Downstream>,
        adapter: Box<dyn Downstream>,
        analyze: Box<dyn Downstream>,
        transmit: Box<dyn Downstream>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        Self::assemble(fetch, model, Some(adapter), analyze, transmit, options)
    }

    /// fetch → mux → model → join → analyze → transmit.
    pub fn without_adapter(
        fetch: Box<dyn Stage>,
        model: Box<dyn Downstream>,
        analyze: Box<dyn Downstream>,
        transmit: Box<dyn Downstream>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        Self::assemble(fetch, model, None, analyze, transmit, options)
    }

    fn assemble(
        mut fetch: Box<dyn Stage>,
        mut model: Box<dyn Downstream>,
        mut adapter: Option<Box<dyn Downstream>>,
        mut analyze: Box<dyn Downstream>,
        mut transmit: Box<dyn Downstream>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let topology = if adapter.is_some() {
            Topology::WithAdapter
        } else {
            Topology::Direct
        };

        // Validate every edge before touching any stream.
        let fetch_kind = produced(fetch.as_ref())?;
        check(fetch.name(), fetch_kind, model.name(), model.input_kind())?;
        let mut model_kind = produced(model.as_ref())?;
        if let Some(adapter) = &adapter {
            check(model.name(), model_kind, adapter.name(), adapter.input_kind())?;
            model_kind = produced(adapter.as_ref())?;
        }
        let mut join = SequenceJoiner::new(fetch_kind, model_kind, options.joiner);
        check(join.name(), PayloadKind::Pair, analyze.name(), analyze.input_kind())?;
        check(analyze.name(), produced(analyze.as_ref())?, transmit.name(), transmit.input_kind())?;

        let mut mux = ChannelMux::new(fetch_kind);
        mux.set_input(take_output(fetch.as_mut())?)?;
        model.set_input(mux.output()?)?;
        join.set_ref_input(mux.output()?)?;

        let mut model_out = take_output(model.as_mut())?;
        if let Some(adapter) = adapter.as_mut() {
            adapter.set_input(model_out)?;
            model_out = take_output(adapter.as_mut())?;
        }
        join.set_model_input(model_out)?;
        analyze.set_input(take_output(&mut join)?)?;
        transmit.set_input(take_output(analyze.as_mut())?)?;

        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", %run_id, ?topology);
        span.in_scope(|| info!("assembled {topology:?} pipeline"));

        Ok(Self {
            run_id,
            span,
            topology,
            policy: options.error_policy,
            fetch,
            mux,
            model,
            adapter,
            join,
            analyze,
            transmit,
            halt: StopNotifier::new(),
            supervisor: None,
            summary: None,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Fault counts, available once `stop` has returned.
    pub fn fault_summary(&self) -> Option<FaultSummary> {
        self.summary
    }

    /// Start the fault supervisor and every stage. Returns immediately.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        let span = self.span.clone();
        let _entered = span.enter();
        if self.supervisor.is_some() {
            return Err(StageError::AlreadyExecuted.into());
        }

        let faults: Vec<FaultReceiver> = [
            self.fetch.take_faults(),
            self.mux.take_faults(),
            self.model.take_faults(),
            self.adapter.as_mut().and_then(|a| a.take_faults()),
            self.join.take_faults(),
            self.analyze.take_faults(),
            self.transmit.take_faults(),
        ]
        .into_iter()
        .flatten()
        .collect();
        self.supervisor = Some(spawn_supervisor(faults, self.policy, self.halt.clone()));

        start(self.fetch.as_mut())?;
        start(&mut self.mux)?;
        start(self.model.as_mut())?;
        if let Some(adapter) = self.adapter.as_mut() {
            start(adapter.as_mut())?;
        }
        start(&mut self.join)?;
        start(self.analyze.as_mut())?;
        start(self.transmit.as_mut())?;
        Ok(())
    }

    /// Resolves when the supervisor halts on a fatal fault, or once every
    /// stage has finished on its own.
    pub async fn halted(&self) {
        self.halt.requested().await;
    }

    /// Close every stage in pipeline order, carrying on past failures.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        let span = self.span.clone();
        async move {
            let mut failures = Vec::new();
            close(self.fetch.as_mut(), &mut failures).await;
            close(&mut self.mux, &mut failures).await;
            close(self.model.as_mut(), &mut failures).await;
            if let Some(adapter) = self.adapter.as_mut() {
                close(adapter.as_mut(), &mut failures).await;
            }
            close(&mut self.join, &mut failures).await;
            close(self.analyze.as_mut(), &mut failures).await;
            close(self.transmit.as_mut(), &mut failures).await;

            if let Some(supervisor) = self.supervisor.take() {
                match supervisor.await {
                    Ok(summary) => {
                        info!(
                            recoverable = summary.recoverable,
                            fatal = summary.fatal,
                            "pipeline stopped"
                        );
                        self.summary = Some(summary);
                    }
                    Err(e) => warn!("fault supervisor did not finish cleanly: {e}"),
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(ShutdownError { failures }.into())
            }
        }
        .instrument(span)
        .await
    }
}

fn start<S: Stage + ?Sized>(stage: &mut S) -> Result<(), StageError> {
    stage.execute()?;
    info!("started {}", stage.name());
    Ok(())
}

async fn close<S: Stage + ?Sized>(stage: &mut S, failures: &mut Vec<(String, StageError)>) {
    match stage.close().await {
        Ok(()) => info!("closed {}", stage.name()),
        Err(e) => {
            error!("failed to close {}: {e}", stage.name());
            failures.push((stage.name().to_string(), e));
        }
    }
}

fn produced<S: Stage + ?Sized>(stage: &S) -> Result<PayloadKind, ConfigError> {
    stage.output_kind().ok_or_else(|| ConfigError::InvalidOption {
        key: "stage".to_string(),
        value: stage.name().to_string(),
        reason: "stage has no output but feeds another stage".to_string(),
    })
}

fn check(upstream: &str, produced: PayloadKind, downstream: &str, expected: PayloadKind) -> Result<(), WiringError> {
    if produced == expected {
        return Ok(());
    }
    Err(WiringError {
        upstream: upstream.to_string(),
        downstream: downstream.to_string(),
        produced,
        expected,
    })
}

fn take_output<S: Stage + ?Sized>(stage: &mut S) -> Result<PacketReceiver, StageError> {
    stage.take_output().ok_or(StageError::AlreadyExecuted)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tf_core::options::{StageOptions, keys};
    use tf_core::{Action, OrderEvent, Payload, Prediction, StockDocument, Task, Transaction};
    use tf_md::PastStockFetcher;
    use tf_md::repository::MemoryRepository;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transform::{FnTransform, TransformStage};
    use crate::transmit::{ChannelSink, TransmitStage};

    const PRODUCT: &str = "stock.aapl.usa";

    fn fetch(bars: i64) -> Box<dyn Stage> {
        let docs = (0..bars)
            .map(|i| StockDocument {
                timestamp: 1_000 + i * 60,
                open: 1.0,
                close: i as f32,
                high: 2.0,
                low: 0.5,
                volume: 100,
            })
            .collect();
        let repo = MemoryRepository::new().with_series(PRODUCT, "1m", docs);
        let opts = StageOptions::new().with(keys::PRODUCT_ID, PRODUCT);
        Box::new(PastStockFetcher::new(Box::new(repo), &opts).unwrap())
    }

    fn model() -> Box<dyn Downstream> {
        Box::new(TransformStage::new(
            "model",
            FnTransform::new(PayloadKind::Aggregate, PayloadKind::ModelOutput, |p| match p {
                Payload::Aggregate(a) => Ok(Some(Payload::ModelOutput(vec![f64::from(a.closed)]))),
                other => Err(StageError::Transform(format!("unexpected {}", other.kind()))),
            }),
        ))
    }

    fn adapter() -> Box<dyn Downstream> {
        Box::new(TransformStage::new(
            "adapter",
            FnTransform::new(PayloadKind::ModelOutput, PayloadKind::Prediction, |p| match p {
                Payload::ModelOutput(v) => Ok(v.first().map(|&score| Payload::Prediction(Prediction { score }))),
                other => Err(StageError::Transform(format!("unexpected {}", other.kind()))),
            }),
        ))
    }

    /// Buys when the model's score is even, otherwise sells.
    fn analyze() -> Box<dyn Downstream> {
        Box::new(TransformStage::new(
            "analyze",
            FnTransform::new(PayloadKind::Pair, PayloadKind::OrderEvent, |p| {
                let Payload::Pair(pair) = p else {
                    return Err(StageError::Transform("expected pair".into()));
                };
                let (Payload::Aggregate(bar), model) = (&pair.ref_data, &pair.model_data) else {
                    return Err(StageError::Transform("expected aggregate reference".into()));
                };
                let score = match model {
                    Payload::Prediction(p) => p.score,
                    Payload::ModelOutput(v) => v.first().copied().unwrap_or_default(),
                    other => return Err(StageError::Transform(format!("unexpected {}", other.kind()))),
                };
                let action = if score as i64 % 2 == 0 { Action::Buy } else { Action::Sell };
                Ok(Some(Payload::OrderEvent(OrderEvent {
                    product_id: PRODUCT.to_string(),
                    transaction: Transaction {
                        proportion_percent: 10,
                        action,
                    },
                    timestamp: bar.closed_time,
                    task: Task::BackTest,
                })))
            }),
        ))
    }

    fn transmit() -> (Box<dyn Downstream>, mpsc::UnboundedReceiver<(i64, OrderEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(TransmitStage::new(ChannelSink(tx))), rx)
    }

    async fn run_to_completion(mut pipeline: Pipeline) {
        pipeline.run().unwrap();
        tokio::time::timeout(Duration::from_secs(5), pipeline.halted()).await.unwrap();
        pipeline.stop().await.unwrap();
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<(i64, OrderEvent)>) -> Vec<(i64, Action)> {
        let mut orders = Vec::new();
        while let Ok((seq, event)) = rx.try_recv() {
            orders.push((seq, event.transaction.action));
        }
        orders
    }

    #[tokio::test]
    async fn runs_with_adapter() {
        let (sink, orders) = transmit();
        let pipeline =
            Pipeline::with_adapter(fetch(20), model(), adapter(), analyze(), sink, PipelineOptions::default())
                .unwrap();
        assert_eq!(pipeline.topology(), Topology::WithAdapter);
        run_to_completion(pipeline).await;

        let orders = collect(orders);
        assert_eq!(orders.len(), 20);
        for (seq, action) in orders {
            let expected = if seq % 2 == 0 { Action::Buy } else { Action::Sell };
            assert_eq!(action, expected, "sequence {seq}");
        }
    }

    #[tokio::test]
    async fn runs_without_adapter() {
        let (sink, orders) = transmit();
        let pipeline =
            Pipeline::without_adapter(fetch(8), model(), analyze(), sink, PipelineOptions::default()).unwrap();
        assert_eq!(pipeline.topology(), Topology::Direct);
        run_to_completion(pipeline).await;

        let mut seqs: Vec<i64> = collect(orders).into_iter().map(|(seq, _)| seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn mismatched_kinds_fail_before_run() {
        let (sink, _orders) = transmit();
        // Analyzer in the adapter slot is handed raw model output.
        let err = Pipeline::with_adapter(fetch(1), model(), analyze(), adapter(), sink, PipelineOptions::default())
            .err()
            .unwrap();
        match err {
            PipelineError::Wiring(w) => {
                assert_eq!(w.upstream, "model");
                assert_eq!(w.downstream, "analyze");
                assert_eq!(w.produced, PayloadKind::ModelOutput);
                assert_eq!(w.expected, PayloadKind::Pair);
            }
            other => panic!("expected wiring error, got {other}"),
        }
    }

    #[test]
    fn sink_in_analyzer_slot_is_rejected() {
        let (sink, _orders) = transmit();
        let (other_sink, _other) = transmit();
        let err = Pipeline::without_adapter(fetch(1), model(), sink, other_sink, PipelineOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Wiring(_)));
    }

    /// Downstream stage whose `close` always fails.
    struct BrokenClose {
        name: &'static str,
        input: PayloadKind,
        output: Option<PayloadKind>,
        out: Option<PacketReceiver>,
        closed: Arc<AtomicBool>,
    }

    impl BrokenClose {
        fn new(name: &'static str, input: PayloadKind, output: Option<PayloadKind>) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            let out = output.map(|_| tf_core::stage::stream().1);
            let stage = Self {
                name,
                input,
                output,
                out,
                closed: closed.clone(),
            };
            (stage, closed)
        }
    }

    #[async_trait]
    impl Stage for BrokenClose {
        fn name(&self) -> &str {
            self.name
        }

        fn output_kind(&self) -> Option<PayloadKind> {
            self.output
        }

        fn take_output(&mut self) -> Option<PacketReceiver> {
            self.out.take()
        }

        fn execute(&mut self) -> Result<(), StageError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), StageError> {
            self.closed.store(true, Ordering::SeqCst);
            Err(StageError::Sink(format!("{} refused to close", self.name)))
        }
    }

    impl Downstream for BrokenClose {
        fn input_kind(&self) -> PayloadKind {
            self.input
        }

        fn set_input(&mut self, _input: PacketReceiver) -> Result<(), StageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_closes_every_stage_and_reports_all_failures() {
        let (analyze, analyze_closed) = BrokenClose::new("analyze", PayloadKind::Pair, Some(PayloadKind::OrderEvent));
        let (transmit, transmit_closed) = BrokenClose::new("transmit", PayloadKind::OrderEvent, None);
        let mut pipeline = Pipeline::without_adapter(
            fetch(3),
            model(),
            Box::new(analyze),
            Box::new(transmit),
            PipelineOptions::default(),
        )
        .unwrap();
        pipeline.run().unwrap();

        let err = pipeline.stop().await.unwrap_err();
        let PipelineError::Shutdown(shutdown) = err else {
            panic!("expected shutdown error, got {err}");
        };
        assert_eq!(shutdown.stages(), vec!["analyze", "transmit"]);
        assert!(analyze_closed.load(Ordering::SeqCst));
        assert!(transmit_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fatal_fetch_fault_halts_pipeline() {
        let (sink, _orders) = transmit();
        let opts = StageOptions::new()
            .with(keys::PRODUCT_ID, PRODUCT)
            .with(keys::START_DATE, "1000");
        let fetch: Box<dyn Stage> = Box::new(PastStockFetcher::new(Box::new(FailingRepo), &opts).unwrap());
        let mut pipeline =
            Pipeline::without_adapter(fetch, model(), analyze(), sink, PipelineOptions::default()).unwrap();
        pipeline.run().unwrap();

        tokio::time::timeout(Duration::from_secs(5), pipeline.halted()).await.unwrap();
        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.fault_summary().map(|s| s.fatal), Some(1));
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let (sink, _orders) = transmit();
        let mut pipeline =
            Pipeline::without_adapter(fetch(1), model(), analyze(), sink, PipelineOptions::default()).unwrap();
        pipeline.run().unwrap();
        assert!(matches!(
            pipeline.run(),
            Err(PipelineError::Stage(StageError::AlreadyExecuted))
        ));
        pipeline.stop().await.unwrap();
    }

    struct FailingRepo;

    #[async_trait]
    impl tf_md::repository::StockRepository for FailingRepo {
        fn set_target(&mut self, _product_id: &str, _time_slice: &str) {}

        async fn count(&self) -> Result<usize, tf_md::repository::RepositoryError> {
            Err(tf_md::repository::RepositoryError::Unavailable("connection refused".into()))
        }

        async fn find_latest_index_by(&self, _timestamp: i64) -> Result<usize, tf_md::repository::RepositoryError> {
            Err(tf_md::repository::RepositoryError::Unavailable("connection refused".into()))
        }

        fn documents(
            &self,
            _start: usize,
            _count: usize,
        ) -> futures_util::stream::BoxStream<'_, Result<StockDocument, tf_md::repository::RepositoryError>> {
            Box::pin(futures_util::stream::empty())
        }
    }
}
