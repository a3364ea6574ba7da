//! Single-input, single-output stages: model execution, adapter and analyzer.
//!
//! The stage owns the loop and the streams; the per-item work is a
//! [`Transform`]. A transform may drop an item by returning `Ok(None)`.
//! Errors are reported as recoverable faults and the item is skipped.

use async_trait::async_trait;
use tf_core::error::{StageError, StageFault};
use tf_core::stage::{
    Downstream, FaultReceiver, FaultSender, PacketReceiver, PacketSender, Stage, StageWorker, fault_stream,
    recv_or_stop, send_or_stop, stream,
};
use tf_core::stop::StopNotifier;
use tf_core::{Packet, Payload, PayloadKind};
use tracing::{debug, info, warn};

/// Per-item work of a transform stage.
#[async_trait]
pub trait Transform: Send + 'static {
    fn input_kind(&self) -> PayloadKind;

    fn output_kind(&self) -> PayloadKind;

    /// Map one payload. `Ok(None)` drops the item without a fault.
    async fn apply(&mut self, input: Payload) -> Result<Option<Payload>, StageError>;
}

/// [`Transform`] backed by a closure.
pub struct FnTransform<F> {
    input: PayloadKind,
    output: PayloadKind,
    f: F,
}

impl<F> FnTransform<F>
where
    F: FnMut(Payload) -> Result<Option<Payload>, StageError> + Send + 'static,
{
    pub fn new(input: PayloadKind, output: PayloadKind, f: F) -> Self {
        Self { input, output, f }
    }
}

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: FnMut(Payload) -> Result<Option<Payload>, StageError> + Send + 'static,
{
    fn input_kind(&self) -> PayloadKind {
        self.input
    }

    fn output_kind(&self) -> PayloadKind {
        self.output
    }

    async fn apply(&mut self, input: Payload) -> Result<Option<Payload>, StageError> {
        (self.f)(input)
    }
}

/// Runs a [`Transform`] over every packet of its input, keeping the sequence.
pub struct TransformStage {
    worker: StageWorker,
    input_kind: PayloadKind,
    output_kind: PayloadKind,
    transform: Option<Box<dyn Transform>>,
    input: Option<PacketReceiver>,
    out_tx: Option<PacketSender>,
    out_rx: Option<PacketReceiver>,
    fault_tx: Option<FaultSender>,
    fault_rx: Option<FaultReceiver>,
}

impl TransformStage {
    pub fn new(name: impl Into<String>, transform: impl Transform) -> Self {
        Self::boxed(name, Box::new(transform))
    }

    pub fn boxed(name: impl Into<String>, transform: Box<dyn Transform>) -> Self {
        let (out_tx, out_rx) = stream();
        let (fault_tx, fault_rx) = fault_stream();
        Self {
            worker: StageWorker::new(name),
            input_kind: transform.input_kind(),
            output_kind: transform.output_kind(),
            transform: Some(transform),
            input: None,
            out_tx: Some(out_tx),
            out_rx: Some(out_rx),
            fault_tx: Some(fault_tx),
            fault_rx: Some(fault_rx),
        }
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn output_kind(&self) -> Option<PayloadKind> {
        Some(self.output_kind)
    }

    fn take_output(&mut self) -> Option<PacketReceiver> {
        self.out_rx.take()
    }

    fn take_faults(&mut self) -> Option<FaultReceiver> {
        self.fault_rx.take()
    }

    fn execute(&mut self) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        let input = self.input.take().ok_or(StageError::InputMissing)?;
        let (Some(transform), Some(out), Some(faults)) =
            (self.transform.take(), self.out_tx.take(), self.fault_tx.take())
        else {
            return Err(StageError::AlreadyExecuted);
        };

        let apply = Apply {
            name: self.worker.name().to_string(),
            input_kind: self.input_kind,
            output_kind: self.output_kind,
            out,
            faults,
            stop: self.worker.stop_notifier(),
        };
        self.worker.spawn(apply.run(transform, input))
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let result = self.worker.close().await;
        self.out_tx.take();
        self.fault_tx.take();
        result
    }
}

impl Downstream for TransformStage {
    fn input_kind(&self) -> PayloadKind {
        self.input_kind
    }

    fn set_input(&mut self, input: PacketReceiver) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        if self.input.is_some() {
            return Err(StageError::InputAlreadySet);
        }
        self.input = Some(input);
        Ok(())
    }
}

struct Apply {
    name: String,
    input_kind: PayloadKind,
    output_kind: PayloadKind,
    out: PacketSender,
    faults: FaultSender,
    stop: StopNotifier,
}

impl Apply {
    async fn run(self, mut transform: Box<dyn Transform>, mut input: PacketReceiver) {
        let (mut forwarded, mut skipped) = (0u64, 0u64);

        while let Some(packet) = recv_or_stop(&mut input, &self.stop).await {
            let sequence = packet.sequence;
            if packet.kind() != self.input_kind {
                skipped += 1;
                self.fault(StageError::KindMismatch {
                    sequence,
                    expected: self.input_kind,
                    actual: packet.kind(),
                });
                continue;
            }

            let output = match transform.apply(packet.data).await {
                Ok(Some(output)) => output,
                Ok(None) => {
                    skipped += 1;
                    continue;
                }
                Err(e) => {
                    skipped += 1;
                    self.fault(e);
                    continue;
                }
            };
            if output.kind() != self.output_kind {
                skipped += 1;
                self.fault(StageError::KindMismatch {
                    sequence,
                    expected: self.output_kind,
                    actual: output.kind(),
                });
                continue;
            }

            if !send_or_stop(&self.out, Packet::new(sequence, output), &self.stop).await {
                debug!("[{}] output closed or stop requested", self.name);
                break;
            }
            forwarded += 1;
        }

        info!("[{}] done, forwarded {forwarded} skipped {skipped}", self.name);
    }

    fn fault(&self, error: StageError) {
        warn!("[{}] skipping item: {error}", self.name);
        let _ = self.faults.send(StageFault::recoverable(&self.name, error));
    }
}
