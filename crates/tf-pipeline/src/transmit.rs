//! Terminal stage handing order events to an [`OrderSink`].

use async_trait::async_trait;
use tf_core::error::{StageError, StageFault};
use tf_core::stage::{
    Downstream, FaultReceiver, FaultSender, PacketReceiver, Stage, StageWorker, fault_stream, recv_or_stop,
    until_stopped,
};
use tf_core::{OrderEvent, Payload, PayloadKind};
use tracing::{info, warn};

/// Destination of trading decisions.
#[async_trait]
pub trait OrderSink: Send + 'static {
    async fn submit(&mut self, sequence: i64, event: &OrderEvent) -> Result<(), StageError>;
}

/// Sink that only logs each order.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl OrderSink for LogSink {
    async fn submit(&mut self, sequence: i64, event: &OrderEvent) -> Result<(), StageError> {
        info!(
            sequence,
            product_id = %event.product_id,
            action = %event.transaction.action,
            proportion_percent = event.transaction.proportion_percent,
            timestamp = event.timestamp,
            task = %event.task,
            "order"
        );
        Ok(())
    }
}

/// Consumes `OrderEvent` packets. Has no output stream.
pub struct TransmitStage {
    worker: StageWorker,
    sink: Option<Box<dyn OrderSink>>,
    input: Option<PacketReceiver>,
    fault_tx: Option<FaultSender>,
    fault_rx: Option<FaultReceiver>,
}

impl TransmitStage {
    pub fn new(sink: impl OrderSink) -> Self {
        let (fault_tx, fault_rx) = fault_stream();
        Self {
            worker: StageWorker::new("transmit"),
            sink: Some(Box::new(sink)),
            input: None,
            fault_tx: Some(fault_tx),
            fault_rx: Some(fault_rx),
        }
    }
}

#[async_trait]
impl Stage for TransmitStage {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn output_kind(&self) -> Option<PayloadKind> {
        None
    }

    fn take_output(&mut self) -> Option<PacketReceiver> {
        None
    }

    fn take_faults(&mut self) -> Option<FaultReceiver> {
        self.fault_rx.take()
    }

    fn execute(&mut self) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        let mut input = self.input.take().ok_or(StageError::InputMissing)?;
        let (Some(mut sink), Some(faults)) = (self.sink.take(), self.fault_tx.take()) else {
            return Err(StageError::AlreadyExecuted);
        };
        let stop = self.worker.stop_notifier();
        let name = self.worker.name().to_string();

        self.worker.spawn(async move {
            let mut sent = 0u64;
            while let Some(packet) = recv_or_stop(&mut input, &stop).await {
                let sequence = packet.sequence;
                let event = match packet.data {
                    Payload::OrderEvent(event) => event,
                    other => {
                        let err = StageError::KindMismatch {
                            sequence,
                            expected: PayloadKind::OrderEvent,
                            actual: other.kind(),
                        };
                        warn!("[{name}] {err}");
                        let _ = faults.send(StageFault::recoverable(&name, err));
                        continue;
                    }
                };
                match until_stopped(&stop, sink.submit(sequence, &event)).await {
                    None => break,
                    Some(Ok(())) => sent += 1,
                    Some(Err(e)) => {
                        warn!("[{name}] order {sequence} not transmitted: {e}");
                        let _ = faults.send(StageFault::recoverable(&name, e));
                    }
                }
            }
            info!("[{name}] done, transmitted {sent} order(s)");
        })
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let result = self.worker.close().await;
        self.fault_tx.take();
        result
    }
}

impl Downstream for TransmitStage {
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::OrderEvent
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

/// Sink forwarding every order to a channel, for tests.
#[cfg(test)]
pub(crate) struct ChannelSink(pub tokio::sync::mpsc::UnboundedSender<(i64, OrderEvent)>);

#[cfg(test)]
#[async_trait]
impl OrderSink for ChannelSink {
    async fn submit(&mut self, sequence: i64, event: &OrderEvent) -> Result<(), StageError> {
        if event.transaction.proportion_percent > 100 {
            return Err(StageError::Sink(format!("proportion {} over 100", event.transaction.proportion_percent)));
        }
        self.0
            .send((sequence, event.clone()))
            .map_err(|_| StageError::Sink("receiver dropped".to_string()))
    }
}
