//! Fan one stream out to several consumers.
//!
//! Every consumer sees every packet exactly once and in source order. A
//! delivery round ends only when all consumers have taken the packet, so the
//! slowest consumer sets the pace for the others.

use async_trait::async_trait;
use futures_util::future::join_all;
use tf_core::PayloadKind;
use tf_core::error::StageError;
use tf_core::stage::{PacketReceiver, PacketSender, Stage, StageWorker, recv_or_stop, stream, until_stopped};
use tf_core::stop::StopNotifier;
use tracing::{debug, info, warn};

/// Replicates one upstream stream into independently paced consumer streams.
pub struct ChannelMux {
    worker: StageWorker,
    kind: PayloadKind,
    input: Option<PacketReceiver>,
    consumers: Vec<PacketSender>,
}

impl ChannelMux {
    /// `kind` is the payload kind flowing through; the mux never inspects it.
    pub fn new(kind: PayloadKind) -> Self {
        Self {
            worker: StageWorker::new("mux"),
            kind,
            input: None,
            consumers: Vec::new(),
        }
    }

    pub fn set_input(&mut self, input: PacketReceiver) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        if self.input.is_some() {
            return Err(StageError::InputAlreadySet);
        }
        self.input = Some(input);
        Ok(())
    }

    /// Register a new consumer. Each call returns a distinct stream.
    pub fn output(&mut self) -> Result<PacketReceiver, StageError> {
        self.worker.ensure_not_executed()?;
        let (tx, rx) = stream();
        self.consumers.push(tx);
        Ok(rx)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

#[async_trait]
impl Stage for ChannelMux {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn output_kind(&self) -> Option<PayloadKind> {
        Some(self.kind)
    }

    /// Always `None`: consumers register through [`ChannelMux::output`].
    fn take_output(&mut self) -> Option<PacketReceiver> {
        None
    }

    fn execute(&mut self) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        let input = self.input.take().ok_or(StageError::InputMissing)?;
        let consumers = std::mem::take(&mut self.consumers);
        let stop = self.worker.stop_notifier();
        let name = self.worker.name().to_string();
        self.worker.spawn(fan_out(name, input, consumers, stop))
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let result = self.worker.close().await;
        self.consumers.clear();
        result
    }
}

async fn fan_out(name: String, mut input: PacketReceiver, mut consumers: Vec<PacketSender>, stop: StopNotifier) {
    info!("[{name}] fanning out to {} consumer(s)", consumers.len());
    let mut delivered = 0u64;

    while let Some(packet) = recv_or_stop(&mut input, &stop).await {
        let sends = consumers.iter().map(|tx| tx.send(packet.clone()));
        let Some(results) = until_stopped(&stop, join_all(sends)).await else {
            break;
        };

        let mut idx = 0;
        consumers.retain(|_| {
            let open = results[idx].is_ok();
            if !open {
                warn!("[{name}] consumer {idx} went away, dropping it");
            }
            idx += 1;
            open
        });
        if consumers.is_empty() {
            warn!("[{name}] no consumers left");
            break;
        }
        delivered += 1;
    }

    debug!("[{name}] delivered {delivered} packet(s)");
    // Dropping `consumers` closes every consumer stream.
}
