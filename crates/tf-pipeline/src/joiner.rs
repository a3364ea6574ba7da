//! Pair up reference and model packets that share a sequence number.
//!
//! ```text
//! reference ──(S, ref)───┐
//!                        ├──► (S, Pair { ref, model })
//! model ─────(S, model)──┘
//! ```
//!
//! Both inputs are read concurrently. A packet whose counterpart is already
//! pending is emitted at once as a `Pair`; otherwise it waits in its side's
//! pending map. Output follows discovery order, not ascending sequence.
//!
//! Each input is assumed to carry ascending sequences. With `evict_stale`
//! on, an entry is dropped as soon as the other side has moved past its
//! sequence, which keeps the pending maps small when one side filters items.
//! Whatever is still pending once both inputs close is dropped.

use ahash::AHashMap;
use async_trait::async_trait;
use tf_core::config::JoinerConfig;
use tf_core::error::{JoinSide, StageError, StageFault};
use tf_core::stage::{
    FaultReceiver, FaultSender, PacketReceiver, PacketSender, Stage, StageWorker, fault_stream, send_or_stop,
    stream,
};
use tf_core::stop::StopNotifier;
use tf_core::{Packet, Payload, PayloadKind};
use tracing::{debug, info, warn};

/// Two-input stage emitting one `Pair` per sequence present on both inputs.
pub struct SequenceJoiner {
    worker: StageWorker,
    ref_kind: PayloadKind,
    model_kind: PayloadKind,
    config: JoinerConfig,
    ref_input: Option<PacketReceiver>,
    model_input: Option<PacketReceiver>,
    out_tx: Option<PacketSender>,
    out_rx: Option<PacketReceiver>,
    fault_tx: Option<FaultSender>,
    fault_rx: Option<FaultReceiver>,
}

impl SequenceJoiner {
    pub fn new(ref_kind: PayloadKind, model_kind: PayloadKind, config: JoinerConfig) -> Self {
        let (out_tx, out_rx) = stream();
        let (fault_tx, fault_rx) = fault_stream();
        Self {
            worker: StageWorker::new("join"),
            ref_kind,
            model_kind,
            config,
            ref_input: None,
            model_input: None,
            out_tx: Some(out_tx),
            out_rx: Some(out_rx),
            fault_tx: Some(fault_tx),
            fault_rx: Some(fault_rx),
        }
    }

    pub fn ref_kind(&self) -> PayloadKind {
        self.ref_kind
    }

    pub fn model_kind(&self) -> PayloadKind {
        self.model_kind
    }

    pub fn set_ref_input(&mut self, input: PacketReceiver) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        set_once(&mut self.ref_input, input)
    }

    pub fn set_model_input(&mut self, input: PacketReceiver) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        set_once(&mut self.model_input, input)
    }
}

fn set_once(slot: &mut Option<PacketReceiver>, input: PacketReceiver) -> Result<(), StageError> {
    if slot.is_some() {
        return Err(StageError::InputAlreadySet);
    }
    *slot = Some(input);
    Ok(())
}

#[async_trait]
impl Stage for SequenceJoiner {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn output_kind(&self) -> Option<PayloadKind> {
        Some(PayloadKind::Pair)
    }

    fn take_output(&mut self) -> Option<PacketReceiver> {
        self.out_rx.take()
    }

    fn take_faults(&mut self) -> Option<FaultReceiver> {
        self.fault_rx.take()
    }

    fn execute(&mut self) -> Result<(), StageError> {
        self.worker.ensure_not_executed()?;
        if self.ref_input.is_none() || self.model_input.is_none() {
            return Err(StageError::InputMissing);
        }
        let (Some(ref_input), Some(model_input), Some(out), Some(faults)) = (
            self.ref_input.take(),
            self.model_input.take(),
            self.out_tx.take(),
            self.fault_tx.take(),
        ) else {
            return Err(StageError::AlreadyExecuted);
        };

        let join = Join {
            name: self.worker.name().to_string(),
            config: self.config,
            reference: Side::new(JoinSide::Reference, self.ref_kind),
            model: Side::new(JoinSide::Model, self.model_kind),
            out,
            faults,
            stop: self.worker.stop_notifier(),
        };
        self.worker.spawn(join.run(ref_input, model_input))
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let result = self.worker.close().await;
        self.out_tx.take();
        self.fault_tx.take();
        result
    }
}

/// Pending entries and progress of one input.
struct Side {
    side: JoinSide,
    kind: PayloadKind,
    pending: AHashMap<i64, Payload>,
    high_water: Option<i64>,
}

impl Side {
    fn new(side: JoinSide, kind: PayloadKind) -> Self {
        Self {
            side,
            kind,
            pending: AHashMap::new(),
            high_water: None,
        }
    }

    /// The other side will never deliver `sequence` again once it has gone past it.
    fn has_passed(&self, sequence: i64) -> bool {
        self.high_water.is_some_and(|hwm| hwm > sequence)
    }
}

struct Join {
    name: String,
    config: JoinerConfig,
    reference: Side,
    model: Side,
    out: PacketSender,
    faults: FaultSender,
    stop: StopNotifier,
}

impl Join {
    async fn run(mut self, mut ref_input: PacketReceiver, mut model_input: PacketReceiver) {
        let mut ref_open = true;
        let mut model_open = true;
        let mut emitted = 0u64;

        while ref_open || model_open {
            let (side, packet) = tokio::select! {
                _ = self.stop.requested() => {
                    debug!("[{}] stop requested", self.name);
                    return;
                }
                p = ref_input.recv(), if ref_open => match p {
                    Some(p) => (JoinSide::Reference, p),
                    None => {
                        ref_open = false;
                        continue;
                    }
                },
                p = model_input.recv(), if model_open => match p {
                    Some(p) => (JoinSide::Model, p),
                    None => {
                        model_open = false;
                        continue;
                    }
                },
            };

            if let Some(pair) = self.accept(side, packet) {
                if !send_or_stop(&self.out, pair, &self.stop).await {
                    return;
                }
                emitted += 1;
            }
        }

        let leftover = self.reference.pending.len() + self.model.pending.len();
        info!("[{}] inputs closed, emitted {emitted} pair(s), dropping {leftover} unmatched", self.name);
        self.discard_pending();
    }

    /// Take in one packet. Returns the merged packet if it completed a pair.
    fn accept(&mut self, side: JoinSide, packet: Packet) -> Option<Packet> {
        let Packet { sequence, data } = packet;
        let (own, other) = match side {
            JoinSide::Reference => (&mut self.reference, &mut self.model),
            JoinSide::Model => (&mut self.model, &mut self.reference),
        };

        if data.kind() != own.kind {
            warn!(
                "[{}] {side} input sequence {sequence}: expected {}, got {}",
                self.name,
                own.kind,
                data.kind()
            );
            let err = StageError::KindMismatch {
                sequence,
                expected: own.kind,
                actual: data.kind(),
            };
            let _ = self.faults.send(StageFault::recoverable(&self.name, err));
            return None;
        }

        own.high_water = Some(own.high_water.map_or(sequence, |hwm| hwm.max(sequence)));

        if let Some(counterpart) = other.pending.remove(&sequence) {
            let (ref_data, model_data) = match side {
                JoinSide::Reference => (data, counterpart),
                JoinSide::Model => (counterpart, data),
            };
            return Some(Packet::new(sequence, Payload::pair(ref_data, model_data)));
        }

        if !self.config.evict_stale {
            own.pending.insert(sequence, data);
            return None;
        }

        let mut unmatched = Vec::new();
        if other.has_passed(sequence) {
            unmatched.push((sequence, own.side));
        } else {
            own.pending.insert(sequence, data);
        }
        if let Some(hwm) = own.high_water {
            let other_side = other.side;
            other.pending.retain(|&seq, _| {
                let keep = seq >= hwm;
                if !keep {
                    unmatched.push((seq, other_side));
                }
                keep
            });
        }
        for (seq, side) in unmatched {
            self.report_unmatched(seq, side);
        }
        None
    }

    fn discard_pending(&mut self) {
        let mut dropped: Vec<(i64, JoinSide)> = Vec::new();
        for side in [&mut self.reference, &mut self.model] {
            let which = side.side;
            dropped.extend(side.pending.drain().map(|(seq, _)| (seq, which)));
        }
        dropped.sort_unstable_by_key(|(seq, _)| *seq);
        for (seq, side) in dropped {
            self.report_unmatched(seq, side);
        }
    }

    fn report_unmatched(&self, sequence: i64, side: JoinSide) {
        debug!("[{}] dropping unmatched {side} sequence {sequence}", self.name);
        if self.config.report_unmatched {
            let _ = self
                .faults
                .send(StageFault::recoverable(&self.name, StageError::Unmatched { sequence, side }));
        }
    }
}
