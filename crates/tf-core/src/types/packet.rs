//! The packet: the unit of data moving between pipeline stages.
//!
//! A [`Packet`] carries a `sequence` correlation key and a [`Payload`]. The
//! payload is a closed tagged union: the producing stage picks the variant,
//! and every stage declares up front which [`PayloadKind`] it emits and
//! accepts, so wiring can be checked before anything runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::market_data::StockAggregate;
use super::trading::OrderEvent;

/// One item on a stage stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Join / ordering key. Non-decreasing within one stream.
    pub sequence: i64,
    pub data: Payload,
}

impl Packet {
    pub fn new(sequence: i64, data: Payload) -> Self {
        Self { sequence, data }
    }

    #[inline]
    pub fn kind(&self) -> PayloadKind {
        self.data.kind()
    }
}

/// Payload variants known to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// One OHLCV bar from the fetch stage.
    Aggregate(StockAggregate),
    /// Raw model output vector, before any adapter runs.
    ModelOutput(Vec<f64>),
    /// Adapted model output.
    Prediction(Prediction),
    /// Reference and model payloads that shared a sequence.
    Pair(Box<Pair>),
    /// A trading decision ready for transmission.
    OrderEvent(OrderEvent),
    /// A bare scalar.
    Value(f64),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Aggregate(_) => PayloadKind::Aggregate,
            Self::ModelOutput(_) => PayloadKind::ModelOutput,
            Self::Prediction(_) => PayloadKind::Prediction,
            Self::Pair(_) => PayloadKind::Pair,
            Self::OrderEvent(_) => PayloadKind::OrderEvent,
            Self::Value(_) => PayloadKind::Value,
        }
    }

    /// Build a `Pair` payload.
    pub fn pair(ref_data: Payload, model_data: Payload) -> Self {
        Self::Pair(Box::new(Pair {
            ref_data,
            model_data,
        }))
    }
}

/// Discriminant of [`Payload`], used for wiring checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Aggregate,
    ModelOutput,
    Prediction,
    Pair,
    OrderEvent,
    Value,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aggregate => "aggregate",
            Self::ModelOutput => "model_output",
            Self::Prediction => "prediction",
            Self::Pair => "pair",
            Self::OrderEvent => "order_event",
            Self::Value => "value",
        };
        f.write_str(s)
    }
}

/// Output of the sequence joiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub ref_data: Payload,
    pub model_data: Payload,
}

/// Model output after adaptation: a single signed score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub score: f64,
}
