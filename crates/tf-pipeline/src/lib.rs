//! # tf-pipeline
//!
//! Stage plumbing and the orchestrator that wires a tradeflow pipeline.
//!
//! - [`mux`]: replicate one stream to several consumers in lockstep
//! - [`joiner`]: pair reference and model packets by sequence
//! - [`transform`]: model, adapter and analyzer stages around a [`transform::Transform`]
//! - [`transmit`]: terminal stage feeding an [`transmit::OrderSink`]
//! - [`supervisor`]: drain fault streams and apply the error policy
//! - [`pipeline`]: build, run and stop one of the two fixed topologies

pub mod joiner;
pub mod mux;
pub mod pipeline;
pub mod supervisor;
pub mod transform;
pub mod transmit;

pub use joiner::SequenceJoiner;
pub use mux::ChannelMux;
pub use pipeline::{Pipeline, PipelineOptions, Topology};
pub use transform::{FnTransform, Transform, TransformStage};
pub use transmit::{LogSink, OrderSink, TransmitStage};
