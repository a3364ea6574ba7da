//! # tf-md
//!
//! Market data fetch stages for the tradeflow pipeline.
//!
//! ## Architecture
//!
//! A fetch stage is the pipeline's source: it reads bars from a
//! [`repository::StockRepository`] and, for the realtime variant, follows a
//! [`broker::EventConsumer`] topic. Either way it emits `Aggregate` packets
//! numbered from 0 on its output stream.
//!
//! ## Modules
//!
//! - [`past`]: replay stored bars over a date range
//! - [`realtime`]: prefetch stored bars, then follow the live feed
//! - [`repository`]: repository trait and in-memory store
//! - [`broker`]: broker consumer trait and in-memory feed
//! - [`registry`]: build the configured fetch stage

pub mod broker;
pub mod past;
pub mod realtime;
pub mod registry;
pub mod repository;
pub mod target;

pub use past::PastStockFetcher;
pub use realtime::RealtimeStockFetcher;
