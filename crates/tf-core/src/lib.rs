//! # tf-core
//!
//! Core crate for the tradeflow worker, providing:
//!
//! - **Types** (`types`): packets, the payload union, market data and order events
//! - **Stage contract** (`stage`): the `Stage` / `Downstream` traits, stream
//!   constructors and the shared `StageWorker` lifecycle
//! - **Cancellation** (`stop`): the idempotent multi-observer `StopNotifier`
//! - **Error types** (`error`): configuration, wiring, runtime and shutdown errors
//! - **Options** (`options`): flat per-stage option maps
//! - **Configuration** (`config`): JSON worker config
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod options;
pub mod stage;
pub mod stop;
pub mod types;

// Re-export types at crate root for convenience.
pub use types::*;
