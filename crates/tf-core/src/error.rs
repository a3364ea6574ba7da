//! Typed error definitions for the tradeflow worker.
//!
//! Errors fall into four groups, matching when they can happen:
//!
//! - [`ConfigError`]: a stage or the worker was constructed with bad options.
//! - [`WiringError`]: two adjacent stages disagree on payload kind; raised
//!   while the pipeline is being built.
//! - [`StageError`]: something went wrong inside a running stage. These are
//!   wrapped in a [`StageFault`] and reported on the stage's fault stream.
//! - [`ShutdownError`]: one or more stages failed to close cleanly.
//!
//! [`PipelineError`] is the umbrella returned by the orchestrator.

use std::fmt;

use thiserror::Error;

use crate::types::PayloadKind;

/// Bad or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required option key was absent or empty.
    #[error("missing required option `{0}`")]
    MissingOption(String),

    /// An option was present but could not be parsed.
    #[error("invalid option `{key}`={value:?}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    /// The config file could not be read or parsed.
    #[error("config file error: {0}")]
    File(String),
}

/// Adjacent stages whose payload kinds do not line up.
#[derive(Debug, Clone, Error)]
#[error("cannot wire {upstream} -> {downstream}: {upstream} produces {produced}, {downstream} expects {expected}")]
pub struct WiringError {
    pub upstream: String,
    pub downstream: String,
    pub produced: PayloadKind,
    pub expected: PayloadKind,
}

/// Which joiner input a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    Reference,
    Model,
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Model => write!(f, "model"),
        }
    }
}

/// Errors raised by a stage, at runtime or through lifecycle misuse.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    /// Reading from the upstream data repository failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// The message broker failed (subscribe, receive, health probe).
    #[error("broker error: {0}")]
    Broker(String),

    /// A message could not be decoded into a domain event.
    #[error("decode error: {0}")]
    Decode(String),

    /// A packet carried a payload kind the stage does not accept.
    #[error("sequence {sequence}: expected {expected} payload, got {actual}")]
    KindMismatch {
        sequence: i64,
        expected: PayloadKind,
        actual: PayloadKind,
    },

    /// A joiner entry was dropped without ever meeting its counterpart.
    #[error("sequence {sequence} on {side} input was never matched")]
    Unmatched { sequence: i64, side: JoinSide },

    /// A transform (model, adapter, analyzer) rejected its input.
    #[error("transform error: {0}")]
    Transform(String),

    /// The order sink refused an event.
    #[error("sink error: {0}")]
    Sink(String),

    #[error("input already set")]
    InputAlreadySet,

    #[error("input not set before execute")]
    InputMissing,

    #[error("stage already executed")]
    AlreadyExecuted,

    /// The stage's task panicked instead of exiting.
    #[error("stage task panicked: {0}")]
    Panicked(String),

    /// The stage's task was cancelled by the runtime before it finished.
    #[error("stage task cancelled: {0}")]
    Cancelled(String),
}

/// How bad a runtime fault is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The offending item was skipped; the stage keeps running.
    Recoverable,
    /// The stage's loop has ended because of this fault.
    Fatal,
}

/// A runtime error reported on a stage's fault stream.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{stage}] {error}")]
pub struct StageFault {
    pub stage: String,
    pub error: StageError,
    pub severity: Severity,
}

impl StageFault {
    pub fn recoverable(stage: impl Into<String>, error: StageError) -> Self {
        Self {
            stage: stage.into(),
            error,
            severity: Severity::Recoverable,
        }
    }

    pub fn fatal(stage: impl Into<String>, error: StageError) -> Self {
        Self {
            stage: stage.into(),
            error,
            severity: Severity::Fatal,
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

/// Every stage that failed to close, in close order.
#[derive(Debug)]
pub struct ShutdownError {
    pub failures: Vec<(String, StageError)>,
}

impl ShutdownError {
    /// Names of the stages that failed.
    pub fn stages(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage(s) failed to shut down", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, "; {name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

/// Errors returned by the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("wiring error: {0}")]
    Wiring(#[from] WiringError),

    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    #[error("shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),
}
