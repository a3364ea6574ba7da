//! Configuration for the tradeflow worker.
//!
//! The worker reads a single JSON file. Each section configures one part of
//! the pipeline; externally supplied stages get a flat option map.
//!
//! # Example
//!
//! ```json
//! {
//!   "worker":   { "name": "aapl-backtest", "log_path": "/tmp/log" },
//!   "pipeline": { "with_adapter": true, "error_policy": "halt_on_fatal" },
//!   "fetch": {
//!     "kind": "past",
//!     "options": { "productId": "stock.aapl.usa", "timeSlice": "1m", "startDate": "1700000000" }
//!   },
//!   "joiner":   { "report_unmatched": false, "evict_stale": true },
//!   "data":     { "documents": "bars.json" }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::options::StageOptions;

/// Top-level worker config.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerMeta,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    pub fetch: FetchConfig,

    #[serde(default)]
    pub joiner: JoinerConfig,

    /// Where the bundled in-memory collaborators load their data from.
    #[serde(default)]
    pub data: DataConfig,
}

/// Worker metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerMeta {
    pub name: Option<String>,
    pub log_path: Option<String>,
}

impl WorkerMeta {
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "tradeflow".to_string())
    }
}

/// What the orchestrator does with a fatal stage fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log it and keep running.
    Continue,
    /// Log it and signal the pipeline to halt.
    #[default]
    HaltOnFatal,
}

/// Orchestrator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Build the topology with an adapter between model and joiner.
    #[serde(default = "default_true")]
    pub with_adapter: bool,

    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            with_adapter: true,
            error_policy: ErrorPolicy::default(),
        }
    }
}

/// Which fetch implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    /// Replay stored bars from the repository.
    Past,
    /// Prefetch stored bars, then follow the broker feed.
    Realtime,
}

/// Fetch stage selection plus its flat options.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    pub kind: FetchKind,
    #[serde(default)]
    pub options: StageOptions,
}

/// Sequence joiner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct JoinerConfig {
    /// Report entries that never met their counterpart as recoverable faults.
    #[serde(default)]
    pub report_unmatched: bool,

    /// Drop pending entries the opposite side has already moved past.
    #[serde(default = "default_true")]
    pub evict_stale: bool,
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            report_unmatched: false,
            evict_stale: true,
        }
    }
}

/// Data files for the in-memory repository and broker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataConfig {
    /// JSON array of stored bars.
    pub documents: Option<PathBuf>,
    /// JSON-lines file replayed as broker frames.
    pub feed: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Load and parse a JSON config file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::File(format!("{}: {e}", path.display())))?;
    parse_config(&content)
}

/// Parse a config from a JSON string.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    serde_json::from_str(content).map_err(|e| ConfigError::File(e.to_string()))
}
