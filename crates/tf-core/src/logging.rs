//! Logging initialization using the `tracing` ecosystem.
//!
//! - Console output, human-readable or JSON
//! - Optional file output with daily rotation via `tracing-appender`
//! - Level from `RUST_LOG` if set, otherwise the explicit default

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging settings, usually straight from the CLI.
#[derive(Debug, Clone)]
pub struct LogOptions<'a> {
    /// Default level if `RUST_LOG` is not set (e.g. `"info"`).
    pub level: &'a str,
    /// Directory for daily-rotating log files.
    pub dir: Option<&'a str>,
    /// Log file prefix, usually the worker name.
    pub file_prefix: &'a str,
    /// Emit JSON lines on the console instead of text.
    pub json: bool,
}

/// Initialize the global tracing subscriber. Call once at program start.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(opts: &LogOptions<'_>) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.level));

    let file_layer = opts.dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, opts.file_prefix);
        fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
    });

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);

    if opts.json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true))
            .try_init()
    }
}
