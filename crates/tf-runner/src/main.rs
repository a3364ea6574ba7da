//! # tf-runner
//!
//! Main entry point for the tradeflow worker.
//!
//! Loads a JSON configuration file, builds the fetch stage and the demo
//! model/adapter/analyzer stages, wires them into a pipeline and runs it
//! until Ctrl+C or until the pipeline halts on its own.
//!
//! # Usage
//!
//! ```bash
//! tf-runner demos/backtest.json --log-level info
//! ```

mod data;
mod strategy;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tf_core::Task;
use tf_core::config::FetchKind;
use tf_core::logging::{LogOptions, init_logging};
use tf_core::options::keys;
use tf_md::broker::{EventConsumer, MemoryConsumer};
use tf_md::target::DEFAULT_TIME_SLICE;
use tf_pipeline::{LogSink, Pipeline, PipelineOptions, TransmitStage};
use tracing::{error, info};

/// Frames buffered between the feed replay and the realtime fetch stage.
const FEED_CAPACITY: usize = 64;

/// Tradeflow pipeline worker.
#[derive(Parser)]
#[command(name = "tf-runner", about = "Tradeflow pipeline worker")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output. Overrides `worker.log_path`.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit JSON log lines on the console.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = tf_core::config::load_config(&cli.config)?;
    let worker = config.worker.name();

    // 2. Initialize logging
    init_logging(&LogOptions {
        level: &cli.log_level,
        dir: cli.log_dir.as_deref().or(config.worker.log_path.as_deref()),
        file_prefix: &worker,
        json: cli.json_logs,
    })?;
    info!(
        "{worker} starting, config={}, log_level={}, fetch={:?}",
        cli.config.display(),
        cli.log_level,
        config.fetch.kind
    );

    // 3. Collaborators for the fetch stage
    let options = &config.fetch.options;
    let product_id = options.require(keys::PRODUCT_ID)?.to_string();
    let time_slice = options.get(keys::TIME_SLICE).unwrap_or(DEFAULT_TIME_SLICE);
    let repo = data::load_repository(config.data.documents.as_deref(), &product_id, time_slice)?;

    let mut feed_task = None;
    let mut _idle_feed = None;
    let (consumer, task) = match config.fetch.kind {
        FetchKind::Past => (None, Task::BackTest),
        FetchKind::Realtime => {
            let (feed, consumer) = MemoryConsumer::channel(FEED_CAPACITY);
            let topic = options.get(keys::TOPIC).unwrap_or(product_id.as_str()).to_string();
            match config.data.feed.clone() {
                Some(path) => feed_task = Some(data::spawn_feed_replay(path, topic, feed)),
                // Keep the feed open so the fetch stage waits like it would on a quiet broker.
                None => _idle_feed = Some(feed),
            }
            (Some(Box::new(consumer) as Box<dyn EventConsumer>), Task::Trade)
        }
    };

    // 4. Build the pipeline
    let fetch = tf_md::registry::create_fetcher(&config.fetch, Box::new(repo), consumer)?;
    let pipeline_options = PipelineOptions {
        joiner: config.joiner,
        error_policy: config.pipeline.error_policy,
    };
    let analyze = Box::new(strategy::analyzer(&product_id, task));
    let transmit = Box::new(TransmitStage::new(LogSink));
    let mut pipeline = if config.pipeline.with_adapter {
        Pipeline::with_adapter(
            fetch,
            Box::new(strategy::model()),
            Box::new(strategy::adapter()),
            analyze,
            transmit,
            pipeline_options,
        )?
    } else {
        Pipeline::without_adapter(fetch, Box::new(strategy::model()), analyze, transmit, pipeline_options)?
    };

    // 5. Run until Ctrl+C or halt
    pipeline.run()?;
    info!(
        "pipeline {} running ({:?}), press Ctrl+C to stop",
        pipeline.run_id(),
        pipeline.topology()
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
        _ = pipeline.halted() => info!("pipeline halted"),
    }

    // 6. Stop every stage
    if let Err(e) = pipeline.stop().await {
        error!("pipeline did not stop cleanly: {e}");
    }
    if let Some(task) = feed_task {
        task.abort();
    }

    let fatal = pipeline.fault_summary().map_or(0, |s| s.fatal);
    if fatal > 0 {
        bail!("pipeline stopped after {fatal} fatal fault(s)");
    }
    info!("{worker} stopped");
    Ok(())
}
