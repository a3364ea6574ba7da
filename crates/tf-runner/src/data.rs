//! Data files behind the in-memory repository and broker.
//!
//! - documents: a JSON array of stored bars, loaded into a [`MemoryRepository`]
//! - feed: JSON lines, one aggregate per line, replayed onto a [`MemoryFeed`]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tf_core::StockDocument;
use tf_md::broker::MemoryFeed;
use tf_md::repository::MemoryRepository;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Gap between replayed feed frames.
pub const REPLAY_INTERVAL: Duration = Duration::from_millis(50);

/// Build the repository for one product. No file means an empty store.
pub fn load_repository(path: Option<&Path>, product_id: &str, time_slice: &str) -> Result<MemoryRepository> {
    let Some(path) = path else {
        warn!("no documents file configured, repository is empty");
        return Ok(MemoryRepository::new());
    };
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let docs = parse_documents(&content).with_context(|| format!("parsing {}", path.display()))?;
    info!("loaded {} bar(s) for {product_id}/{time_slice} from {}", docs.len(), path.display());
    Ok(MemoryRepository::new().with_series(product_id, time_slice, docs))
}

pub fn parse_documents(content: &str) -> Result<Vec<StockDocument>> {
    Ok(serde_json::from_str(content)?)
}

/// Non-empty, non-comment lines of a feed file.
pub fn feed_frames(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Publish every line of `path` on `topic`, then end the feed.
///
/// Lines are sent as-is, so a malformed line reaches the fetch stage and is
/// reported there as a decode fault.
pub fn spawn_feed_replay(path: PathBuf, topic: String, feed: MemoryFeed) -> JoinHandle<()> {
    tokio::spawn(async move {
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("feed file {} unreadable: {e}", path.display());
                return;
            }
        };

        let mut published = 0usize;
        for frame in feed_frames(&content) {
            if let Err(e) = feed.publish(&topic, frame).await {
                warn!("feed replay stopped: {e}");
                break;
            }
            published += 1;
            tokio::time::sleep(REPLAY_INTERVAL).await;
        }
        info!("feed replay finished, {published} frame(s) on {topic}");
    })
}
