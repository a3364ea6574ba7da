//! Stored bar repositories.
//!
//! [`StockRepository`] is the capability set a fetch stage needs from a bar
//! store. Production stores live outside this workspace; [`MemoryRepository`]
//! keeps bars in memory and backs tests and the demo runner.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tf_core::StockDocument;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepositoryError {
    /// A read was attempted before `set_target`.
    #[error("no target selected")]
    NoTarget,

    /// The requested range runs past the stored bars.
    #[error("range {start}+{count} exceeds {len} stored bars")]
    OutOfRange { start: usize, count: usize, len: usize },

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to stored bars for one product and interval at a time.
///
/// Documents are ordered by ascending timestamp; indexes refer to that order.
#[async_trait]
pub trait StockRepository: Send + Sync {
    /// Select the product and bar interval subsequent calls read from.
    fn set_target(&mut self, product_id: &str, time_slice: &str);

    /// Number of stored bars for the current target.
    async fn count(&self) -> Result<usize, RepositoryError>;

    /// Index of the latest bar whose timestamp is at or before `timestamp`.
    /// Timestamps before the first bar resolve to 0.
    async fn find_latest_index_by(&self, timestamp: i64) -> Result<usize, RepositoryError>;

    /// Visit `count` bars starting at index `start`, in order.
    fn documents(&self, start: usize, count: usize) -> BoxStream<'_, Result<StockDocument, RepositoryError>>;
}

/// In-memory bar store keyed by `(product_id, time_slice)`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    series: HashMap<(String, String), Vec<StockDocument>>,
    target: Option<(String, String)>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bars for a product and interval. Bars are kept sorted by timestamp.
    pub fn insert(&mut self, product_id: &str, time_slice: &str, mut docs: Vec<StockDocument>) {
        docs.sort_by_key(|d| d.timestamp);
        self.series.insert((product_id.to_string(), time_slice.to_string()), docs);
    }

    pub fn with_series(mut self, product_id: &str, time_slice: &str, docs: Vec<StockDocument>) -> Self {
        self.insert(product_id, time_slice, docs);
        self
    }

    fn current(&self) -> Result<&[StockDocument], RepositoryError> {
        let target = self.target.as_ref().ok_or(RepositoryError::NoTarget)?;
        Ok(self.series.get(target).map(Vec::as_slice).unwrap_or(&[]))
    }
}

#[async_trait]
impl StockRepository for MemoryRepository {
    fn set_target(&mut self, product_id: &str, time_slice: &str) {
        self.target = Some((product_id.to_string(), time_slice.to_string()));
    }

    async fn count(&self) -> Result<usize, RepositoryError> {
        Ok(self.current()?.len())
    }

    async fn find_latest_index_by(&self, timestamp: i64) -> Result<usize, RepositoryError> {
        let docs = self.current()?;
        Ok(docs.partition_point(|d| d.timestamp <= timestamp).saturating_sub(1))
    }

    fn documents(&self, start: usize, count: usize) -> BoxStream<'_, Result<StockDocument, RepositoryError>> {
        let docs = match self.current() {
            Ok(docs) => docs,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        match start.checked_add(count).and_then(|end| docs.get(start..end)) {
            Some(range) => stream::iter(range.iter().copied().map(Ok)).boxed(),
            None => {
                let err = RepositoryError::OutOfRange {
                    start,
                    count,
                    len: docs.len(),
                };
                stream::once(async move { Err(err) }).boxed()
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn bar(timestamp: i64, close: f32) -> StockDocument {
    StockDocument {
        timestamp,
        open: close - 1.0,
        close,
        high: close + 1.0,
        low: close - 2.0,
        volume: 100,
    }
}
