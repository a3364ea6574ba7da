//! Market data structures: what the fetch stages read and emit.
//!
//! # Timestamp convention
//!
//! All timestamps are **seconds since Unix epoch**, matching the granularity
//! of the upstream bar store.

use serde::{Deserialize, Serialize};

/// One OHLCV bar as stored by a stock repository.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StockDocument {
    /// Bar open time (unix seconds).
    pub timestamp: i64,
    pub open: f32,
    pub close: f32,
    pub high: f32,
    pub low: f32,
    pub volume: i64,
}

/// One OHLCV bar as it flows through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StockAggregate {
    pub open_time: i64,
    pub closed_time: i64,
    pub open: f32,
    pub closed: f32,
    pub high: f32,
    pub low: f32,
    pub volume: f32,
}

impl StockAggregate {
    /// Convert a stored bar, closing it `slice_secs` after it opened.
    pub fn from_document(doc: &StockDocument, slice_secs: i64) -> Self {
        Self {
            open_time: doc.timestamp,
            closed_time: doc.timestamp.saturating_add(slice_secs),
            open: doc.open,
            closed: doc.close,
            high: doc.high,
            low: doc.low,
            volume: doc.volume as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_from_document() {
        let doc = StockDocument {
            timestamp: 1_700_000_000,
            open: 12.0,
            close: 150.0,
            high: 150.0,
            low: 23.0,
            volume: 12,
        };
        let agg = StockAggregate::from_document(&doc, 60);
        assert_eq!(agg.open_time, 1_700_000_000);
        assert_eq!(agg.closed_time, 1_700_000_060);
        assert_eq!(agg.closed, 150.0);
        assert_eq!(agg.volume, 12.0);
    }
}
