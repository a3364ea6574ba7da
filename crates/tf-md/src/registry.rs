//! Fetch stage registry: factory for building the fetch stage from config.

use tf_core::config::{FetchConfig, FetchKind};
use tf_core::error::ConfigError;
use tf_core::stage::Stage;

use crate::broker::EventConsumer;
use crate::past::PastStockFetcher;
use crate::realtime::RealtimeStockFetcher;
use crate::repository::StockRepository;

/// Create the fetch stage selected by `config.kind`.
///
/// The realtime fetcher needs a broker consumer; asking for it without one is
/// a configuration error.
pub fn create_fetcher(
    config: &FetchConfig,
    repo: Box<dyn StockRepository>,
    consumer: Option<Box<dyn EventConsumer>>,
) -> Result<Box<dyn Stage>, ConfigError> {
    match config.kind {
        FetchKind::Past => Ok(Box::new(PastStockFetcher::new(repo, &config.options)?)),
        FetchKind::Realtime => {
            let consumer = consumer.ok_or_else(|| ConfigError::MissingOption("broker".to_string()))?;
            Ok(Box::new(RealtimeStockFetcher::new(repo, consumer, &config.options)?))
        }
    }
}
