//! Product / interval selection shared by the fetch stages.

use tf_core::error::ConfigError;
use tf_core::options::{StageOptions, keys};

/// Bar interval used when `timeSlice` is not given.
pub const DEFAULT_TIME_SLICE: &str = "1m";

/// Which series a fetch stage reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub product_id: String,
    pub time_slice: String,
    /// `time_slice` in seconds; added to a bar's open time to close it.
    pub slice_secs: i64,
}

impl Target {
    /// Extract from options. `productId` is required.
    pub fn from_options(options: &StageOptions) -> Result<Self, ConfigError> {
        let product_id = options.require(keys::PRODUCT_ID)?.to_string();
        let time_slice = options.get(keys::TIME_SLICE).unwrap_or(DEFAULT_TIME_SLICE).to_string();
        let slice = options
            .duration(keys::TIME_SLICE)?
            .or_else(|| tf_core::options::parse_duration(DEFAULT_TIME_SLICE))
            .unwrap_or_default();
        let slice_secs = i64::try_from(slice.as_secs()).map_err(|_| ConfigError::InvalidOption {
            key: keys::TIME_SLICE.to_string(),
            value: time_slice.clone(),
            reason: "interval too large".to_string(),
        })?;

        Ok(Self {
            product_id,
            time_slice,
            slice_secs,
        })
    }
}
