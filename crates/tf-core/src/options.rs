//! Flat string-keyed options handed to externally supplied stages.
//!
//! Stage constructors pull what they need with [`StageOptions::require`] and
//! friends; a missing required key surfaces as
//! [`ConfigError::MissingOption`] at construction time.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Well-known option keys.
pub mod keys {
    pub const PRODUCT_ID: &str = "productId";
    pub const START_DATE: &str = "startDate";
    pub const END_DATE: &str = "endDate";
    pub const TIME_SLICE: &str = "timeSlice";
    pub const PREFETCH: &str = "prefetch";
    pub const TOPIC: &str = "topic";
    pub const PING_TIMEOUT_MS: &str = "pingTimeoutMs";
}

/// A stage's option set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct StageOptions(HashMap<String, String>);

impl StageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// The value for `key`, treating an empty string as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }

    /// The value for `key`, or [`ConfigError::MissingOption`].
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingOption(key.to_string()))
    }

    /// Parse an optional value.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidOption {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Parse an optional duration such as `"1m"`, `"30s"`, `"4h"`, `"1d"`.
    pub fn duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        self.get(key)
            .map(|raw| {
                parse_duration(raw).ok_or_else(|| ConfigError::InvalidOption {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: "expected <number><s|m|h|d>".to_string(),
                })
            })
            .transpose()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StageOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Parse a bar-interval string: a positive integer followed by `s`, `m`, `h`
/// or `d`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = raw.split_at(split);
    let n: u64 = num.parse().ok().filter(|n| *n > 0)?;
    let secs = match unit {
        "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3_600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_reports_missing_and_empty() {
        let opts = StageOptions::new().with(keys::PRODUCT_ID, "  ");
        assert!(matches!(
            opts.require(keys::PRODUCT_ID),
            Err(ConfigError::MissingOption(k)) if k == "productId"
        ));
        let opts = opts.with(keys::PRODUCT_ID, "stock.aapl.usa");
        assert_eq!(opts.require(keys::PRODUCT_ID).unwrap(), "stock.aapl.usa");
    }

    #[test]
    fn parse_numbers() {
        let opts: StageOptions = [("startDate", "1700000000"), ("prefetch", "ten")].into_iter().collect();
        assert_eq!(opts.parse::<i64>(keys::START_DATE).unwrap(), Some(1_700_000_000));
        assert_eq!(opts.parse::<i64>(keys::END_DATE).unwrap(), None);
        assert!(matches!(
            opts.parse::<usize>(keys::PREFETCH),
            Err(ConfigError::InvalidOption { key, .. }) if key == "prefetch"
        ));
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("4h"), Some(Duration::from_secs(14_400)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("0m"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("5w"), None);
        assert_eq!(parse_duration("300000000000000d"), None);
    }

    #[test]
    fn oversized_duration_is_invalid() {
        let opts = StageOptions::new().with(keys::TIME_SLICE, "300000000000000d");
        assert!(matches!(
            opts.duration(keys::TIME_SLICE),
            Err(ConfigError::InvalidOption { key, .. }) if key == "timeSlice"
        ));
    }
}
