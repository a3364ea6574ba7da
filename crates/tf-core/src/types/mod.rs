//! Core data types: packets, payloads, market data and trading decisions.

pub mod market_data;
pub mod packet;
pub mod trading;

pub use market_data::*;
pub use packet::*;
pub use trading::*;
