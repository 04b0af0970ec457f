use crate::{interval::Interval, market::MarketType};
use thiserror::Error;

/// Validation errors for instrument vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    #[error("invalid symbol '{symbol}': {reason}")]
    InvalidSymbol { symbol: String, reason: String },

    #[error("interval {interval} is not supported on {market} markets")]
    UnsupportedInterval {
        interval: Interval,
        market: MarketType,
    },

    #[error("unknown interval '{0}'")]
    UnknownInterval(String),

    #[error("unknown market type '{0}'")]
    UnknownMarketType(String),
}
