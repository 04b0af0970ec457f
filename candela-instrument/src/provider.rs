use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Unique identifier for a historical market data provider.
///
/// Currently only Binance publishes both a bulk daily archive and a klines
/// REST endpoint in the shape this stack consumes. The enum exists so the
/// cache path schema stays stable if further providers are added.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[display("binance")]
    Binance,
}

impl Provider {
    /// Return the &str representation of this [`Provider`], as used in cache
    /// paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Binance => "binance",
        }
    }
}
