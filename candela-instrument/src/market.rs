use crate::{error::InstrumentError, interval::Interval, provider::Provider};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Market segment a symbol trades on.
///
/// Drives both the archive URL path (`spot`, `futures/um`, `futures/cm`)
/// and the REST endpoint the live adapter talks to.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// Spot market. Supports every interval including `1s`.
    #[display("spot")]
    Spot,
    /// USDT-margined perpetual futures ("UM").
    #[display("futures_usdt")]
    FuturesUsdt,
    /// Coin-margined perpetual futures ("CM"). Symbols carry a `_PERP`
    /// suffix in canonical form.
    #[display("futures_coin")]
    FuturesCoin,
}

impl MarketType {
    /// Return the &str representation of this [`MarketType`], as used in
    /// cache paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::FuturesUsdt => "futures_usdt",
            MarketType::FuturesCoin => "futures_coin",
        }
    }

    /// Path segment identifying this market in the bulk archive URL scheme.
    pub fn archive_path(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::FuturesUsdt => "futures/um",
            MarketType::FuturesCoin => "futures/cm",
        }
    }

    /// Base URL of the primary REST endpoint for this market.
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            MarketType::Spot => "https://api.binance.com",
            MarketType::FuturesUsdt => "https://fapi.binance.com",
            MarketType::FuturesCoin => "https://dapi.binance.com",
        }
    }

    /// Base URL of the market-data-only REST endpoint, where one exists.
    ///
    /// Only the spot API exposes a dedicated data host; futures requests go
    /// through the primary endpoint.
    pub fn rest_data_only_url(&self) -> Option<&'static str> {
        match self {
            MarketType::Spot => Some("https://data-api.binance.vision"),
            MarketType::FuturesUsdt | MarketType::FuturesCoin => None,
        }
    }

    /// Path of the klines endpoint on this market's REST server.
    pub fn klines_path(&self) -> &'static str {
        match self {
            MarketType::Spot => "/api/v3/klines",
            MarketType::FuturesUsdt => "/fapi/v1/klines",
            MarketType::FuturesCoin => "/dapi/v1/klines",
        }
    }

    /// Maximum number of rows one klines page may return on this market.
    pub fn max_page_limit(&self) -> u32 {
        match self {
            MarketType::Spot => 1_000,
            MarketType::FuturesUsdt | MarketType::FuturesCoin => 1_500,
        }
    }

    /// Whether candles of `interval` exist on this market.
    ///
    /// `1s` candles are published for spot only.
    pub fn supports_interval(&self, interval: Interval) -> bool {
        match self {
            MarketType::Spot => true,
            MarketType::FuturesUsdt | MarketType::FuturesCoin => interval != Interval::S1,
        }
    }
}

impl FromStr for MarketType {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(MarketType::Spot),
            "futures_usdt" | "um" => Ok(MarketType::FuturesUsdt),
            "futures_coin" | "cm" => Ok(MarketType::FuturesCoin),
            other => Err(InstrumentError::UnknownMarketType(other.to_string())),
        }
    }
}

/// Nature of the packaged data.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum DataNature {
    #[display("klines")]
    Klines,
}

impl DataNature {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataNature::Klines => "klines",
        }
    }
}

/// Packaging frequency of the bulk archive files.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Packaging {
    #[display("daily")]
    Daily,
}

impl Packaging {
    pub fn as_str(&self) -> &'static str {
        match self {
            Packaging::Daily => "daily",
        }
    }
}

/// Composite descriptor keying both the cache path and the archive URL.
///
/// E.g. `(binance, spot, klines, daily)`.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Constructor,
)]
pub struct MarketDescriptor {
    pub provider: Provider,
    pub market_type: MarketType,
    pub data_nature: DataNature,
    pub packaging: Packaging,
}

impl MarketDescriptor {
    /// Descriptor for daily-packaged klines on the given market.
    pub fn klines_daily(provider: Provider, market_type: MarketType) -> Self {
        Self {
            provider,
            market_type,
            data_nature: DataNature::Klines,
            packaging: Packaging::Daily,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_paths() {
        assert_eq!(MarketType::Spot.archive_path(), "spot");
        assert_eq!(MarketType::FuturesUsdt.archive_path(), "futures/um");
        assert_eq!(MarketType::FuturesCoin.archive_path(), "futures/cm");
    }

    #[test]
    fn test_second_interval_is_spot_only() {
        assert!(MarketType::Spot.supports_interval(Interval::S1));
        assert!(!MarketType::FuturesUsdt.supports_interval(Interval::S1));
        assert!(!MarketType::FuturesCoin.supports_interval(Interval::S1));
        assert!(MarketType::FuturesUsdt.supports_interval(Interval::M1));
    }

    #[test]
    fn test_page_limits() {
        assert_eq!(MarketType::Spot.max_page_limit(), 1_000);
        assert_eq!(MarketType::FuturesCoin.max_page_limit(), 1_500);
    }

    #[test]
    fn test_market_type_from_str_aliases() {
        assert_eq!(MarketType::from_str("um").unwrap(), MarketType::FuturesUsdt);
        assert_eq!(MarketType::from_str("CM").unwrap(), MarketType::FuturesCoin);
        assert!(MarketType::from_str("margin").is_err());
    }

    #[test]
    fn test_descriptor_path_components() {
        let descriptor = MarketDescriptor::klines_daily(Provider::Binance, MarketType::Spot);
        assert_eq!(descriptor.provider.as_str(), "binance");
        assert_eq!(descriptor.market_type.as_str(), "spot");
        assert_eq!(descriptor.data_nature.as_str(), "klines");
        assert_eq!(descriptor.packaging.as_str(), "daily");
    }
}
