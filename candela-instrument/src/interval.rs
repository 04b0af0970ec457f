use crate::error::InstrumentError;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Candlestick interval period.
///
/// The set matches what the daily archive packages: `1s` through `1d`.
/// `1s` data only exists for spot markets; that constraint is enforced by
/// [`MarketType::supports_interval`](crate::market::MarketType::supports_interval).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    /// All supported intervals, shortest first.
    pub const ALL: [Interval; 13] = [
        Interval::S1,
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
    ];

    /// Return the wire/path representation of this [`Interval`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::S1 => "1s",
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
        }
    }

    /// Exact duration of one candle of this interval.
    pub fn duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.num_seconds())
    }

    /// Duration of one candle in whole seconds.
    pub fn num_seconds(&self) -> i64 {
        match self {
            Interval::S1 => 1,
            Interval::M1 => 60,
            Interval::M3 => 3 * 60,
            Interval::M5 => 5 * 60,
            Interval::M15 => 15 * 60,
            Interval::M30 => 30 * 60,
            Interval::H1 => 3_600,
            Interval::H2 => 2 * 3_600,
            Interval::H4 => 4 * 3_600,
            Interval::H6 => 6 * 3_600,
            Interval::H8 => 8 * 3_600,
            Interval::H12 => 12 * 3_600,
            Interval::D1 => 86_400,
        }
    }

    /// Duration of one candle in nanoseconds.
    pub fn num_nanos(&self) -> i64 {
        self.num_seconds() * 1_000_000_000
    }

    /// Number of candles contained in one UTC day.
    pub fn candles_per_day(&self) -> i64 {
        86_400 / self.num_seconds()
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .find(|interval| interval.as_str() == s)
            .copied()
            .ok_or_else(|| InstrumentError::UnknownInterval(s.to_string()))
    }
}
