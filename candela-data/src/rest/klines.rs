use crate::{error::DataError, frame::Candle};
use candela_instrument::Interval;
use chrono::DateTime;
use serde::de::{self, SeqAccess};

/// Raw kline returned by the REST endpoint.
///
/// The endpoint returns klines as positional arrays of mixed types:
/// `[open_time, open, high, low, close, volume, close_time,
/// quote_asset_volume, trade_count, taker_buy_base, taker_buy_quote,
/// ignore]`, with prices and volumes as decimal strings. A custom
/// [`serde::Deserialize`] implementation with a sequence visitor parses each
/// positional element.
#[derive(Debug, Clone, PartialEq)]
pub struct RestKlineRaw {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
    pub quote_asset_volume: String,
    pub trade_count: u64,
    pub taker_buy_base_volume: String,
    pub taker_buy_quote_volume: String,
}

fn next_element<'de, A, T>(seq: &mut A, field: &'static str) -> Result<T, A::Error>
where
    A: SeqAccess<'de>,
    T: serde::Deserialize<'de>,
{
    seq.next_element::<T>()?
        .ok_or_else(|| de::Error::missing_field(field))
}

impl<'de> serde::Deserialize<'de> for RestKlineRaw {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct KlineVisitor;

        impl<'de> de::Visitor<'de> for KlineVisitor {
            type Value = RestKlineRaw;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a kline array with at least 11 elements")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let open_time = next_element(&mut seq, "open_time")?;
                let open = next_element(&mut seq, "open")?;
                let high = next_element(&mut seq, "high")?;
                let low = next_element(&mut seq, "low")?;
                let close = next_element(&mut seq, "close")?;
                let volume = next_element(&mut seq, "volume")?;
                let close_time = next_element(&mut seq, "close_time")?;
                let quote_asset_volume = next_element(&mut seq, "quote_asset_volume")?;
                let trade_count = next_element(&mut seq, "trade_count")?;
                let taker_buy_base_volume = next_element(&mut seq, "taker_buy_base_volume")?;
                let taker_buy_quote_volume = next_element(&mut seq, "taker_buy_quote_volume")?;

                // Trailing "ignore" element (and anything the vendor adds).
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}

                Ok(RestKlineRaw {
                    open_time,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    close_time,
                    quote_asset_volume,
                    trade_count,
                    taker_buy_base_volume,
                    taker_buy_quote_volume,
                })
            }
        }

        deserializer.deserialize_seq(KlineVisitor)
    }
}

impl RestKlineRaw {
    /// Convert into a [`Candle`]. REST timestamps are always milliseconds;
    /// `close_time` is re-derived so the close-determinism invariant holds.
    pub fn into_candle(self, interval: Interval) -> Result<Candle, DataError> {
        let open_time = DateTime::from_timestamp_millis(self.open_time)
            .ok_or_else(|| DataError::Integrity(format!("invalid open_time {}", self.open_time)))?;

        let price = |field: &'static str, raw: &str| -> Result<f64, DataError> {
            raw.parse::<f64>()
                .map_err(|e| DataError::Integrity(format!("failed to parse {field} '{raw}': {e}")))
        };

        Ok(Candle {
            open_time,
            open: price("open", &self.open)?,
            high: price("high", &self.high)?,
            low: price("low", &self.low)?,
            close: price("close", &self.close)?,
            volume: price("volume", &self.volume)?,
            close_time: Candle::expected_close_time(open_time, interval),
            quote_asset_volume: price("quote_asset_volume", &self.quote_asset_volume)?,
            trade_count: self.trade_count,
            taker_buy_base_volume: price("taker_buy_base_volume", &self.taker_buy_base_volume)?,
            taker_buy_quote_volume: price("taker_buy_quote_volume", &self.taker_buy_quote_volume)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_deserialize_kline_array() {
        let json = r#"[
            1499040000000,
            "0.01634000",
            "0.80000000",
            "0.01575800",
            "0.01577100",
            "148976.11427815",
            1499126399999,
            "2434.19055334",
            308,
            "1.20000000",
            "3.40000000",
            "0"
        ]"#;

        let raw: RestKlineRaw = serde_json::from_str(json).unwrap();
        assert_eq!(raw.open_time, 1499040000000);
        assert_eq!(raw.open, "0.01634000");
        assert_eq!(raw.trade_count, 308);
        assert_eq!(raw.taker_buy_quote_volume, "3.40000000");
    }

    #[test]
    fn test_deserialize_kline_vec() {
        let json = r#"[
            [1609459200000,"29000.00","29500.00","28800.00","29200.00","1000.00",1609462799999,"29000000.00",5000,"500.00","14500000.00","0"],
            [1609462800000,"29200.00","30000.00","29100.00","29800.00","1200.00",1609466399999,"35000000.00",6000,"600.00","17400000.00","0"]
        ]"#;

        let klines: Vec<RestKlineRaw> = serde_json::from_str(json).unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[1].open_time, 1609462800000);
    }

    #[test]
    fn test_deserialize_rejects_truncated_array() {
        let json = r#"[1499040000000,"0.016","0.8"]"#;
        assert!(serde_json::from_str::<RestKlineRaw>(json).is_err());
    }

    #[test]
    fn test_into_candle() {
        let raw = RestKlineRaw {
            open_time: 1609459200000,
            open: "29000.00".to_string(),
            high: "29500.00".to_string(),
            low: "28800.00".to_string(),
            close: "29200.00".to_string(),
            volume: "1000.00".to_string(),
            close_time: 1609462799999,
            quote_asset_volume: "29000000.00".to_string(),
            trade_count: 5000,
            taker_buy_base_volume: "500.00".to_string(),
            taker_buy_quote_volume: "14500000.00".to_string(),
        };

        let candle = raw.into_candle(Interval::H1).unwrap();
        assert_eq!(
            candle.open_time,
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            candle.close_time,
            Candle::expected_close_time(candle.open_time, Interval::H1)
        );
        assert!((candle.open - 29000.0).abs() < 1e-9);
        assert!((candle.taker_buy_base_volume - 500.0).abs() < 1e-9);
        assert_eq!(candle.trade_count, 5000);
    }

    #[test]
    fn test_into_candle_rejects_garbage_price() {
        let raw = RestKlineRaw {
            open_time: 1609459200000,
            open: "not-a-number".to_string(),
            high: "1".to_string(),
            low: "1".to_string(),
            close: "1".to_string(),
            volume: "1".to_string(),
            close_time: 1609462799999,
            quote_asset_volume: "1".to_string(),
            trade_count: 1,
            taker_buy_base_volume: "1".to_string(),
            taker_buy_quote_volume: "1".to_string(),
        };

        assert!(matches!(
            raw.into_candle(Interval::H1),
            Err(DataError::Integrity(_))
        ));
    }
}
