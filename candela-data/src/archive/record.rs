use crate::{error::DataError, frame::Candle};
use candela_instrument::Interval;
use chrono::DateTime;
use serde::Deserialize;

/// Timestamp granularity used by an archive file.
///
/// The archive switched from millisecond to microsecond timestamps at the
/// start of 2025; files declare nothing, so the unit is detected from the
/// digit count of the first timestamp column (13 digits → ms, 16 → µs).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimestampUnit {
    Millis,
    Micros,
}

const MILLISECOND_DIGITS: usize = 13;
const MICROSECOND_DIGITS: usize = 16;

/// Detect the timestamp unit of a raw epoch value by digit count.
pub fn detect_timestamp_unit(sample: i64) -> Result<TimestampUnit, DataError> {
    let digits = sample.abs().to_string().len();
    match digits {
        MILLISECOND_DIGITS => Ok(TimestampUnit::Millis),
        MICROSECOND_DIGITS => Ok(TimestampUnit::Micros),
        _ => Err(DataError::Integrity(format!(
            "unrecognized timestamp '{sample}' with {digits} digits \
             (expected {MILLISECOND_DIGITS} for ms or {MICROSECOND_DIGITS} for µs)"
        ))),
    }
}

/// Raw archive CSV row.
///
/// Column order is fixed:
/// `open_time, open, high, low, close, volume, close_time,
/// quote_asset_volume, number_of_trades, taker_buy_base_volume,
/// taker_buy_quote_volume, ignore`.
///
/// Legacy files (pre-2025) have no header row; newer ones may. Callers sniff
/// the first line before handing the buffer to the CSV reader.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveRow(
    pub i64,    // open_time
    pub f64,    // open
    pub f64,    // high
    pub f64,    // low
    pub f64,    // close
    pub f64,    // volume
    pub i64,    // close_time
    pub f64,    // quote_asset_volume
    pub u64,    // number_of_trades
    pub f64,    // taker_buy_base_volume
    pub f64,    // taker_buy_quote_volume
    pub String, // ignore
);

impl ArchiveRow {
    /// Convert to a [`Candle`], interpreting timestamps at `unit`.
    ///
    /// `close_time` is re-derived from `open_time` so the close-determinism
    /// invariant holds independent of the file's native granularity.
    pub fn into_candle(self, unit: TimestampUnit, interval: Interval) -> Result<Candle, DataError> {
        let open_time = match unit {
            TimestampUnit::Millis => DateTime::from_timestamp_millis(self.0),
            TimestampUnit::Micros => DateTime::from_timestamp_micros(self.0),
        }
        .ok_or_else(|| DataError::Integrity(format!("open_time {} out of range", self.0)))?;

        Ok(Candle {
            open_time,
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
            close_time: Candle::expected_close_time(open_time, interval),
            quote_asset_volume: self.7,
            trade_count: self.8,
            taker_buy_base_volume: self.9,
            taker_buy_quote_volume: self.10,
        })
    }
}

/// Whether the first line of an archive CSV is a header row rather than
/// data. Legacy files start straight with a numeric epoch timestamp.
pub fn has_header(buffer: &str) -> bool {
    buffer
        .lines()
        .next()
        .and_then(|line| line.split(',').next())
        .is_some_and(|first| first.trim().parse::<i64>().is_err())
}
