use candela_instrument::Interval;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Normalised OHLCV candle, one row of a [`Frame`].
///
/// Field order matches the archive CSV / REST array column order.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
    pub quote_asset_volume: f64,
    pub trade_count: u64,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl Candle {
    /// Close time determined by the open time and interval:
    /// `open_time + interval - 1ms`.
    ///
    /// The archive publishes close times at the provider's native
    /// granularity; normalization re-derives them so the invariant holds
    /// regardless of source.
    pub fn expected_close_time(open_time: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
        open_time + interval.duration() - TimeDelta::milliseconds(1)
    }

    /// `low ≤ min(open, close) ≤ max(open, close) ≤ high` and
    /// `volume ≥ 0`. NaN-imputed rows pass vacuously.
    pub fn is_price_sane(&self) -> bool {
        if self.open.is_nan() {
            return true;
        }
        self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.volume >= 0.0
    }

    /// A placeholder row for a missing interval, used when the caller opted
    /// into NaN padding.
    pub fn imputed_nan(open_time: DateTime<Utc>, interval: Interval) -> Self {
        Self {
            open_time,
            open: f64::NAN,
            high: f64::NAN,
            low: f64::NAN,
            close: f64::NAN,
            volume: f64::NAN,
            close_time: Self::expected_close_time(open_time, interval),
            quote_asset_volume: f64::NAN,
            trade_count: 0,
            taker_buy_base_volume: f64::NAN,
            taker_buy_quote_volume: f64::NAN,
        }
    }
}

/// Identity of the source that produced a row-range of the final frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Cache,
    Archive,
    Rest,
    Imputed,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Archive => "archive",
            Source::Rest => "rest",
            Source::Imputed => "imputed",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-day source identity returned alongside the final frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct DayProvenance {
    pub day: NaiveDate,
    pub source: Source,
}

/// Temporally ordered table of [`Candle`] rows.
///
/// A typed, fixed-schema replacement for the dynamic dataframes this kind
/// of pipeline is usually built on. Ordering and uniqueness are enforced by
/// [`normalize`](crate::normalize::normalize), not by construction, so
/// adapters can build frames row-by-row cheaply.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Frame {
    pub rows: Vec<Candle>,
}

impl Frame {
    pub fn new(rows: Vec<Candle>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first_open_time(&self) -> Option<DateTime<Utc>> {
        self.rows.first().map(|row| row.open_time)
    }

    pub fn last_open_time(&self) -> Option<DateTime<Utc>> {
        self.rows.last().map(|row| row.open_time)
    }

    /// Keep only rows with `open_time ∈ [start, end)`.
    pub fn trim(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.rows
            .retain(|row| row.open_time >= start && row.open_time < end);
    }

    /// Append all rows of `other`. No ordering is implied; callers
    /// re-normalize after concatenation.
    pub fn concat(&mut self, other: Frame) {
        self.rows.extend(other.rows);
    }
}

impl FromIterator<Candle> for Frame {
    fn from_iter<I: IntoIterator<Item = Candle>>(iter: I) -> Self {
        Frame::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open_time: DateTime<Utc>) -> Candle {
        Candle {
            open_time,
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close: 105.0,
            volume: 1.0,
            close_time: Candle::expected_close_time(open_time, Interval::M1),
            quote_asset_volume: 100.0,
            trade_count: 10,
            taker_buy_base_volume: 0.5,
            taker_buy_quote_volume: 50.0,
        }
    }

    #[test]
    fn test_expected_close_time() {
        let open = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let close = Candle::expected_close_time(open, Interval::H1);
        assert_eq!(close, Utc.with_ymd_and_hms(2024, 1, 15, 0, 59, 59).unwrap() + TimeDelta::milliseconds(999));
    }

    #[test]
    fn test_price_sanity() {
        let open = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let mut row = candle(open);
        assert!(row.is_price_sane());

        row.high = 95.0;
        assert!(!row.is_price_sane());

        assert!(Candle::imputed_nan(open, Interval::M1).is_price_sane());
    }

    #[test]
    fn test_trim_is_half_open() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let t1 = t0 + TimeDelta::minutes(1);
        let t2 = t0 + TimeDelta::minutes(2);
        let mut frame = Frame::new(vec![candle(t0), candle(t1), candle(t2)]);

        frame.trim(t0, t2);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.last_open_time(), Some(t1));
    }
}
