use crate::{
    error::{DataError, DayFailure, ErrorKind},
    frame::{Candle, Frame, Source},
    time,
};
use candela_instrument::Interval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What to do about intervals missing from the normalised frame.
///
/// Defaults to [`GapAction::Report`]: sparse series (thinly traded pairs at
/// `1s`) stay sparse instead of drowning in NaN padding; callers that want
/// a dense index opt in explicitly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapAction {
    /// Return the gaps alongside the frame; do not touch the rows.
    #[default]
    Report,
    /// Insert NaN rows for every missing interval.
    ImputeNan,
    /// Insert rows carrying the previous close forward with zero volume.
    ImputeForwardFill,
    /// Fail the request if any interval is missing.
    Reject,
}

/// Result of [`normalize`]: the cleaned frame plus everything that was
/// observed along the way.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub frame: Frame,
    /// Open times of intervals absent from the source rows (before any
    /// imputation).
    pub gaps: Vec<DateTime<Utc>>,
    /// Rows dropped because their `open_time` was off the interval grid.
    pub dropped_misaligned: usize,
    /// Rows dropped as duplicates of an earlier `open_time`.
    pub dropped_duplicates: usize,
    /// Number of rows inserted by imputation.
    pub imputed: usize,
}

/// Normalise raw rows into a strictly ascending, unique, interval-aligned
/// frame.
///
/// Operations in order: drop misaligned rows, stable-sort by `open_time`,
/// deduplicate keeping the first occurrence, re-derive `close_time`, then
/// detect (and per `gap_action`, fill) gaps against `expected_range`.
///
/// Keep-first deduplication is what makes day-boundary merges idempotent:
/// when adjacent archive days both carry the midnight row, the second copy
/// is discarded without affecting the first.
pub fn normalize(
    rows: Vec<Candle>,
    interval: Interval,
    expected_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    gap_action: GapAction,
) -> Result<Normalized, DataError> {
    let input_len = rows.len();

    // BTreeMap keyed by open_time gives sort + keep-first dedup in one
    // pass; entries are only inserted when the slot is vacant.
    let mut by_open_time: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
    let mut dropped_misaligned = 0usize;

    for mut row in rows {
        if !time::is_aligned(row.open_time, interval) {
            dropped_misaligned += 1;
            continue;
        }
        row.close_time = Candle::expected_close_time(row.open_time, interval);
        by_open_time.entry(row.open_time).or_insert(row);
    }

    let dropped_duplicates = input_len - dropped_misaligned - by_open_time.len();
    if dropped_misaligned > 0 {
        warn!(
            dropped = dropped_misaligned,
            interval = %interval,
            "dropped rows with off-grid open_time"
        );
    }

    let gaps = detect_gaps(&by_open_time, interval, expected_range);

    let mut imputed = 0usize;
    match gap_action {
        GapAction::Report => {}
        GapAction::Reject if !gaps.is_empty() => {
            return Err(gap_rejection(&gaps));
        }
        GapAction::Reject => {}
        GapAction::ImputeNan => {
            for &open_time in &gaps {
                by_open_time.insert(open_time, Candle::imputed_nan(open_time, interval));
                imputed += 1;
            }
        }
        GapAction::ImputeForwardFill => {
            for &open_time in &gaps {
                let previous_close = by_open_time
                    .range(..open_time)
                    .next_back()
                    .map(|(_, row)| row.close);
                let row = match previous_close {
                    Some(close) => Candle {
                        open_time,
                        open: close,
                        high: close,
                        low: close,
                        close,
                        volume: 0.0,
                        close_time: Candle::expected_close_time(open_time, interval),
                        quote_asset_volume: 0.0,
                        trade_count: 0,
                        taker_buy_base_volume: 0.0,
                        taker_buy_quote_volume: 0.0,
                    },
                    // Nothing to carry forward before the first real row.
                    None => Candle::imputed_nan(open_time, interval),
                };
                by_open_time.insert(open_time, row);
                imputed += 1;
            }
        }
    }

    debug!(
        rows = by_open_time.len(),
        gaps = gaps.len(),
        dropped_misaligned,
        dropped_duplicates,
        imputed,
        "normalized frame"
    );

    Ok(Normalized {
        frame: Frame::new(by_open_time.into_values().collect()),
        gaps,
        dropped_misaligned,
        dropped_duplicates,
        imputed,
    })
}

/// Missing interval boundaries, judged against `expected_range` when given,
/// otherwise against the span of the observed rows.
fn detect_gaps(
    rows: &BTreeMap<DateTime<Utc>, Candle>,
    interval: Interval,
    expected_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Vec<DateTime<Utc>> {
    let (start, end) = match expected_range {
        Some((start, end)) => (time::align_up(start, interval), end),
        None => match (rows.first_key_value(), rows.last_key_value()) {
            (Some((&first, _)), Some((&last, _))) => (first, last + interval.duration()),
            _ => return Vec::new(),
        },
    };

    let mut gaps = Vec::new();
    let mut cursor = start;
    while cursor < end {
        if !rows.contains_key(&cursor) {
            gaps.push(cursor);
        }
        cursor += interval.duration();
    }
    gaps
}

fn gap_rejection(gaps: &[DateTime<Utc>]) -> DataError {
    let mut per_day: BTreeMap<chrono::NaiveDate, usize> = BTreeMap::new();
    for gap in gaps {
        *per_day.entry(gap.date_naive()).or_default() += 1;
    }

    DataError::Incomplete {
        failures: per_day
            .into_iter()
            .map(|(day, count)| DayFailure {
                day,
                source: Source::Imputed,
                kind: ErrorKind::Incomplete,
                message: format!("{count} missing interval(s)"),
            })
            .collect(),
    }
}
