use candela_instrument::Interval;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

/// Wall-clock lag after which a completed UTC day is expected to appear in
/// the bulk archive. The publisher consolidates daily files with up to two
/// days of slack.
pub fn default_publication_delay() -> TimeDelta {
    TimeDelta::hours(48)
}

/// Snap `t` down to the enclosing interval boundary.
///
/// Boundaries are whole multiples of the interval duration from the Unix
/// epoch, so the result satisfies `align_down(t) ≡ 0 (mod interval)`.
pub fn align_down(t: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let step = interval.num_nanos();
    let nanos = timestamp_nanos(t);
    DateTime::from_timestamp_nanos(nanos.div_euclid(step) * step)
}

/// Snap `t` up to the next interval boundary. Identity when `t` is already
/// aligned.
pub fn align_up(t: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let aligned = align_down(t, interval);
    if aligned == t {
        aligned
    } else {
        aligned + interval.duration()
    }
}

/// Whether `t` lies exactly on an interval boundary.
pub fn is_aligned(t: DateTime<Utc>, interval: Interval) -> bool {
    timestamp_nanos(t) % interval.num_nanos() == 0
}

/// UTC calendar dates whose day-range intersects `[start, end)`, ascending.
///
/// Empty when the range is empty or inverted.
pub fn enumerate_days(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
    if start >= end {
        return Vec::new();
    }

    let first = start.date_naive();
    // `end` is exclusive, so a range ending exactly at midnight does not
    // include the following day.
    let last = (end - TimeDelta::nanoseconds(1)).date_naive();

    let mut days = Vec::new();
    let mut day = first;
    while day <= last {
        days.push(day);
        day = day.succ_opt().expect("date overflow");
    }
    days
}

/// Half-open UTC bounds `[00:00:00, next day 00:00:00)` of a calendar date.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    (start, start + TimeDelta::days(1))
}

/// Whether the daily archive file for `date` is expected to exist at `now`.
///
/// A day is archive-eligible once its end plus the publication delay has
/// passed; anything more recent is served from the live endpoint only.
pub fn is_past_publication_delay(date: NaiveDate, now: DateTime<Utc>, delay: TimeDelta) -> bool {
    let (_, day_end) = day_bounds(date);
    day_end + delay <= now
}

fn timestamp_nanos(t: DateTime<Utc>) -> i64 {
    // Valid for all dates this crate deals with (the archive starts in
    // 2017; i64 nanoseconds cover 1677..2262).
    t.timestamp_nanos_opt()
        .expect("timestamp outside nanosecond-representable range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_align_down_identity_on_boundary() {
        let t = Utc.with_ymd_and_hms(2024, 3, 10, 13, 15, 0).unwrap();
        assert_eq!(align_down(t, Interval::M15), t);
        assert_eq!(align_up(t, Interval::M15), t);
    }

    #[test]
    fn test_align_down_and_up() {
        let t = Utc.with_ymd_and_hms(2024, 3, 10, 13, 17, 29).unwrap();
        assert_eq!(
            align_down(t, Interval::M15),
            Utc.with_ymd_and_hms(2024, 3, 10, 13, 15, 0).unwrap()
        );
        assert_eq!(
            align_up(t, Interval::M15),
            Utc.with_ymd_and_hms(2024, 3, 10, 13, 30, 0).unwrap()
        );
        assert_eq!(
            align_down(t, Interval::D1),
            Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_is_aligned() {
        let t = Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap();
        assert!(is_aligned(t, Interval::H1));
        assert!(is_aligned(t, Interval::M1));
        assert!(!is_aligned(t + TimeDelta::seconds(1), Interval::M1));
    }

    #[test]
    fn test_enumerate_days_spanning_midnight() {
        let start = Utc.with_ymd_and_hms(2025, 4, 10, 23, 58, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 4, 11, 0, 3, 0).unwrap();
        assert_eq!(
            enumerate_days(start, end),
            vec![
                NaiveDate::from_ymd_opt(2025, 4, 10).unwrap(),
                NaiveDate::from_ymd_opt(2025, 4, 11).unwrap(),
            ]
        );
    }

    #[test]
    fn test_enumerate_days_end_exclusive_at_midnight() {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap();
        assert_eq!(
            enumerate_days(start, end),
            vec![NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()]
        );
    }

    #[test]
    fn test_enumerate_days_empty_and_inverted() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        assert!(enumerate_days(t, t).is_empty());
        assert!(enumerate_days(t, t - TimeDelta::hours(1)).is_empty());
    }

    #[test]
    fn test_day_bounds() {
        let (start, end) = day_bounds(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_publication_delay_boundary() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        // Day ends 2024-01-16T00:00Z; archive expected from the 18th.
        let before = Utc.with_ymd_and_hms(2024, 1, 17, 23, 59, 59).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 18, 0, 0, 0).unwrap();
        assert!(!is_past_publication_delay(
            date,
            before,
            default_publication_delay()
        ));
        assert!(is_past_publication_delay(
            date,
            at,
            default_publication_delay()
        ));
    }
}
