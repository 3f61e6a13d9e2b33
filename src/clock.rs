//! Hour-boundary arithmetic for exit deadlines.
//!
//! Every filled buy exits at minute 55 of the hour FOLLOWING the fill.
//! All deadlines are millisecond epoch timestamps so the math stays
//! integer-only and timezone-free.

use chrono::{DateTime, TimeZone, Utc};

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 3_600_000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Top of the hour containing `ts_ms`.
pub fn hour_floor_ms(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}

/// Minute-of-hour (0..=59) for `ts_ms`.
pub fn minute_of_hour(ts_ms: i64) -> u32 {
    (ts_ms.rem_euclid(HOUR_MS) / MINUTE_MS) as u32
}

/// Exit deadline for an order created or filled at `ts_ms`:
/// minute 55 of the hour immediately after `ts_ms`.
///
/// Always strictly in the future relative to `ts_ms`.
pub fn exit_deadline_ms(ts_ms: i64) -> i64 {
    hour_floor_ms(ts_ms) + HOUR_MS + 55 * MINUTE_MS
}

/// Render an epoch-ms timestamp for log lines.
pub fn fmt_ms(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("{}ms", ts_ms),
    }
}

/// ISO-8601 timestamp with milliseconds, as the exchange signing scheme wants it.
pub fn iso_ts(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-15 10:13:00 UTC
    const T_10_13: i64 = 1_705_313_580_000;

    #[test]
    fn test_hour_floor() {
        let floor = hour_floor_ms(T_10_13);
        assert_eq!(floor % HOUR_MS, 0);
        assert_eq!(T_10_13 - floor, 13 * MINUTE_MS);
    }

    #[test]
    fn test_minute_of_hour() {
        assert_eq!(minute_of_hour(T_10_13), 13);
        assert_eq!(minute_of_hour(hour_floor_ms(T_10_13)), 0);
        assert_eq!(minute_of_hour(hour_floor_ms(T_10_13) + 59 * MINUTE_MS), 59);
    }

    #[test]
    fn test_exit_deadline_is_55_of_next_hour() {
        // Buy at 10:13 → exit at 11:55.
        let deadline = exit_deadline_ms(T_10_13);
        assert_eq!(deadline, hour_floor_ms(T_10_13) + HOUR_MS + 55 * MINUTE_MS);
        assert_eq!(minute_of_hour(deadline), 55);
    }

    #[test]
    fn test_exit_deadline_strictly_future() {
        // Even at XX:59:59.999 the deadline lands in the next hour.
        let late = hour_floor_ms(T_10_13) + HOUR_MS - 1;
        assert!(exit_deadline_ms(late) > late);
        // And at XX:55 exactly the deadline is the NEXT hour's minute 55,
        // a full hour away, never "now".
        let at_55 = hour_floor_ms(T_10_13) + 55 * MINUTE_MS;
        assert_eq!(exit_deadline_ms(at_55) - at_55, HOUR_MS);
    }

    #[test]
    fn test_exit_deadline_idempotent_per_hour() {
        // Any two instants inside the same hour share one deadline.
        let a = hour_floor_ms(T_10_13) + 2 * MINUTE_MS;
        let b = hour_floor_ms(T_10_13) + 54 * MINUTE_MS;
        assert_eq!(exit_deadline_ms(a), exit_deadline_ms(b));
    }
}
