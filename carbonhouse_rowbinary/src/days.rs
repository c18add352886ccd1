//! Day index helpers.
//!
//! A day index is the number of whole days between 1970-01-01 and the UTC
//! midnight on or before a timestamp.

use chrono::DateTime;

const SECONDS_PER_DAY: u32 = 86400;

/// Day index of `timestamp`.
pub fn timestamp_to_days(timestamp: u32) -> u16 {
    (timestamp / SECONDS_PER_DAY) as u16
}

/// Render a day index as `YYYY-MM-DD`.
pub fn date_string(days: u16) -> String {
    DateTime::from_timestamp(i64::from(days) * i64::from(SECONDS_PER_DAY), 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Remembers the `[start, end]` window of "today" so the common case of a
/// fresh sample is a pair of comparisons.
///
/// Not shared between tasks; each parser owns one.
#[derive(Debug, Default, Clone, Copy)]
pub struct DaysCache {
    today_start: u32,
    today_end: u32,
    today_days: u16,
}

impl DaysCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Day index of `timestamp`, using the cached window when it applies.
    pub fn timestamp(&self, timestamp: u32) -> u16 {
        if self.today_end != 0 && timestamp >= self.today_start && timestamp <= self.today_end {
            return self.today_days;
        }
        timestamp_to_days(timestamp)
    }

    /// Day index of `timestamp`, advancing the cached window to the day
    /// containing `now` once `now` has left it.
    pub fn timestamp_with_now(&mut self, timestamp: u32, now: u32) -> u16 {
        if timestamp < self.today_start {
            return timestamp_to_days(timestamp);
        }
        if timestamp <= self.today_end {
            return self.today_days;
        }
        if now > self.today_end {
            let days = timestamp_to_days(now);
            self.today_start = u32::from(days) * SECONDS_PER_DAY;
            self.today_end = self.today_start.saturating_add(SECONDS_PER_DAY - 1);
            self.today_days = days;
        }
        self.timestamp(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn days_from_epoch() {
        assert_eq!(timestamp_to_days(0), 0);
        assert_eq!(timestamp_to_days(86399), 0);
        assert_eq!(timestamp_to_days(86400), 1);
        assert_eq!(timestamp_to_days(1559465760), 18049);
    }

    #[test]
    fn formats_dates() {
        assert_eq!(date_string(0), "1970-01-01");
        assert_eq!(date_string(42), "1970-02-12");
        assert_eq!(date_string(18049), "2019-06-02");
    }

    #[test]
    fn cache_tracks_today() {
        let now = 1559465760;
        let mut cache = DaysCache::new();
        assert_eq!(cache.timestamp_with_now(now, now), 18049);
        // yesterday, today, tomorrow
        assert_eq!(cache.timestamp_with_now(now - 86400, now), 18048);
        assert_eq!(cache.timestamp_with_now(now + 1, now), 18049);
        assert_eq!(cache.timestamp_with_now(now + 86400, now), 18050);

        // a day later the window moves
        let later = now + 86400;
        assert_eq!(cache.timestamp_with_now(later, later), 18050);
        assert_eq!(cache.timestamp(later), 18050);
    }

    #[test]
    fn cache_agrees_with_plain_division() {
        let mut cache = DaysCache::new();
        let now = 1_700_000_000;
        for ts in (now - 3 * 86400..now + 3 * 86400).step_by(3607) {
            assert_eq!(cache.timestamp_with_now(ts, now), timestamp_to_days(ts), "{ts}");
        }
    }
}
