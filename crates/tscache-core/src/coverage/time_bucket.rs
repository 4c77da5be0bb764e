//! Fixed-width fetch buckets counted from the Unix epoch.
//!
//! Fetch collaborators usually retrieve data in whole files (one day, one
//! hour). A [`TimeBucket`] names that file width so coverage can be asked
//! in the same units. Bucket `n` spans `[n * width, (n + 1) * width)`;
//! instants before the epoch fall into bucket 0.

use std::{fmt, ops::RangeInclusive, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Width of one fetch bucket.
///
/// Serializes as its short form (`"1d"`, `"6h"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeBucket {
    /// `n` seconds.
    Seconds(u32),
    /// `n` minutes.
    Minutes(u32),
    /// `n` hours.
    Hours(u32),
    /// `n` days.
    Days(u32),
}

/// Errors from parsing a bucket width such as `1d` or `6h`.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseTimeBucketError {
    /// Nothing but whitespace.
    #[snafu(display("time bucket spec is empty"))]
    Empty,

    /// The count is missing, zero, or not a `u32`.
    #[snafu(display("invalid bucket length in '{spec}' (expected a positive u32)"))]
    InvalidLength {
        /// The rejected input.
        spec: String,
    },

    /// The unit suffix is missing or unknown.
    #[snafu(display("unknown time bucket unit in '{spec}' (expected s|m|h|d)"))]
    UnknownUnit {
        /// The rejected input.
        spec: String,
    },
}

impl FromStr for TimeBucket {
    type Err = ParseTimeBucketError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let spec = input.trim();
        ensure!(!spec.is_empty(), EmptySnafu);

        let split = spec
            .find(|c: char| c.is_ascii_alphabetic())
            .context(UnknownUnitSnafu { spec })?;
        let (count, unit) = spec.split_at(split);
        let n: u32 = count
            .trim()
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .context(InvalidLengthSnafu { spec })?;

        match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(TimeBucket::Seconds(n)),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(TimeBucket::Minutes(n)),
            "h" | "hr" | "hrs" | "hour" | "hours" => Ok(TimeBucket::Hours(n)),
            "d" | "day" | "days" => Ok(TimeBucket::Days(n)),
            _ => UnknownUnitSnafu { spec }.fail(),
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TimeBucket::Seconds(n) => write!(f, "{n}s"),
            TimeBucket::Minutes(n) => write!(f, "{n}m"),
            TimeBucket::Hours(n) => write!(f, "{n}h"),
            TimeBucket::Days(n) => write!(f, "{n}d"),
        }
    }
}

impl TryFrom<String> for TimeBucket {
    type Error = ParseTimeBucketError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeBucket> for String {
    fn from(b: TimeBucket) -> Self {
        b.to_string()
    }
}

impl TimeBucket {
    /// Bucket width.
    pub fn width(&self) -> Duration {
        Duration::seconds(self.width_secs())
    }

    fn width_secs(&self) -> i64 {
        let (n, unit) = match *self {
            TimeBucket::Seconds(n) => (n, 1),
            TimeBucket::Minutes(n) => (n, 60),
            TimeBucket::Hours(n) => (n, 3_600),
            TimeBucket::Days(n) => (n, 86_400),
        };
        // Zero only arises from a hand-built `TimeBucket::X(0)`.
        (i64::from(n) * unit).max(1)
    }

    /// Bucket holding `ts`.
    pub fn index_of(&self, ts: DateTime<Utc>) -> u64 {
        u64::try_from(ts.timestamp().div_euclid(self.width_secs())).unwrap_or(0)
    }

    /// Buckets touched by the half-open window `[start, end)`, inclusive.
    ///
    /// An empty window (`start >= end`) yields the single bucket of `start`.
    pub fn indices_within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> RangeInclusive<u64> {
        let first = self.index_of(start);
        if end <= start {
            return first..=first;
        }
        // The instant `end` itself lies outside the window.
        first..=self.index_of(end - Duration::nanoseconds(1)).max(first)
    }

    /// First instant of bucket `index`.
    pub fn start_of(&self, index: u64) -> DateTime<Utc> {
        i64::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(self.width_secs()))
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Last instant of bucket `index`, one nanosecond before the next bucket.
    pub fn last_instant_of(&self, index: u64) -> DateTime<Utc> {
        self.start_of(index.saturating_add(1)) - Duration::nanoseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_common_specs() {
        assert_eq!("1d".parse(), Ok(TimeBucket::Days(1)));
        assert_eq!(" 6 h ".parse(), Ok(TimeBucket::Hours(6)));
        assert_eq!("15min".parse(), Ok(TimeBucket::Minutes(15)));
        assert_eq!("30S".parse(), Ok(TimeBucket::Seconds(30)));
    }

    #[test]
    fn rejects_bad_specs() {
        assert_eq!("".parse::<TimeBucket>(), Err(ParseTimeBucketError::Empty));
        assert!(matches!(
            "0d".parse::<TimeBucket>(),
            Err(ParseTimeBucketError::InvalidLength { .. })
        ));
        assert!(matches!(
            "12".parse::<TimeBucket>(),
            Err(ParseTimeBucketError::UnknownUnit { .. })
        ));
        assert!(matches!(
            "3w".parse::<TimeBucket>(),
            Err(ParseTimeBucketError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn display_parses_back() {
        for b in [
            TimeBucket::Seconds(30),
            TimeBucket::Minutes(5),
            TimeBucket::Hours(6),
            TimeBucket::Days(1),
        ] {
            assert_eq!(b.to_string().parse(), Ok(b));
        }
    }

    #[test]
    fn window_ending_on_boundary_excludes_next_bucket() {
        let day = TimeBucket::Days(1);
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 3, 0, 0, 0).unwrap();
        let ids = day.indices_within(start, end);
        assert_eq!(ids.end() - ids.start(), 1);
        assert_eq!(day.start_of(*ids.start()), start);
        assert_eq!(day.last_instant_of(*ids.end()), end - Duration::nanoseconds(1));
    }

    #[test]
    fn short_window_stays_in_one_bucket() {
        let hour = TimeBucket::Hours(1);
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 10, 5, 0).unwrap();
        let ids = hour.indices_within(start, start + Duration::seconds(30));
        assert_eq!(ids.start(), ids.end());
        assert_eq!(hour.width(), Duration::hours(1));
    }

    #[test]
    fn pre_epoch_lands_in_bucket_zero() {
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(TimeBucket::Minutes(1).index_of(t), 0);
    }
}
