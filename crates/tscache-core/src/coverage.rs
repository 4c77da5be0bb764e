//! Coverage tracking: which time windows of each family are already cached.
//!
//! Coverage is kept per class key as an [`IntervalSet`], a sorted list of
//! closed windows in which no two windows overlap or touch. Marking a
//! window coalesces it with its neighbours; querying a window returns the
//! sub-windows that are still missing so a fetcher only requests those.
//!
//! Coverage only grows. There is no unmark operation.
//!
//! For fetchers that work in whole files, [`CoverageTracker::bucket_coverage`]
//! projects coverage onto fixed-width [`TimeBucket`]s. A bucket counts as
//! cached only when a single stored window spans all of it.

pub mod bucket;
pub mod time_bucket;

use std::{collections::HashMap, ops::RangeInclusive};

use chrono::{DateTime, Duration, Utc};
use roaring::RoaringBitmap;
use snafu::prelude::*;

use crate::coverage::{bucket::BucketCoverage, time_bucket::TimeBucket};

/// Errors from coverage operations.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum CoverageError {
    /// The window's start lies after its end.
    #[snafu(display("Invalid coverage window for '{class_key}': start={start}, end={end}"))]
    InvalidRange {
        /// Family the window was given for.
        class_key: String,
        /// Window start.
        start: DateTime<Utc>,
        /// Window end.
        end: DateTime<Utc>,
    },

    /// A bucket id does not fit the `u32` domain used by bucket bitmaps.
    #[snafu(display("Bucket id {bucket} exceeds the supported range"))]
    BucketOutOfRange {
        /// The offending bucket id.
        bucket: u64,
    },
}

/// A closed time window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Inclusive end.
    pub end: DateTime<Utc>,
}

impl Interval {
    /// Build a window; callers guarantee `start <= end`.
    /// [`IntervalSet::insert`] refuses windows that break this.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// True when `other` lies inside `self`.
    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl From<(DateTime<Utc>, DateTime<Utc>)> for Interval {
    fn from((start, end): (DateTime<Utc>, DateTime<Utc>)) -> Self {
        Self::new(start, end)
    }
}

/// Sorted windows, none overlapping or touching another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    /// No coverage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Windows in ascending order.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// True when nothing is covered.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Insert a window and coalesce. Returns `false`, leaving the set
    /// untouched, when `interval.start > interval.end`.
    ///
    /// All windows are sorted by start and swept once; a window whose start
    /// is at or before the running end extends it instead of opening a new
    /// entry.
    pub fn insert(&mut self, interval: Interval) -> bool {
        if interval.start > interval.end {
            return false;
        }
        self.intervals.push(interval);
        self.intervals.sort_by_key(|iv| iv.start);

        let mut merged: Vec<Interval> = Vec::with_capacity(self.intervals.len());
        for iv in self.intervals.drain(..) {
            match merged.last_mut() {
                Some(cur) if iv.start <= cur.end => cur.end = cur.end.max(iv.end),
                _ => merged.push(iv),
            }
        }
        self.intervals = merged;
        true
    }

    /// True when `window` lies inside a single stored interval.
    pub fn covers(&self, window: &Interval) -> bool {
        // Last interval starting at or before the window.
        let idx = self.intervals.partition_point(|iv| iv.start <= window.start);
        idx > 0 && self.intervals[idx - 1].contains(window)
    }

    /// Parts of `window` not covered, in ascending order.
    ///
    /// A gap's endpoints coincide with the neighbouring covered endpoints.
    /// A zero-length window that is not covered is reported as itself.
    pub fn gaps(&self, window: &Interval) -> Vec<Interval> {
        if self.covers(window) {
            return Vec::new();
        }

        let mut gaps = Vec::new();
        let mut cursor = window.start;
        for iv in &self.intervals {
            if iv.end < window.start {
                continue;
            }
            if iv.start > window.end {
                break;
            }
            if iv.start > cursor {
                gaps.push(Interval::new(cursor, iv.start));
            }
            cursor = cursor.max(iv.end);
        }
        if cursor < window.end {
            gaps.push(Interval::new(cursor, window.end));
        }

        if gaps.is_empty() {
            // Only reachable for a point window sitting in a hole.
            gaps.push(*window);
        }
        gaps
    }

    /// Total covered time inside `window`.
    pub fn covered_within(&self, window: &Interval) -> Duration {
        self.intervals
            .iter()
            .filter(|iv| iv.end >= window.start && iv.start <= window.end)
            .map(|iv| iv.end.min(window.end) - iv.start.max(window.start))
            .fold(Duration::zero(), |acc, d| acc + d)
    }
}

/// Result of [`CoverageTracker::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageQuery {
    /// True when the whole window is already cached.
    pub fully_covered: bool,
    /// Sub-windows still missing; empty when `fully_covered`.
    pub gaps: Vec<Interval>,
}

/// Per-family coverage.
#[derive(Debug, Clone, Default)]
pub struct CoverageTracker {
    sets: HashMap<String, IntervalSet>,
}

/// Build `[start, end]`, rejecting inverted windows.
pub(crate) fn checked_window(
    class_key: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Interval, CoverageError> {
    ensure!(start <= end, InvalidRangeSnafu { class_key, start, end });
    Ok(Interval::new(start, end))
}

impl CoverageTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[start, end]` as covered for `class_key`.
    ///
    /// # Errors
    ///
    /// [`CoverageError::InvalidRange`] when `start > end`; nothing is
    /// recorded in that case.
    pub fn mark(
        &mut self,
        class_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), CoverageError> {
        let iv = checked_window(class_key, start, end)?;
        self.mark_interval(class_key, iv);
        Ok(())
    }

    pub(crate) fn mark_interval(&mut self, class_key: &str, iv: Interval) {
        let set = self.sets.entry(class_key.to_string()).or_default();
        if !set.insert(iv) {
            log::warn!(
                "coverage '{class_key}': ignored inverted window {}..{}",
                iv.start,
                iv.end
            );
            return;
        }
        log::debug!(
            "coverage '{class_key}': marked {}..{}, {} interval(s)",
            iv.start,
            iv.end,
            set.intervals().len()
        );
    }

    /// Check `[start, end]` against the coverage of `class_key`.
    ///
    /// # Errors
    ///
    /// [`CoverageError::InvalidRange`] when `start > end`.
    pub fn query(
        &self,
        class_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CoverageQuery, CoverageError> {
        let iv = checked_window(class_key, start, end)?;
        let gaps = match self.sets.get(class_key) {
            Some(set) => set.gaps(&iv),
            None => vec![iv],
        };
        Ok(CoverageQuery {
            fully_covered: gaps.is_empty(),
            gaps,
        })
    }

    /// Stored windows for `class_key`, empty when unknown.
    pub fn intervals(&self, class_key: &str) -> &[Interval] {
        self.sets
            .get(class_key)
            .map(IntervalSet::intervals)
            .unwrap_or(&[])
    }

    /// Families with any coverage.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    /// Fraction of `[start, end]` that is covered. A zero-length window is
    /// either fully covered (1.0) or not (0.0).
    ///
    /// # Errors
    ///
    /// [`CoverageError::InvalidRange`] when `start > end`.
    pub fn coverage_ratio(
        &self,
        class_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, CoverageError> {
        let iv = checked_window(class_key, start, end)?;
        let Some(set) = self.sets.get(class_key) else {
            return Ok(0.0);
        };
        let total = iv.duration();
        if total.is_zero() {
            return Ok(if set.covers(&iv) { 1.0 } else { 0.0 });
        }
        let covered = set.covered_within(&iv);
        Ok(duration_secs(covered) / duration_secs(total))
    }

    /// Project the coverage of `class_key` onto the `bucket`-wide buckets
    /// touched by the half-open window `[start, end)`.
    ///
    /// A bucket is present only when one stored window runs from its first
    /// instant to its last, one nanosecond before the next bucket begins.
    /// An empty window touches no buckets.
    ///
    /// # Errors
    ///
    /// [`CoverageError::InvalidRange`] when `start > end`, or
    /// [`CoverageError::BucketOutOfRange`] for bucket indices beyond `u32`.
    pub fn bucket_coverage(
        &self,
        class_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: &TimeBucket,
    ) -> Result<BucketCoverage, CoverageError> {
        checked_window(class_key, start, end)?;
        if start == end {
            return Ok(BucketCoverage::default());
        }

        let (lo, hi) = bucket.indices_within(start, end).into_inner();
        let narrow = |id: u64| {
            u32::try_from(id)
                .ok()
                .context(BucketOutOfRangeSnafu { bucket: id })
        };
        let (lo, hi) = (narrow(lo)?, narrow(hi)?);

        let mut cov = BucketCoverage::new((lo..=hi).collect::<RoaringBitmap>());
        if let Some(set) = self.sets.get(class_key) {
            for id in lo..=hi {
                let span = Interval::new(
                    bucket.start_of(u64::from(id)),
                    bucket.last_instant_of(u64::from(id)),
                );
                if set.covers(&span) {
                    cov.mark_present(id);
                }
            }
        }
        Ok(cov)
    }

    /// Runs of buckets in `[start, end)` that still need a fetch, each at
    /// most `max_run_len` buckets long.
    ///
    /// # Errors
    ///
    /// Same as [`CoverageTracker::bucket_coverage`].
    pub fn missing_bucket_runs(
        &self,
        class_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: &TimeBucket,
        max_run_len: Option<u64>,
    ) -> Result<Vec<RangeInclusive<u64>>, CoverageError> {
        Ok(self
            .bucket_coverage(class_key, start, end, bucket)?
            .missing_runs(max_run_len))
    }
}

fn duration_secs(d: Duration) -> f64 {
    d.num_nanoseconds()
        .map(|n| n as f64 / 1e9)
        .unwrap_or_else(|| d.num_seconds() as f64)
}
