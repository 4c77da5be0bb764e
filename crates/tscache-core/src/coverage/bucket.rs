//! Per-bucket view of cached coverage.
//!
//! A [`BucketCoverage`] pairs the buckets a caller asked about with the
//! subset the cache fully holds. Bucket indices live in a `RoaringBitmap`,
//! so windows spanning decades of one-minute buckets stay compact.
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use tscache_core::coverage::{CoverageTracker, time_bucket::TimeBucket};
//!
//! let day = |d: i64| Utc.timestamp_opt(d * 86_400, 0).unwrap();
//! let mut tracker = CoverageTracker::default();
//! tracker.mark("k", day(1), day(3)).unwrap();
//!
//! let cov = tracker
//!     .bucket_coverage("k", day(0), day(6), &TimeBucket::Days(1))
//!     .unwrap();
//! assert_eq!(cov.missing_runs(None), vec![0..=0, 3..=5]);
//! assert_eq!(cov.longest_gap(), 3);
//! ```

use std::ops::RangeInclusive;

use roaring::RoaringBitmap;

/// Expected and fully-cached buckets over one query window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketCoverage {
    expected: RoaringBitmap,
    present: RoaringBitmap,
}

impl BucketCoverage {
    pub(crate) fn new(expected: RoaringBitmap) -> Self {
        Self {
            expected,
            present: RoaringBitmap::new(),
        }
    }

    /// Record a bucket as cached. Buckets outside the expected set are ignored.
    pub(crate) fn mark_present(&mut self, bucket: u32) {
        if self.expected.contains(bucket) {
            self.present.insert(bucket);
        }
    }

    /// Every bucket the window touches.
    pub fn expected(&self) -> &RoaringBitmap {
        &self.expected
    }

    /// Buckets the cache holds in full.
    pub fn present(&self) -> &RoaringBitmap {
        &self.present
    }

    /// Buckets that still need a fetch.
    pub fn missing(&self) -> RoaringBitmap {
        &self.expected - &self.present
    }

    /// True when nothing is missing.
    pub fn is_complete(&self) -> bool {
        self.present.len() == self.expected.len()
    }

    /// Fraction of expected buckets that are cached.
    ///
    /// An empty expectation counts as fully covered.
    pub fn ratio(&self) -> f64 {
        match self.expected.len() {
            0 => 1.0,
            n => self.present.len() as f64 / n as f64,
        }
    }

    /// Length in buckets of the longest missing run.
    pub fn longest_gap(&self) -> u64 {
        self.missing_runs(None)
            .iter()
            .map(|r| r.end() - r.start() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Missing buckets grouped into contiguous runs, ascending.
    ///
    /// With `max_run_len`, longer runs are cut into consecutive pieces of at
    /// most that many buckets, so each run maps onto one bounded fetch.
    pub fn missing_runs(&self, max_run_len: Option<u64>) -> Vec<RangeInclusive<u64>> {
        let mut runs: Vec<RangeInclusive<u64>> = Vec::new();
        for b in self.missing().iter().map(u64::from) {
            match runs.last_mut() {
                Some(last) if *last.end() + 1 == b => *last = *last.start()..=b,
                _ => runs.push(b..=b),
            }
        }

        match max_run_len {
            Some(cap) if cap > 0 => runs
                .into_iter()
                .flat_map(|run| {
                    let (lo, hi) = run.into_inner();
                    (lo..=hi)
                        .step_by(cap as usize)
                        .map(move |s| s..=hi.min(s + cap - 1))
                })
                .collect(),
            _ => runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(range: RangeInclusive<u32>, present: &[u32]) -> BucketCoverage {
        let mut cov = BucketCoverage::new(range.collect());
        for &b in present {
            cov.mark_present(b);
        }
        cov
    }

    #[test]
    fn complete_window_has_no_runs() {
        let cov = window(0..=3, &[0, 1, 2, 3]);
        assert!(cov.is_complete());
        assert!(cov.missing_runs(None).is_empty());
        assert_eq!(cov.ratio(), 1.0);
        assert_eq!(cov.longest_gap(), 0);
    }

    #[test]
    fn long_runs_are_cut_to_fetch_size() {
        let cov = window(10..=20, &[15]);
        assert_eq!(cov.missing_runs(None), vec![10..=14, 16..=20]);
        assert_eq!(
            cov.missing_runs(Some(2)),
            vec![10..=11, 12..=13, 14..=14, 16..=17, 18..=19, 20..=20]
        );
        assert_eq!(cov.longest_gap(), 5);
    }

    #[test]
    fn buckets_outside_window_are_not_counted() {
        let cov = window(0..=3, &[1, 9]);
        assert_eq!(cov.present().len(), 1);
        assert_eq!(cov.ratio(), 0.25);
        assert_eq!(cov.missing().iter().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn empty_window_counts_as_covered() {
        let cov = BucketCoverage::default();
        assert!(cov.is_complete());
        assert_eq!(cov.ratio(), 1.0);
        assert!(cov.missing_runs(Some(4)).is_empty());
    }
}
