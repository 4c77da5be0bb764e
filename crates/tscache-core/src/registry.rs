//! The cache registry: one canonical container per class key.
//!
//! [`CacheRegistry`] owns every cached [`VariableContainer`] together with
//! the [`CoverageTracker`] describing them. The managed write path is
//! [`CacheRegistry::ingest`]:
//!
//! 1. the chunk is checked and merged against the current entry,
//! 2. the merged container replaces the entry,
//! 3. the chunk's time span is marked as covered.
//!
//! Steps 2 and 3 only run once step 1 succeeded, and neither can fail, so an
//! ingest either commits a consistent (container, coverage) pair or changes
//! nothing.
//!
//! Entries are replaced, not mutated in place. `lookup` returns a borrow,
//! so callers necessarily re-fetch after any write to the registry.

use std::collections::{BTreeMap, btree_map::Entry};

use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::{
    container::{Chunk, VariableContainer},
    coverage::{CoverageError, CoverageTracker, Interval, checked_window},
    merge::{MergeError, merge},
};

/// Errors from [`CacheRegistry::ingest`] and friends.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    /// The chunk was rejected by the merge engine.
    #[snafu(display("Ingest into '{class_key}' rejected: {source}"))]
    Merge {
        /// Target family.
        class_key: String,
        /// Underlying merge error.
        source: MergeError,
    },

    /// The chunk is labelled with a different class key than requested.
    #[snafu(display("Chunk for '{chunk_key}' cannot be ingested under '{class_key}'"))]
    KeyMismatch {
        /// Key passed to ingest.
        class_key: String,
        /// Key carried by the chunk.
        chunk_key: String,
    },

    /// The declared fetch window is inverted.
    #[snafu(display("Invalid ingest window: {source}"))]
    Window {
        /// Underlying coverage error.
        source: CoverageError,
    },

    /// The chunk holds samples outside the declared fetch window.
    #[snafu(display(
        "Chunk for '{class_key}' spans {chunk_start}..{chunk_end}, outside window {start}..{end}"
    ))]
    OutsideWindow {
        /// Target family.
        class_key: String,
        /// Window start.
        start: DateTime<Utc>,
        /// Window end.
        end: DateTime<Utc>,
        /// Earliest chunk timestamp.
        chunk_start: DateTime<Utc>,
        /// Latest chunk timestamp.
        chunk_end: DateTime<Utc>,
    },
}

impl IngestError {
    /// True when the chunk broke row alignment between timestamps and a field.
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(
            self,
            IngestError::Merge {
                source: MergeError::ShapeMismatch { .. },
                ..
            }
        )
    }
}

/// Owner of all cached variable families and their coverage.
#[derive(Debug, Clone, Default)]
pub struct CacheRegistry {
    entries: BTreeMap<String, VariableContainer>,
    coverage: CoverageTracker,
}

impl CacheRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The container for `class_key`, or `None` if nothing is cached yet.
    pub fn lookup(&self, class_key: &str) -> Option<&VariableContainer> {
        self.entries.get(class_key)
    }

    /// Install `container` under `class_key`, discarding any previous entry.
    ///
    /// Coverage is left untouched; bulk restore paths mark it separately.
    pub fn replace(&mut self, class_key: impl Into<String>, container: VariableContainer) {
        self.entries.insert(class_key.into(), container);
    }

    /// Merge `chunk` into the entry for `class_key` and mark the chunk's
    /// time span as covered.
    ///
    /// An empty chunk installs the current (or an empty) container and marks
    /// nothing.
    ///
    /// # Errors
    ///
    /// [`IngestError`] if the chunk is malformed or belongs to another
    /// family. The registry is unchanged in that case.
    pub fn ingest(
        &mut self,
        class_key: &str,
        chunk: Chunk,
    ) -> Result<&VariableContainer, IngestError> {
        self.ingest_inner(class_key, chunk, None)
    }

    /// Like [`ingest`](Self::ingest), but mark the whole requested fetch
    /// window `[start, end]` as covered, including stretches where the
    /// source had no samples.
    ///
    /// # Errors
    ///
    /// In addition to the [`ingest`](Self::ingest) errors, the window must
    /// be ordered and contain every chunk timestamp.
    pub fn ingest_window(
        &mut self,
        class_key: &str,
        chunk: Chunk,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<&VariableContainer, IngestError> {
        let window = checked_window(class_key, start, end).context(WindowSnafu)?;
        self.ingest_inner(class_key, chunk, Some(window))
    }

    fn ingest_inner(
        &mut self,
        class_key: &str,
        chunk: Chunk,
        window: Option<Interval>,
    ) -> Result<&VariableContainer, IngestError> {
        ensure!(
            chunk.class_key() == class_key,
            KeyMismatchSnafu {
                class_key,
                chunk_key: chunk.class_key(),
            }
        );

        let span = chunk.time_span();
        if let (Some(w), Some((chunk_start, chunk_end))) = (window, span) {
            ensure!(
                w.start <= chunk_start && chunk_end <= w.end,
                OutsideWindowSnafu {
                    class_key,
                    start: w.start,
                    end: w.end,
                    chunk_start,
                    chunk_end,
                }
            );
        }

        let merged = merge(self.entries.get(class_key), chunk).context(MergeSnafu { class_key })?;

        // Nothing below can fail.
        if let Some(iv) = window.or_else(|| span.map(Interval::from)) {
            self.coverage.mark_interval(class_key, iv);
        }

        log::debug!(
            "ingested into '{class_key}': now {} rows, {} fields",
            merged.len(),
            merged.fields().len()
        );

        let slot = match self.entries.entry(class_key.to_string()) {
            Entry::Occupied(mut o) => {
                o.insert(merged);
                o.into_mut()
            }
            Entry::Vacant(v) => v.insert(merged),
        };
        Ok(&*slot)
    }

    /// Mark `[start, end]` of `class_key` as covered.
    ///
    /// # Errors
    ///
    /// [`CoverageError::InvalidRange`] if `start > end`.
    pub fn mark_covered(
        &mut self,
        class_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), CoverageError> {
        self.coverage.mark(class_key, start, end)
    }

    /// Mark the first-to-last timestamp span of the cached entry as covered.
    ///
    /// Returns the marked span, or `None` when the entry is absent or empty.
    pub fn mark_cached_span(&mut self, class_key: &str) -> Option<Interval> {
        let iv = Interval::from(self.entries.get(class_key)?.time_span()?);
        self.coverage.mark_interval(class_key, iv);
        Some(iv)
    }

    /// Read access to coverage.
    pub fn coverage(&self) -> &CoverageTracker {
        &self.coverage
    }

    /// Cached class keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// All entries in class-key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariableContainer)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of cached families.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
