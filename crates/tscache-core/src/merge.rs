//! Merge engine: combine a cached container with a newly imported chunk.
//!
//! [`merge`] is a pure function of its two inputs. All shape checks run
//! before any output buffer is allocated, so a rejected merge leaves no
//! partial result behind.
//!
//! Placement of the chunk relative to the existing samples picks the path:
//!
//! - entirely after or entirely before: the two blocks are concatenated;
//! - anything else: the sorted union of both timestamp arrays is built and
//!   each source is scattered into it by binary search, existing rows first
//!   and chunk rows second, so on duplicate instants the chunk wins.
//!
//! Fields known to only one side are padded with `NaN` wherever the other
//! side contributed the sample.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::container::{Chunk, ContainerError, FieldArray, VariableContainer};

/// Which input of a merge a problem was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSide {
    /// The container already held in the cache.
    Existing,
    /// The incoming chunk.
    Chunk,
}

impl fmt::Display for MergeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeSide::Existing => f.write_str("existing container"),
            MergeSide::Chunk => f.write_str("incoming chunk"),
        }
    }
}

/// Errors from [`merge`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MergeError {
    /// A field's row count or buffer shape disagrees with its timestamps.
    #[snafu(display("Shape mismatch in {side} of '{class_key}', field '{field}': {source}"))]
    ShapeMismatch {
        /// Family being merged.
        class_key: String,
        /// Offending field.
        field: String,
        /// Input the field belongs to.
        side: MergeSide,
        /// Detailed shape violation.
        source: ContainerError,
    },

    /// The same field has a different number of columns on each side.
    #[snafu(display(
        "Field '{field}' of '{class_key}' has width {existing} in the cache but {incoming} in the chunk"
    ))]
    FieldWidthMismatch {
        /// Family being merged.
        class_key: String,
        /// Offending field.
        field: String,
        /// Width of the cached field.
        existing: usize,
        /// Width of the chunk's field.
        incoming: usize,
    },

    /// The chunk belongs to another family.
    #[snafu(display("Cannot merge chunk for '{incoming}' into container '{existing}'"))]
    ClassKeyMismatch {
        /// Class key of the cached container.
        existing: String,
        /// Class key carried by the chunk.
        incoming: String,
    },
}

impl MergeError {
    /// Class key the error refers to.
    pub fn class_key(&self) -> &str {
        match self {
            MergeError::ShapeMismatch { class_key, .. }
            | MergeError::FieldWidthMismatch { class_key, .. } => class_key,
            MergeError::ClassKeyMismatch { incoming, .. } => incoming,
        }
    }
}

fn shape_mismatch(side: MergeSide, source: ContainerError) -> MergeError {
    let (class_key, field) = match &source {
        ContainerError::RowCountMismatch {
            class_key, field, ..
        }
        | ContainerError::RaggedField {
            class_key, field, ..
        }
        | ContainerError::ZeroWidth { class_key, field } => (class_key.clone(), field.clone()),
        ContainerError::Unordered { class_key, .. } => (class_key.clone(), String::new()),
    };
    MergeError::ShapeMismatch {
        class_key,
        field,
        side,
        source,
    }
}

/// How the chunk sits relative to the existing samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    After,
    Before,
    Interleaved,
}

fn placement(existing: &[DateTime<Utc>], incoming: &[DateTime<Utc>]) -> Placement {
    match (existing.first(), existing.last(), incoming.first(), incoming.last()) {
        (Some(_), Some(e_last), Some(c_first), Some(_)) if e_last < c_first => Placement::After,
        (Some(e_first), Some(_), Some(_), Some(c_last)) if c_last < e_first => Placement::Before,
        (Some(_), _, Some(_), _) => Placement::Interleaved,
        _ => Placement::After,
    }
}

/// Merge `chunk` into `existing`, producing a new container.
///
/// With no existing container the (normalized) chunk is adopted as-is.
/// Otherwise both inputs are shape-checked, field widths are compared, and
/// the result holds every distinct timestamp from both sides in ascending
/// order. On duplicate timestamps the chunk's row is kept.
///
/// # Errors
///
/// - [`MergeError::ShapeMismatch`] if either input breaks row alignment.
/// - [`MergeError::FieldWidthMismatch`] if a shared field changes width.
/// - [`MergeError::ClassKeyMismatch`] if the chunk belongs to another family.
pub fn merge(
    existing: Option<&VariableContainer>,
    chunk: Chunk,
) -> Result<VariableContainer, MergeError> {
    chunk
        .validate_shape()
        .map_err(|e| shape_mismatch(MergeSide::Chunk, e))?;

    let Some(existing) = existing else {
        return Ok(chunk.normalized().into_container());
    };

    ensure!(
        existing.class_key() == chunk.class_key(),
        ClassKeyMismatchSnafu {
            existing: existing.class_key(),
            incoming: chunk.class_key(),
        }
    );
    existing
        .validate_shape()
        .map_err(|e| shape_mismatch(MergeSide::Existing, e))?;

    for (name, incoming) in chunk.fields() {
        if let Some(cached) = existing.field(name) {
            ensure!(
                cached.width() == incoming.width(),
                FieldWidthMismatchSnafu {
                    class_key: existing.class_key(),
                    field: name,
                    existing: cached.width(),
                    incoming: incoming.width(),
                }
            );
        }
    }

    let chunk = chunk.normalized();
    let merged = match placement(existing.timestamps(), chunk.timestamps()) {
        Placement::After => {
            log::debug!("merge '{}': appending {} rows", chunk.class_key(), chunk.len());
            concat(existing.class_key(), Block::from(existing), Block::from(&chunk))
        }
        Placement::Before => {
            log::debug!("merge '{}': prepending {} rows", chunk.class_key(), chunk.len());
            concat(existing.class_key(), Block::from(&chunk), Block::from(existing))
        }
        Placement::Interleaved => {
            log::debug!(
                "merge '{}': interleaving {} rows into {}",
                chunk.class_key(),
                chunk.len(),
                existing.len()
            );
            scatter_union(existing.class_key(), Block::from(existing), Block::from(&chunk))
        }
    };

    Ok(merged)
}

/// Borrowed view over either input.
#[derive(Clone, Copy)]
struct Block<'a> {
    timestamps: &'a [DateTime<Utc>],
    fields: &'a BTreeMap<String, FieldArray>,
}

impl<'a> From<&'a VariableContainer> for Block<'a> {
    fn from(c: &'a VariableContainer) -> Self {
        Self {
            timestamps: c.timestamps(),
            fields: c.fields(),
        }
    }
}

impl<'a> From<&'a Chunk> for Block<'a> {
    fn from(c: &'a Chunk) -> Self {
        Self {
            timestamps: c.timestamps(),
            fields: c.fields(),
        }
    }
}

/// Name and width of every field appearing in either block.
fn field_layout(a: Block<'_>, b: Block<'_>) -> BTreeMap<String, usize> {
    a.fields
        .iter()
        .chain(b.fields.iter())
        .map(|(name, field)| (name.clone(), field.width()))
        .collect()
}

/// `first` followed by `second`; every timestamp of `first` precedes `second`.
fn concat(class_key: &str, first: Block<'_>, second: Block<'_>) -> VariableContainer {
    let mut timestamps = Vec::with_capacity(first.timestamps.len() + second.timestamps.len());
    timestamps.extend_from_slice(first.timestamps);
    timestamps.extend_from_slice(second.timestamps);

    let fields = field_layout(first, second)
        .into_iter()
        .map(|(name, width)| {
            let mut values = Vec::with_capacity(width * timestamps.len());
            for block in [first, second] {
                match block.fields.get(&name) {
                    Some(f) => values.extend_from_slice(f.values()),
                    None => values.resize(values.len() + width * block.timestamps.len(), f64::NAN),
                }
            }
            (name, FieldArray::with_width(width, values))
        })
        .collect();

    VariableContainer::from_parts_unchecked(class_key.to_string(), timestamps, fields)
}

/// Sorted, de-duplicated union of two ascending unique sequences.
fn sorted_union(a: &[DateTime<Utc>], b: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out.sort_unstable();
    out.dedup();
    out
}

/// Position of each of `own` within `union` (every element is present).
fn union_indices(union: &[DateTime<Utc>], own: &[DateTime<Utc>]) -> Vec<usize> {
    own.iter()
        .map(|t| union.partition_point(|u| u < t))
        .collect()
}

fn scatter_union(class_key: &str, existing: Block<'_>, incoming: Block<'_>) -> VariableContainer {
    let timestamps = sorted_union(existing.timestamps, incoming.timestamps);
    let existing_idx = union_indices(&timestamps, existing.timestamps);
    let incoming_idx = union_indices(&timestamps, incoming.timestamps);

    let fields = field_layout(existing, incoming)
        .into_iter()
        .map(|(name, width)| {
            let mut out = FieldArray::missing(width, timestamps.len());
            // Existing first, then incoming, so incoming overwrites.
            for (block, idx) in [(existing, &existing_idx), (incoming, &incoming_idx)] {
                if let Some(src) = block.fields.get(&name) {
                    for (row, &dst) in src.values().chunks_exact(width).zip(idx.iter()) {
                        out.row_mut(dst).copy_from_slice(row);
                    }
                }
            }
            (name, out)
        })
        .collect();

    VariableContainer::from_parts_unchecked(class_key.to_string(), timestamps, fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    fn scalar_chunk(key: &str, secs: impl IntoIterator<Item = i64>, values: Vec<f64>) -> Chunk {
        let timestamps = secs.into_iter().map(ts).collect();
        Chunk::new(key, timestamps).with_field("f", FieldArray::scalar(values))
    }

    fn merge_all(chunks: Vec<Chunk>) -> VariableContainer {
        let mut acc: Option<VariableContainer> = None;
        for c in chunks {
            acc = Some(merge(acc.as_ref(), c).expect("merge"));
        }
        acc.expect("at least one chunk")
    }

    #[test]
    fn first_chunk_is_adopted_unchanged() {
        let chunk = scalar_chunk("k", 0..3, vec![1.0, 2.0, 3.0]);
        let merged = merge(None, chunk.clone()).expect("merge");
        assert_eq!(merged.timestamps(), chunk.timestamps());
        assert_eq!(merged.fields(), chunk.fields());
    }

    #[test]
    fn overlapping_chunk_overwrites_shared_instants() {
        let a = scalar_chunk("k", 0..=10, (0..=10).map(|i| i as f64).collect());
        let b = scalar_chunk("k", 5..=15, (50..=60).map(|i| i as f64).collect());

        let merged = merge_all(vec![a, b]);
        assert_eq!(merged.len(), 16);
        assert_eq!(merged.field("f").expect("f").len(), 16);

        let f = merged.field("f").expect("f").values();
        for (i, t) in merged.timestamps().iter().enumerate() {
            let secs = t.timestamp();
            let expected = if secs < 5 { secs as f64 } else { (secs + 45) as f64 };
            assert_eq!(f[i], expected, "value at t={secs}");
        }
    }

    #[test]
    fn disjoint_chunks_are_order_independent() {
        let a = scalar_chunk("k", 0..5, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let b = scalar_chunk("k", 10..13, vec![10.0, 11.0, 12.0]);

        let ab = merge_all(vec![a.clone(), b.clone()]);
        let ba = merge_all(vec![b, a]);
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 8);
    }

    #[test]
    fn interleaved_disjoint_chunks_are_order_independent() {
        let a = scalar_chunk("k", [0, 2, 4], vec![0.0, 2.0, 4.0]);
        let b = scalar_chunk("k", [1, 3, 5], vec![1.0, 3.0, 5.0]);

        let ab = merge_all(vec![a.clone(), b.clone()]);
        let ba = merge_all(vec![b, a]);
        assert_eq!(ab, ba);
        assert_eq!(ab.field("f").expect("f").values(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn merging_same_chunk_twice_is_idempotent() {
        let a = scalar_chunk("k", 0..4, vec![1.0, 2.0, 3.0, 4.0]);
        let once = merge_all(vec![a.clone()]);
        let twice = merge_all(vec![a.clone(), a]);
        assert_eq!(once, twice);
    }

    #[test]
    fn later_chunk_wins_on_single_duplicate_at_boundary() {
        let a = scalar_chunk("k", 0..3, vec![1.0, 2.0, 3.0]);
        let b = scalar_chunk("k", 2..5, vec![30.0, 40.0, 50.0]);
        let merged = merge_all(vec![a, b]);
        assert_eq!(merged.field("f").expect("f").values(), &[1.0, 2.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn heterogeneous_fields_are_padded_with_nan() {
        let a = Chunk::new("k", vec![ts(0), ts(1)])
            .with_field("bx", FieldArray::scalar(vec![1.0, 2.0]));
        let b = Chunk::new("k", vec![ts(1), ts(2)])
            .with_field("by", FieldArray::scalar(vec![20.0, 30.0]));

        let merged = merge_all(vec![a, b]);
        let bx = merged.field("bx").expect("bx").values();
        let by = merged.field("by").expect("by").values();
        assert_eq!(bx[..2], [1.0, 2.0]);
        assert!(bx[2].is_nan());
        assert!(by[0].is_nan());
        assert_eq!(by[1..], [20.0, 30.0]);
    }

    #[test]
    fn appended_chunk_with_new_field_pads_existing_rows() {
        let a = Chunk::new("k", vec![ts(0), ts(1)])
            .with_field("bx", FieldArray::scalar(vec![1.0, 2.0]));
        let b = Chunk::new("k", vec![ts(5)])
            .with_field("b_gse", FieldArray::with_width(3, vec![7.0, 8.0, 9.0]));

        let merged = merge_all(vec![a, b]);
        let b_gse = merged.field("b_gse").expect("b_gse");
        assert_eq!(b_gse.len(), 3);
        assert!(b_gse.row(0).expect("row").iter().all(|v| v.is_nan()));
        assert_eq!(b_gse.row(2), Some(&[7.0, 8.0, 9.0][..]));
        assert!(merged.field("bx").expect("bx").values()[2].is_nan());
    }

    #[test]
    fn vector_rows_scatter_as_units() {
        let a = Chunk::new("k", vec![ts(0), ts(2)])
            .with_field("v", FieldArray::from_rows(2, &[[0.0, 0.5], [2.0, 2.5]]));
        let b = Chunk::new("k", vec![ts(1), ts(2)])
            .with_field("v", FieldArray::from_rows(2, &[[1.0, 1.5], [9.0, 9.5]]));

        let merged = merge_all(vec![a, b]);
        assert_eq!(
            merged.field("v").expect("v").values(),
            &[0.0, 0.5, 1.0, 1.5, 9.0, 9.5]
        );
    }

    #[test]
    fn length_mismatch_is_rejected_before_merging() {
        let existing = merge_all(vec![scalar_chunk("k", 0..3, vec![1.0, 2.0, 3.0])]);
        let bad = Chunk::new("k", (0..50).map(ts).collect())
            .with_field("f", FieldArray::scalar(vec![0.0; 100]));

        let err = merge(Some(&existing), bad).unwrap_err();
        match err {
            MergeError::ShapeMismatch {
                class_key,
                field,
                side,
                ..
            } => {
                assert_eq!(class_key, "k");
                assert_eq!(field, "f");
                assert_eq!(side, MergeSide::Chunk);
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn malformed_existing_container_is_reported() {
        let mut fields = BTreeMap::new();
        fields.insert("f".to_string(), FieldArray::scalar(vec![1.0]));
        let existing =
            VariableContainer::from_parts_unchecked("k".to_string(), vec![ts(0), ts(1)], fields);

        let err = merge(Some(&existing), scalar_chunk("k", [5], vec![5.0])).unwrap_err();
        assert!(matches!(
            err,
            MergeError::ShapeMismatch {
                side: MergeSide::Existing,
                ..
            }
        ));
    }

    #[test]
    fn width_change_is_rejected() {
        let existing = merge_all(vec![scalar_chunk("k", 0..2, vec![1.0, 2.0])]);
        let chunk = Chunk::new("k", vec![ts(3)])
            .with_field("f", FieldArray::with_width(2, vec![1.0, 2.0]));

        let err = merge(Some(&existing), chunk).unwrap_err();
        assert!(matches!(
            err,
            MergeError::FieldWidthMismatch {
                existing: 1,
                incoming: 2,
                ..
            }
        ));
    }

    #[test]
    fn foreign_class_key_is_rejected() {
        let existing = merge_all(vec![scalar_chunk("a", 0..2, vec![1.0, 2.0])]);
        let err = merge(Some(&existing), scalar_chunk("b", [3], vec![3.0])).unwrap_err();
        assert!(matches!(err, MergeError::ClassKeyMismatch { .. }));
        assert_eq!(err.class_key(), "b");
    }

    #[test]
    fn unordered_chunk_is_sorted_before_merge() {
        let existing = merge_all(vec![scalar_chunk("k", [0, 10], vec![0.0, 10.0])]);
        let chunk = scalar_chunk("k", [7, 3, 5], vec![7.0, 3.0, 5.0]);
        let merged = merge(Some(&existing), chunk).expect("merge");
        let secs: Vec<i64> = merged.timestamps().iter().map(|t| t.timestamp()).collect();
        assert_eq!(secs, vec![0, 3, 5, 7, 10]);
        assert_eq!(
            merged.field("f").expect("f").values(),
            &[0.0, 3.0, 5.0, 7.0, 10.0]
        );
    }

    #[test]
    fn large_overlap_stays_aligned() {
        let n = 100_000i64;
        let a = scalar_chunk("k", 0..n, (0..n).map(|i| i as f64).collect());
        let b = scalar_chunk("k", n / 2..n + n / 2, vec![-1.0; n as usize]);
        let merged = merge_all(vec![a, b]);
        assert_eq!(merged.len(), (n + n / 2) as usize);
        let f = merged.field("f").expect("f").values();
        assert_eq!(f.len(), merged.len());
        assert_eq!(f[(n / 2 - 1) as usize], (n / 2 - 1) as f64);
        assert_eq!(f[(n / 2) as usize], -1.0);
    }
}
