//! Variable containers and import chunks.
//!
//! A [`VariableContainer`] holds one variable family: a strictly increasing
//! timestamp array plus any number of named numeric field arrays. Every
//! field carries exactly one row per timestamp. That row-alignment rule is
//! the invariant the rest of the crate is built around:
//!
//! - containers installed in the registry always satisfy it;
//! - [`Chunk`]s coming from an import collaborator are *checked* against
//!   it before any merge arithmetic runs (see [`crate::merge`]).
//!
//! Containers are passive values. They never merge themselves; combining
//! two containers is the job of the merge engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use snafu::prelude::*;

/// Errors raised when a container or chunk violates its shape rules.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ContainerError {
    /// A field's row count differs from the number of timestamps.
    #[snafu(display(
        "field '{field}' of '{class_key}' has {actual} rows but there are {expected} timestamps"
    ))]
    RowCountMismatch {
        /// Family the field belongs to.
        class_key: String,
        /// Offending field name.
        field: String,
        /// Number of timestamps.
        expected: usize,
        /// Number of rows in the field.
        actual: usize,
    },

    /// A field's value buffer is not a whole number of rows.
    #[snafu(display(
        "field '{field}' of '{class_key}' has {values} values, not a multiple of width {width}"
    ))]
    RaggedField {
        /// Family the field belongs to.
        class_key: String,
        /// Offending field name.
        field: String,
        /// Declared columns per row.
        width: usize,
        /// Length of the flat value buffer.
        values: usize,
    },

    /// A field declared zero columns per row.
    #[snafu(display("field '{field}' of '{class_key}' has zero width"))]
    ZeroWidth {
        /// Family the field belongs to.
        class_key: String,
        /// Offending field name.
        field: String,
    },

    /// Timestamps are not strictly increasing.
    #[snafu(display(
        "timestamps of '{class_key}' are not strictly increasing at index {index} ({previous} >= {current})"
    ))]
    Unordered {
        /// Family with the unordered timestamps.
        class_key: String,
        /// Index of the first out-of-order timestamp.
        index: usize,
        /// Timestamp preceding `index`.
        previous: DateTime<Utc>,
        /// Timestamp at `index`.
        current: DateTime<Utc>,
    },
}

/// Row-major numeric samples for one field.
///
/// Scalar series have `width == 1`. Vector quantities (for example a
/// three-component magnetic field) store `width` consecutive values per
/// row. Missing samples are `f64::NAN`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArray {
    width: usize,
    values: Vec<f64>,
}

impl FieldArray {
    /// Wrap a flat buffer of scalar samples.
    pub fn scalar(values: Vec<f64>) -> Self {
        Self { width: 1, values }
    }

    /// Wrap a flat row-major buffer with `width` columns per row.
    ///
    /// The buffer is not checked here; shape problems surface when the
    /// owning chunk is validated.
    pub fn with_width(width: usize, values: Vec<f64>) -> Self {
        Self { width, values }
    }

    /// Build a field from per-row vectors of equal length.
    pub fn from_rows<R: AsRef<[f64]>>(width: usize, rows: &[R]) -> Self {
        let mut values = Vec::with_capacity(width * rows.len());
        for row in rows {
            values.extend_from_slice(row.as_ref());
        }
        Self { width, values }
    }

    /// A field of `len` rows with every value missing.
    pub fn missing(width: usize, len: usize) -> Self {
        Self {
            width,
            values: vec![f64::NAN; width * len],
        }
    }

    /// Columns per row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.values.len().checked_div(self.width).unwrap_or(0)
    }

    /// True when the field has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat row-major value buffer.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Consume the field and return its flat buffer.
    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    /// Borrow row `index`, if it exists.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        let start = index.checked_mul(self.width)?;
        self.values.get(start..start + self.width)
    }

    /// True when every value of this field is missing.
    pub fn is_all_missing(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }

    pub(crate) fn row_mut(&mut self, index: usize) -> &mut [f64] {
        let start = index * self.width;
        &mut self.values[start..start + self.width]
    }

    /// Check the buffer against `expected` rows.
    pub(crate) fn check_shape(
        &self,
        class_key: &str,
        field: &str,
        expected: usize,
    ) -> Result<(), ContainerError> {
        ensure!(
            self.width > 0,
            ZeroWidthSnafu {
                class_key,
                field,
            }
        );
        ensure!(
            self.values.len() % self.width == 0,
            RaggedFieldSnafu {
                class_key,
                field,
                width: self.width,
                values: self.values.len(),
            }
        );
        ensure!(
            self.len() == expected,
            RowCountMismatchSnafu {
                class_key,
                field,
                expected,
                actual: self.len(),
            }
        );
        Ok(())
    }
}

/// One variable family's cached samples.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableContainer {
    class_key: String,
    timestamps: Vec<DateTime<Utc>>,
    fields: BTreeMap<String, FieldArray>,
}

impl VariableContainer {
    /// An empty container for `class_key`.
    pub fn empty(class_key: impl Into<String>) -> Self {
        Self {
            class_key: class_key.into(),
            timestamps: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Build a container and check that it is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError`] when a field's shape disagrees with the
    /// timestamps or the timestamps are not strictly increasing.
    pub fn try_new(
        class_key: impl Into<String>,
        timestamps: Vec<DateTime<Utc>>,
        fields: BTreeMap<String, FieldArray>,
    ) -> Result<Self, ContainerError> {
        let container = Self::from_parts_unchecked(class_key.into(), timestamps, fields);
        container.validate()?;
        Ok(container)
    }

    pub(crate) fn from_parts_unchecked(
        class_key: String,
        timestamps: Vec<DateTime<Utc>>,
        fields: BTreeMap<String, FieldArray>,
    ) -> Self {
        Self {
            class_key,
            timestamps,
            fields,
        }
    }

    /// Identity of the variable family.
    pub fn class_key(&self) -> &str {
        &self.class_key
    }

    /// Sample instants, strictly increasing.
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// All fields keyed by name.
    pub fn fields(&self) -> &BTreeMap<String, FieldArray> {
        &self.fields
    }

    /// Look up a single field.
    pub fn field(&self, name: &str) -> Option<&FieldArray> {
        self.fields.get(name)
    }

    /// Field names in sorted order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// True when the container holds no samples.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// True when there is nothing worth persisting: no samples, no fields,
    /// or only fields whose values are all missing.
    pub fn has_no_data(&self) -> bool {
        self.timestamps.is_empty()
            || self.fields.is_empty()
            || self.fields.values().all(FieldArray::is_all_missing)
    }

    /// First and last timestamp, if any.
    pub fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((*self.timestamps.first()?, *self.timestamps.last()?))
    }

    /// Split into raw parts.
    pub fn into_parts(self) -> (String, Vec<DateTime<Utc>>, BTreeMap<String, FieldArray>) {
        (self.class_key, self.timestamps, self.fields)
    }

    /// Check row alignment of every field and timestamp ordering.
    ///
    /// # Errors
    ///
    /// The first violation found, naming the offending field or index.
    pub fn validate(&self) -> Result<(), ContainerError> {
        self.validate_shape()?;
        check_strictly_increasing(&self.class_key, &self.timestamps)
    }

    pub(crate) fn validate_shape(&self) -> Result<(), ContainerError> {
        let expected = self.timestamps.len();
        for (name, field) in &self.fields {
            field.check_shape(&self.class_key, name, expected)?;
        }
        Ok(())
    }
}

fn check_strictly_increasing(
    class_key: &str,
    timestamps: &[DateTime<Utc>],
) -> Result<(), ContainerError> {
    for (i, pair) in timestamps.windows(2).enumerate() {
        ensure!(
            pair[0] < pair[1],
            UnorderedSnafu {
                class_key,
                index: i + 1,
                previous: pair[0],
                current: pair[1],
            }
        );
    }
    Ok(())
}

/// A freshly imported, not yet merged unit of samples.
///
/// Import collaborators promise ascending unique timestamps and one row per
/// timestamp in every field. The row promise is verified at ingest; the
/// ordering promise is repaired by [`Chunk::normalized`].
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    class_key: String,
    timestamps: Vec<DateTime<Utc>>,
    fields: BTreeMap<String, FieldArray>,
}

impl Chunk {
    /// A chunk with no fields yet.
    pub fn new(class_key: impl Into<String>, timestamps: Vec<DateTime<Utc>>) -> Self {
        Self {
            class_key: class_key.into(),
            timestamps,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, name: impl Into<String>, field: FieldArray) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Insert or replace a field.
    pub fn insert_field(&mut self, name: impl Into<String>, field: FieldArray) {
        self.fields.insert(name.into(), field);
    }

    /// Family this chunk belongs to.
    pub fn class_key(&self) -> &str {
        &self.class_key
    }

    /// Sample instants as delivered.
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// Fields keyed by name.
    pub fn fields(&self) -> &BTreeMap<String, FieldArray> {
        &self.fields
    }

    /// Number of timestamps.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// True when the chunk carries no timestamps.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Earliest and latest timestamp regardless of delivery order.
    pub fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let min = self.timestamps.iter().min()?;
        let max = self.timestamps.iter().max()?;
        Some((*min, *max))
    }

    /// Check that every field has exactly one row per timestamp.
    ///
    /// # Errors
    ///
    /// [`ContainerError`] naming the first malformed field.
    pub fn validate_shape(&self) -> Result<(), ContainerError> {
        let expected = self.timestamps.len();
        for (name, field) in &self.fields {
            field.check_shape(&self.class_key, name, expected)?;
        }
        Ok(())
    }

    /// Sort rows by timestamp, keeping the last row for duplicated instants.
    ///
    /// Must only be called on a chunk whose shape has been validated.
    pub(crate) fn normalized(self) -> Self {
        if self.timestamps.windows(2).all(|w| w[0] < w[1]) {
            return self;
        }

        log::warn!(
            "chunk for '{}' has unordered or duplicate timestamps; sorting {} rows",
            self.class_key,
            self.timestamps.len()
        );

        let mut order: Vec<usize> = (0..self.timestamps.len()).collect();
        // Stable, so among equal instants the later row stays later.
        order.sort_by_key(|&i| self.timestamps[i]);

        let mut keep: Vec<usize> = Vec::with_capacity(order.len());
        for i in order {
            match keep.last_mut() {
                Some(last) if self.timestamps[*last] == self.timestamps[i] => *last = i,
                _ => keep.push(i),
            }
        }

        let timestamps = keep.iter().map(|&i| self.timestamps[i]).collect();
        let fields = self
            .fields
            .into_iter()
            .map(|(name, field)| {
                let width = field.width;
                let mut values = Vec::with_capacity(width * keep.len());
                for &i in &keep {
                    values.extend_from_slice(&field.values[i * width..(i + 1) * width]);
                }
                (name, FieldArray { width, values })
            })
            .collect();

        Self {
            class_key: self.class_key,
            timestamps,
            fields,
        }
    }

    /// Adopt the chunk's arrays as a container without copying.
    pub(crate) fn into_container(self) -> VariableContainer {
        VariableContainer::from_parts_unchecked(self.class_key, self.timestamps, self.fields)
    }
}

impl From<VariableContainer> for Chunk {
    fn from(container: VariableContainer) -> Self {
        let (class_key, timestamps, fields) = container.into_parts();
        Self {
            class_key,
            timestamps,
            fields,
        }
    }
}
