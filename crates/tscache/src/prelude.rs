//! Wrapper prelude.
//!
//! The `tscache` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on internal core module paths.

pub use crate::coverage::{CoverageQuery, CoverageTracker, Interval, TimeBucket};
pub use crate::snapshot::{Compression, KeySelection, SaveOptions, SnapshotError, SnapshotStore};
pub use crate::{CacheConfig, CacheRegistry, Chunk, FieldArray, IngestError, VariableContainer};
