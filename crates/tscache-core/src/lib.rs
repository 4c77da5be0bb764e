//! Core engine for an in-memory time-series cache.
//!
//! Data arrives in chunks from an external fetcher and is folded into one
//! canonical container per variable family:
//!
//! - [`container`]: the per-family container (timestamps plus aligned
//!   field arrays) and the incoming [`Chunk`] type.
//! - [`merge`]: validates a chunk and combines it with the existing
//!   container, rejecting anything that would break row alignment.
//! - [`coverage`]: interval bookkeeping of which time windows are cached,
//!   plus bucketed gap analysis on `RoaringBitmap`s.
//! - [`registry`]: owns the containers and coverage and commits ingests
//!   atomically.
//! - [`snapshot`]: saves registry contents to compressed archives and
//!   restores them.
//! - [`config`] and [`storage`]: JSON settings and the atomic file writes
//!   used by snapshots.
//!
//! Everything here is synchronous. Callers serialize writes per family.
#![deny(missing_docs)]
pub mod config;
pub mod container;
pub mod coverage;
pub mod merge;
pub mod registry;
pub mod snapshot;
pub mod storage;

pub use config::{CacheConfig, ConfigError};
pub use container::{Chunk, ContainerError, FieldArray, VariableContainer};
pub use coverage::{CoverageError, CoverageQuery, CoverageTracker, Interval, IntervalSet};
pub use merge::{MergeError, merge};
pub use registry::{CacheRegistry, IngestError};
pub use snapshot::{
    KeySelection, LoadReport, SaveOptions, SaveReport, SnapshotError, SnapshotStore,
    codec::{Codec, Compression, ParseCompressionError},
};
