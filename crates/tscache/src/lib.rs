//! # tscache
//!
//! Incremental time-series cache: merge fetched chunks into one container
//! per variable family, track which windows are cached, and snapshot the
//! whole cache to compressed archives.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust
//! use tscache::prelude::*;
//! use chrono::{TimeZone, Utc};
//!
//! let t = |s| Utc.timestamp_opt(s, 0).single().unwrap();
//! let mut registry = CacheRegistry::new();
//! let chunk = Chunk::new("omni_hro", vec![t(0), t(60)])
//!     .with_field("bz", FieldArray::scalar(vec![1.5, -2.0]));
//! registry.ingest("omni_hro", chunk).unwrap();
//!
//! let q = registry.coverage().query("omni_hro", t(0), t(120)).unwrap();
//! assert!(!q.fully_covered);
//! assert_eq!(q.gaps, vec![Interval::new(t(60), t(120))]);
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Coverage namespace (wrapper-only).
pub mod coverage {
    pub use tscache_core::coverage::{
        CoverageQuery, CoverageTracker, Interval, IntervalSet,
        bucket::BucketCoverage,
        time_bucket::{ParseTimeBucketError, TimeBucket},
    };
}

/// Snapshot namespace (wrapper-only).
pub mod snapshot {
    pub use tscache_core::snapshot::{
        KeySelection, LoadReport, SaveOptions, SaveReport, SnapshotError, SnapshotStore,
        codec::{Codec, Compression, ParseCompressionError},
        family_tag,
    };
}

pub use tscache_core::config::{CacheConfig, ConfigError};
pub use tscache_core::container::{Chunk, ContainerError, FieldArray, VariableContainer};
pub use tscache_core::coverage::CoverageError;
pub use tscache_core::merge::{MergeError, merge};
pub use tscache_core::registry::{CacheRegistry, IngestError};
