//! Cache configuration.
//!
//! Configuration is a small JSON document; every key is optional:
//!
//! ```json
//! {
//!   "snapshot_dir": "/data/tscache",
//!   "compression": "high",
//!   "auto_name": true,
//!   "fetch_bucket": "1d"
//! }
//! ```

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{coverage::time_bucket::TimeBucket, snapshot::codec::Compression};

/// Errors from loading a [`CacheConfig`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The config file could not be read.
    #[snafu(display("Failed to read config {}: {source}", path.display()))]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The config is not valid JSON of the expected shape.
    #[snafu(display("Failed to parse config: {source}"))]
    Parse {
        /// Underlying serde_json error.
        source: serde_json::Error,
    },
}

/// Settings shared by the snapshot store and its callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory that relative snapshot paths resolve against.
    pub snapshot_dir: PathBuf,
    /// Default compression for saves.
    pub compression: Compression,
    /// Generate archive names from family tags and time span when a save
    /// gives no path.
    pub auto_name: bool,
    /// Width of one fetch file, for [`CoverageTracker::bucket_coverage`].
    ///
    /// [`CoverageTracker::bucket_coverage`]: crate::coverage::CoverageTracker::bucket_coverage
    pub fetch_bucket: TimeBucket,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("snapshots"),
            compression: Compression::default(),
            auto_name: true,
            fetch_bucket: TimeBucket::Days(1),
        }
    }
}

impl CacheConfig {
    /// Parse a JSON config string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).context(ParseSnafu)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::codec::Codec;

    #[test]
    fn empty_object_gives_defaults() {
        let cfg = CacheConfig::from_json_str("{}").expect("parse");
        assert_eq!(cfg, CacheConfig::default());
        assert_eq!(cfg.compression, Compression::MEDIUM);
    }

    #[test]
    fn fields_override_defaults() {
        let cfg = CacheConfig::from_json_str(
            r#"{"snapshot_dir": "/data/ts", "compression": "bz2:3", "auto_name": false}"#,
        )
        .expect("parse");
        assert_eq!(cfg.snapshot_dir, PathBuf::from("/data/ts"));
        assert_eq!(
            cfg.compression,
            Compression {
                codec: Codec::Bzip2,
                level: 3
            }
        );
        assert!(!cfg.auto_name);
    }

    #[test]
    fn unknown_compression_falls_back_to_none() {
        let cfg = CacheConfig::from_json_str(r#"{"compression": "snappy"}"#).expect("parse");
        assert_eq!(cfg.compression, Compression::NONE);
    }

    #[test]
    fn serializes_back_to_json() {
        let cfg = CacheConfig {
            compression: Compression::HIGH,
            ..CacheConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains(r#""compression":"high""#));
        assert_eq!(CacheConfig::from_json_str(&json).expect("parse"), cfg);
    }

    #[test]
    fn fetch_bucket_parses_from_short_form() {
        let cfg = CacheConfig::from_json_str(r#"{"fetch_bucket": "6h"}"#).expect("parse");
        assert_eq!(cfg.fetch_bucket, TimeBucket::Hours(6));
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains(r#""fetch_bucket":"6h""#));

        let err = CacheConfig::from_json_str(r#"{"fetch_bucket": "6w"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = CacheConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_read_error() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let err = CacheConfig::from_json_file(tmp.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
