//! On-disk archive layout.
//!
//! An archive file is the compressed form of:
//!
//! ```text
//! MAGIC (8 bytes) | format version (u32 LE) | bincode(Vec<ArchiveEntry>)
//! ```
//!
//! Timestamps are stored as `i64` nanoseconds since the Unix epoch and field
//! values as raw `f64`, so a save/load cycle reproduces every value bit for
//! bit, `NaN` payloads included.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    container::{FieldArray, VariableContainer},
    snapshot::codec::{self, Codec, CodecError, Compression},
};

const MAGIC: &[u8; 8] = b"TSCACHE\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = MAGIC.len() + 4;

/// Errors from encoding or decoding an archive.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArchiveError {
    /// A timestamp cannot be expressed as i64 nanoseconds.
    #[snafu(display("Timestamp {timestamp} of '{class_key}' is outside the archivable range"))]
    TimestampOutOfRange {
        /// Family holding the timestamp.
        class_key: String,
        /// The unrepresentable instant.
        timestamp: DateTime<Utc>,
    },

    /// bincode failed to serialize the entries.
    #[snafu(display("Failed to serialize archive: {source}"))]
    Serialize {
        /// Underlying bincode error.
        source: bincode::Error,
    },

    /// Compression or decompression failed.
    #[snafu(display("{source}"))]
    Codec {
        /// Underlying codec error.
        source: CodecError,
    },

    /// The payload does not start with the archive magic bytes.
    #[snafu(display("Not a tscache archive (bad magic bytes)"))]
    BadMagic,

    /// The archive was written by an unknown format version.
    #[snafu(display("Unsupported archive format version {version} (expected {FORMAT_VERSION})"))]
    UnsupportedVersion {
        /// Version found in the header.
        version: u32,
    },

    /// bincode could not decode the entries.
    #[snafu(display("Failed to deserialize archive: {source}"))]
    Deserialize {
        /// Underlying bincode error.
        source: bincode::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveField {
    name: String,
    width: u64,
    values: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveEntry {
    class_key: String,
    timestamps_ns: Vec<i64>,
    fields: Vec<ArchiveField>,
}

impl ArchiveEntry {
    fn from_container(c: &VariableContainer) -> Result<Self, ArchiveError> {
        let timestamps_ns = c
            .timestamps()
            .iter()
            .map(|t| {
                t.timestamp_nanos_opt().context(TimestampOutOfRangeSnafu {
                    class_key: c.class_key(),
                    timestamp: *t,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fields = c
            .fields()
            .iter()
            .map(|(name, f)| ArchiveField {
                name: name.clone(),
                width: f.width() as u64,
                values: f.values().to_vec(),
            })
            .collect();

        Ok(Self {
            class_key: c.class_key().to_string(),
            timestamps_ns,
            fields,
        })
    }

    fn into_container(self) -> VariableContainer {
        let timestamps = self
            .timestamps_ns
            .into_iter()
            .map(DateTime::<Utc>::from_timestamp_nanos)
            .collect();
        let fields: BTreeMap<String, FieldArray> = self
            .fields
            .into_iter()
            .map(|f| (f.name, FieldArray::with_width(f.width as usize, f.values)))
            .collect();
        // Shape is re-checked per key by the loader.
        VariableContainer::from_parts_unchecked(self.class_key, timestamps, fields)
    }
}

/// Serialize and compress `containers` into archive bytes.
pub(crate) fn encode<'a>(
    containers: impl IntoIterator<Item = &'a VariableContainer>,
    compression: Compression,
) -> Result<Vec<u8>, ArchiveError> {
    let entries = containers
        .into_iter()
        .map(ArchiveEntry::from_container)
        .collect::<Result<Vec<_>, _>>()?;

    let mut raw = Vec::with_capacity(HEADER_LEN);
    raw.extend_from_slice(MAGIC);
    raw.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bincode::serialize_into(&mut raw, &entries).context(SerializeSnafu)?;

    codec::compress(compression, &raw).context(CodecSnafu)
}

/// Decompress and deserialize archive bytes.
///
/// Returned containers are *not* validated.
pub(crate) fn decode(codec: Codec, bytes: &[u8]) -> Result<Vec<VariableContainer>, ArchiveError> {
    let raw = codec::decompress(codec, bytes).context(CodecSnafu)?;

    ensure!(raw.len() >= HEADER_LEN && raw.starts_with(MAGIC), BadMagicSnafu);
    let mut version = [0u8; 4];
    version.copy_from_slice(&raw[MAGIC.len()..HEADER_LEN]);
    let version = u32::from_le_bytes(version);
    ensure!(version == FORMAT_VERSION, UnsupportedVersionSnafu { version });

    let entries: Vec<ArchiveEntry> =
        bincode::deserialize(&raw[HEADER_LEN..]).context(DeserializeSnafu)?;
    Ok(entries.into_iter().map(ArchiveEntry::into_container).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> VariableContainer {
        let timestamps = vec![
            Utc.timestamp_opt(1_600_000_000, 123_456_789).single().expect("ts"),
            Utc.timestamp_opt(1_600_000_001, 0).single().expect("ts"),
        ];
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FieldArray::scalar(vec![f64::NAN, -0.0]));
        fields.insert(
            "v".to_string(),
            FieldArray::from_rows(3, &[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]),
        );
        VariableContainer::try_new("omni_hro", timestamps, fields).expect("valid")
    }

    #[test]
    fn values_survive_bit_for_bit() {
        let original = sample();
        let bytes = encode([&original], Compression::MEDIUM).expect("encode");
        let decoded = decode(Codec::Gzip, &bytes).expect("decode");
        assert_eq!(decoded.len(), 1);

        let restored = &decoded[0];
        assert_eq!(restored.class_key(), original.class_key());
        assert_eq!(restored.timestamps(), original.timestamps());
        for (name, field) in original.fields() {
            let other = restored.field(name).expect("field");
            assert_eq!(other.width(), field.width());
            let a: Vec<u64> = field.values().iter().map(|v| v.to_bits()).collect();
            let b: Vec<u64> = other.values().iter().map(|v| v.to_bits()).collect();
            assert_eq!(a, b, "field {name}");
        }
    }

    #[test]
    fn rejects_foreign_payload() {
        let err = decode(Codec::Raw, b"PK\x03\x04 not ours at all").unwrap_err();
        assert!(matches!(err, ArchiveError::BadMagic));
    }

    #[test]
    fn rejects_future_version() {
        let mut raw = MAGIC.to_vec();
        raw.extend_from_slice(&99u32.to_le_bytes());
        let err = decode(Codec::Raw, &raw).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedVersion { version: 99 }));
    }

    #[test]
    fn truncated_payload_fails_to_deserialize() {
        let bytes = encode([&sample()], Compression::NONE).expect("encode");
        let err = decode(Codec::Raw, &bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, ArchiveError::Deserialize { .. }));
    }

    #[test]
    fn far_future_timestamp_is_rejected_on_encode() {
        let far = Utc.with_ymd_and_hms(2500, 1, 1, 0, 0, 0).unwrap();
        let c = VariableContainer::try_new("k", vec![far], BTreeMap::new()).expect("valid");
        let err = encode([&c], Compression::NONE).unwrap_err();
        assert!(matches!(err, ArchiveError::TimestampOutOfRange { .. }));
    }
}
