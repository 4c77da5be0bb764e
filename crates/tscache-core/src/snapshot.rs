//! Snapshot store: persist registry contents to a compressed archive and
//! restore them later.
//!
//! A save writes one archive holding the selected families. The archive's
//! file extension names its codec (`.none`, `.gz`, `.bz2`, `.xz`), which is
//! how [`SnapshotStore::load`] picks the decompressor.
//!
//! Loading is per key. A restored family whose key already has a live
//! entry is merged with it through the regular merge engine, and live
//! samples win where both hold the same timestamp. A key that fails to
//! restore is logged and skipped; the rest of the archive still loads.

pub mod archive;
pub mod codec;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use snafu::prelude::*;

use crate::{
    config::CacheConfig,
    container::Chunk,
    merge::merge,
    registry::CacheRegistry,
    snapshot::{
        archive::ArchiveError,
        codec::{Codec, Compression},
    },
    storage::{self, StorageError},
};

/// Suffix placed before the codec extension of generated names.
pub const ARCHIVE_SUFFIX: &str = "tscache";

const NAME_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Errors from saving or loading a snapshot.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SnapshotError {
    /// No archive exists at the path.
    #[snafu(display("Snapshot not found: {}", path.display()))]
    NotFound {
        /// Resolved archive path.
        path: PathBuf,
    },

    /// Reading or writing the archive file failed.
    #[snafu(display("Snapshot I/O failed at {}: {source}", path.display()))]
    Storage {
        /// Resolved archive path.
        path: PathBuf,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The selected families could not be encoded.
    #[snafu(display("Failed to encode snapshot: {source}"))]
    Encode {
        /// Underlying archive error.
        source: ArchiveError,
    },

    /// The archive could not be decoded.
    #[snafu(display("Failed to decode snapshot {}: {source}", path.display()))]
    Decode {
        /// Resolved archive path.
        path: PathBuf,
        /// Underlying archive error.
        source: ArchiveError,
    },
}

/// Which families a save or load touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeySelection {
    /// Every family.
    #[default]
    All,
    /// Only the listed class keys.
    Only(BTreeSet<String>),
}

impl KeySelection {
    /// Select exactly `keys`.
    pub fn only<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeySelection::Only(keys.into_iter().map(Into::into).collect())
    }

    /// True when `class_key` is selected.
    pub fn contains(&self, class_key: &str) -> bool {
        match self {
            KeySelection::All => true,
            KeySelection::Only(keys) => keys.contains(class_key),
        }
    }

    fn missing_from(&self, present: impl Fn(&str) -> bool) -> Vec<String> {
        match self {
            KeySelection::All => Vec::new(),
            KeySelection::Only(keys) => keys
                .iter()
                .filter(|k| !present(k.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Parameters of a single save.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Families to save.
    pub keys: KeySelection,
    /// Codec and level.
    pub compression: Compression,
    /// Target file. Relative paths resolve under the snapshot directory;
    /// `None` generates a name.
    pub path: Option<PathBuf>,
}

/// Outcome of [`SnapshotStore::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    /// Archive written, or `None` when nothing was worth saving.
    pub path: Option<PathBuf>,
    /// Families written to the archive.
    pub saved: Vec<String>,
    /// Selected families skipped because they hold no data.
    pub skipped_empty: Vec<String>,
    /// Selected keys with no registry entry.
    pub missing: Vec<String>,
    /// Compression applied.
    pub compression: Compression,
}

/// Outcome of [`SnapshotStore::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Families installed into an empty slot.
    pub restored: Vec<String>,
    /// Families merged with an existing live entry.
    pub merged: Vec<String>,
    /// Families that failed to restore, with the reason.
    pub skipped: Vec<(String, String)>,
    /// Selected keys not present in the archive.
    pub missing: Vec<String>,
}

impl LoadReport {
    /// Number of families now holding archive data.
    pub fn loaded(&self) -> usize {
        self.restored.len() + self.merged.len()
    }
}

/// Reads and writes archives under a snapshot directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    auto_name: bool,
}

impl SnapshotStore {
    /// Store rooted at `dir`, generating names for saves without a path.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            auto_name: true,
        }
    }

    /// Store configured from `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            dir: config.snapshot_dir.clone(),
            auto_name: config.auto_name,
        }
    }

    /// Snapshot directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute paths are used as-is, anything else lands under [`dir`](Self::dir).
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    /// Write the selected non-empty families of `registry` to one archive.
    ///
    /// Families with no samples or only missing values are skipped. If none
    /// remain, nothing is written and the report's `path` is `None`.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Encode`] if a family cannot be archived, or
    /// [`SnapshotError::Storage`] if the file cannot be written. A failed
    /// save leaves no partial file under the target name.
    pub fn save(
        &self,
        registry: &CacheRegistry,
        options: &SaveOptions,
    ) -> Result<SaveReport, SnapshotError> {
        let mut saved = Vec::new();
        let mut skipped_empty = Vec::new();
        let mut containers = Vec::new();

        for (key, container) in registry.iter().filter(|(k, _)| options.keys.contains(k)) {
            if container.has_no_data() {
                skipped_empty.push(key.to_string());
            } else {
                saved.push(key.to_string());
                containers.push(container);
            }
        }
        let missing = options.keys.missing_from(|k| registry.lookup(k).is_some());

        let compression = options.compression;
        if containers.is_empty() {
            warn!("snapshot save: no non-empty families selected, nothing written");
            return Ok(SaveReport {
                path: None,
                saved,
                skipped_empty,
                missing,
                compression,
            });
        }

        let name = match &options.path {
            Some(p) => p.clone(),
            None if self.auto_name => PathBuf::from(auto_file_name(
                saved.iter().map(String::as_str),
                containers.iter().filter_map(|c| c.time_span()),
            )),
            None => PathBuf::from(format!("cache.{ARCHIVE_SUFFIX}")),
        };
        let path = with_codec_extension(self.resolve(&name), compression.codec);

        let bytes = archive::encode(containers.iter().copied(), compression).context(EncodeSnafu)?;
        storage::write_atomic(&path, &bytes).context(StorageSnafu { path: path.clone() })?;

        info!(
            "snapshot saved: {} famil{} to {} ({compression}, {} bytes)",
            saved.len(),
            if saved.len() == 1 { "y" } else { "ies" },
            path.display(),
            bytes.len()
        );

        Ok(SaveReport {
            path: Some(path),
            saved,
            skipped_empty,
            missing,
            compression,
        })
    }

    /// Restore the selected families of the archive at `path` into
    /// `registry`, marking each restored time span as covered.
    ///
    /// A family that already has a live entry is merged with it, and on
    /// instants present in both the resident live values win over the
    /// archived ones.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::NotFound`] if the file does not exist,
    /// [`SnapshotError::Decode`] if it is not a readable archive, and
    /// [`SnapshotError::Storage`] for other read failures. Per-family
    /// failures are reported in [`LoadReport::skipped`] instead.
    pub fn load(
        &self,
        registry: &mut CacheRegistry,
        path: impl AsRef<Path>,
        keys: &KeySelection,
    ) -> Result<LoadReport, SnapshotError> {
        let path = self.resolve(path.as_ref());
        let codec = Codec::from_path(&path).unwrap_or_else(|| {
            warn!(
                "snapshot {}: unrecognized extension, reading uncompressed",
                path.display()
            );
            Codec::Raw
        });

        let bytes = match storage::read_all_bytes(&path) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => return NotFoundSnafu { path }.fail(),
            Err(source) => return Err(SnapshotError::Storage { path, source }),
        };
        let containers =
            archive::decode(codec, &bytes).context(DecodeSnafu { path: path.clone() })?;

        let mut report = LoadReport {
            missing: keys.missing_from(|k| containers.iter().any(|c| c.class_key() == k)),
            ..LoadReport::default()
        };

        for restored in containers.into_iter().filter(|c| keys.contains(c.class_key())) {
            let key = restored.class_key().to_string();

            if let Err(e) = restored.validate() {
                warn!("snapshot {}: skipping '{key}': {e}", path.display());
                report.skipped.push((key, e.to_string()));
                continue;
            }
            let span = restored.time_span();

            let installed = match registry.lookup(&key).cloned() {
                Some(live) => match merge(Some(&restored), Chunk::from(live)) {
                    Ok(merged) => {
                        registry.replace(key.clone(), merged);
                        report.merged.push(key.clone());
                        true
                    }
                    Err(e) => {
                        warn!("snapshot {}: skipping '{key}': {e}", path.display());
                        report.skipped.push((key.clone(), e.to_string()));
                        false
                    }
                },
                None => {
                    registry.replace(key.clone(), restored);
                    report.restored.push(key.clone());
                    true
                }
            };

            if let (true, Some((start, end))) = (installed, span) {
                // Validated timestamps are ascending.
                if let Err(e) = registry.mark_covered(&key, start, end) {
                    warn!("snapshot {}: coverage for '{key}' not marked: {e}", path.display());
                }
            }
        }

        info!(
            "snapshot loaded from {}: {} restored, {} merged, {} skipped",
            path.display(),
            report.restored.len(),
            report.merged.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

/// Short family tag used in generated names: the part of `class_key`
/// before the first `_`, lowercased, limited to ASCII alphanumerics.
pub fn family_tag(class_key: &str) -> String {
    let head = class_key.split('_').next().unwrap_or_default();
    let tag: String = head
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if tag.is_empty() {
        "cache".to_string()
    } else {
        tag
    }
}

/// Generated archive name: `{tags}_{start}_{end}.tscache`, where `tags`
/// is the sorted set of family tags joined by `+` and the times are the
/// overall first and last saved timestamps.
fn auto_file_name<'a>(
    keys: impl IntoIterator<Item = &'a str>,
    spans: impl IntoIterator<Item = (DateTime<Utc>, DateTime<Utc>)>,
) -> String {
    let tags: BTreeSet<String> = keys.into_iter().map(family_tag).collect();
    let tags = tags.into_iter().collect::<Vec<_>>().join("+");

    let bounds = spans
        .into_iter()
        .reduce(|(s0, e0), (s1, e1)| (s0.min(s1), e0.max(e1)));
    match bounds {
        Some((start, end)) => format!(
            "{tags}_{}_{}.{ARCHIVE_SUFFIX}",
            start.format(NAME_TIME_FORMAT),
            end.format(NAME_TIME_FORMAT)
        ),
        None => format!("{tags}.{ARCHIVE_SUFFIX}"),
    }
}

fn with_codec_extension(path: PathBuf, codec: Codec) -> PathBuf {
    if Codec::from_path(&path) == Some(codec) {
        return path;
    }
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(codec.extension());
    path.with_file_name(name)
}
