//! Local file helpers for snapshot archives.
//!
//! All writes go through [`write_atomic`]: the payload lands in a temporary
//! sibling file, is synced, and is then renamed over the target. A guard
//! removes the temporary file on every error path, so a failed save never
//! leaves a truncated archive behind under the final name.
//!
//! These helpers are blocking; the cache core has no await points.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use snafu::{Backtrace, IntoError, prelude::*};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The operating-system failure behind a [`StorageError`], tagged with the
/// archive file step that hit it.
#[derive(Debug, Snafu)]
#[snafu(display("snapshot file {step} failed: {source}"))]
pub struct BackendError {
    step: &'static str,
    source: io::Error,
}

impl BackendError {
    /// The step that failed, such as `"rename"` or `"read"`.
    pub fn step(&self) -> &'static str {
        self.step
    }

    /// Kind of the underlying I/O error.
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

/// Errors from reading or writing snapshot archive files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// No archive exists at `path`.
    #[snafu(display("Snapshot file not found: {path}"))]
    NotFound {
        /// The path that was looked up.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Any other filesystem failure on an archive or its directory.
    #[snafu(display("Snapshot I/O error at {path}: {source}"))]
    OtherIo {
        /// The path being read or written.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

fn io_error(step: &'static str, path: &Path) -> impl FnOnce(io::Error) -> StorageError {
    let path = path.display().to_string();
    move |e| {
        let not_found = e.kind() == io::ErrorKind::NotFound;
        let backend = BackendSnafu { step }.into_error(e);
        if not_found {
            NotFoundSnafu { path }.into_error(backend)
        } else {
            OtherIoSnafu { path }.into_error(backend)
        }
    }
}

/// Removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best effort; the caller is already returning an error.
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `contents`, creating parent directories.
///
/// # Errors
///
/// [`StorageError::OtherIo`] when any filesystem step fails.
pub fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error("mkdir", parent))?;
    }

    let tmp_path = temp_path_for(path);
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path).map_err(io_error("create", &tmp_path))?;
        file.write_all(contents)
            .map_err(io_error("write", &tmp_path))?;
        file.sync_all().map_err(io_error("sync", &tmp_path))?;
    }

    fs::rename(&tmp_path, path).map_err(io_error("rename", path))?;
    guard.disarm();
    Ok(())
}

/// Read the whole file at `path`.
///
/// # Errors
///
/// [`StorageError::NotFound`] if the file does not exist, otherwise
/// [`StorageError::OtherIo`].
pub fn read_all_bytes(path: &Path) -> StorageResult<Vec<u8>> {
    fs::read(path).map_err(io_error("read", path))
}
