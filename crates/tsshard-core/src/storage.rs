//! Filesystem helpers for the meta log.
//!
//! This module centralizes the few on-disk interactions the metadata core
//! needs: reading the whole log file on open (interpreting "no file" as a
//! fresh shard), and opening it for appends with the parent directory
//! created on demand. Higher layers work with typed errors instead of raw
//! `io::Error`s and never build paths by string concatenation.

use std::io;
use std::path::Path;

use snafu::{prelude::*, Backtrace};
use tokio::fs::{self, File, OpenOptions};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("local I/O error at {path}: {source}"))]
    LocalIo {
        /// The path where the I/O error occurred.
        path: String,
        /// The underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Read the whole file at `path`.
///
/// A missing file is reported as `StorageError::NotFound` so callers can
/// treat it as an empty, fresh log.
pub async fn read_file_bytes(path: &Path) -> StorageResult<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => NotFoundSnafu {
            path: path.display().to_string(),
        }
        .fail(),
        Err(e) => Err(e).context(LocalIoSnafu {
            path: path.display().to_string(),
        }),
    }
}

/// Open `path` for appending, creating the file and its parent directory
/// when absent.
pub async fn open_append(path: &Path) -> StorageResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.context(LocalIoSnafu {
            path: parent.display().to_string(),
        })?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context(LocalIoSnafu {
            path: path.display().to_string(),
        })
}
