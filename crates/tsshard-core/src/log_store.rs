//! File-backed key-value store for the meta action log.
//!
//! The store keeps one append-only file, `META`, under the shard root. The
//! file is a concatenation of [`ActionRecord`]s. On open the whole file is
//! replayed and folded by uid — an UpdateMeta record inserts or replaces
//! the entry for its table, a DropMeta record deletes it — so only the
//! newest surviving state per table is handed to the restore callback, in
//! first-registration order. A truncated or undecodable tail aborts the
//! open with a corruption error.
//!
//! Compaction of the file down to its surviving records is left to the
//! hosting repository's maintenance path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use snafu::prelude::*;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::action::{ActionRecord, MetaAction};
use crate::error::{FileCorruptedSnafu, MetaResult, StorageSnafu};
use crate::storage::{self, LocalIoSnafu, StorageError};
use crate::table::Uid;

/// Append-only, uid-keyed store for meta action records.
#[derive(Debug)]
pub struct MetaLogStore {
    path: PathBuf,
    file: File,
}

impl MetaLogStore {
    /// Name of the log file under the shard root.
    pub const META_FILE_NAME: &str = "META";

    /// Open (or create) the store under `root_dir` and replay every
    /// surviving record through `restore`, in first-registration order.
    ///
    /// The restore callback aborting propagates up and fails the open;
    /// partial registry state is the caller's to discard.
    pub async fn open<F>(root_dir: &Path, mut restore: F) -> MetaResult<Self>
    where
        F: FnMut(&ActionRecord) -> MetaResult<()>,
    {
        let path = root_dir.join(Self::META_FILE_NAME);

        let bytes = match storage::read_file_bytes(&path).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => Vec::new(),
            Err(source) => return Err(source).context(StorageSnafu),
        };

        let survivors = fold_records(&path, &bytes)?;
        let n = survivors.len();
        for record in &survivors {
            restore(record)?;
        }

        let file = storage::open_append(&path).await.context(StorageSnafu)?;

        debug!("meta log {} opened, {n} surviving records", path.display());
        Ok(Self { path, file })
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records to the log and flush them to disk.
    pub async fn append(&mut self, records: &[ActionRecord]) -> MetaResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            record.encode(&mut buf);
        }
        self.write_all(&buf).await?;
        trace!(
            "meta log {}: {} records appended",
            self.path.display(),
            records.len()
        );
        Ok(())
    }

    /// Flush and release the store.
    pub async fn close(self) -> MetaResult<()> {
        self.file
            .sync_all()
            .await
            .context(LocalIoSnafu {
                path: self.path.display().to_string(),
            })
            .context(StorageSnafu)?;
        debug!("meta log {} closed", self.path.display());
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> MetaResult<()> {
        let io = async {
            self.file.write_all(buf).await?;
            self.file.sync_all().await
        };
        io.await
            .context(LocalIoSnafu {
                path: self.path.display().to_string(),
            })
            .context(StorageSnafu)
    }
}

/// Parse the raw log bytes and fold them by uid.
fn fold_records(path: &Path, bytes: &[u8]) -> MetaResult<Vec<ActionRecord>> {
    let mut order: Vec<Uid> = Vec::new();
    let mut live: HashMap<Uid, ActionRecord> = HashMap::new();

    let mut rd: &[u8] = bytes;
    while !rd.is_empty() {
        let record = ActionRecord::decode(&mut rd).map_err(|e| {
            FileCorruptedSnafu {
                reason: format!("{}: {e}", path.display()),
            }
            .build()
        })?;
        match record.act() {
            MetaAction::UpdateMeta => {
                let uid = record.uid();
                if live.insert(uid, record).is_none() {
                    order.push(uid);
                }
            }
            MetaAction::DropMeta => {
                let uid = record.uid();
                if live.remove(&uid).is_some() {
                    order.retain(|u| *u != uid);
                }
            }
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|uid| live.remove(&uid))
        .collect())
}
