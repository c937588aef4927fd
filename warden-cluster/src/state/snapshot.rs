//! Snapshot artifact and its on-disk store.
//!
//! The artifact is a [`SnapshotDocument`]: the encoded namespace table and
//! the encoded cluster metadata, side by side. Snapshot files written by
//! [`SnapshotStore`] carry a small header, the openraft metadata and the
//! document bytes.
//!
//! ```text
//! "WSNP" | version: u32 LE | meta_len: u64 LE | meta (JSON) | document
//! ```

use super::machine::StoredSnapshot;
use super::metadata::{ClusterMetadata, MetadataStore};
use super::namespaces::{NamespaceTable, TableDecodeError};
use crate::types::WardenSnapshotMeta;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;
/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"WSNP";
/// Name of the snapshot directory inside the data directory.
const SNAPSHOT_DIR: &str = "snapshots";

/// Magic, version and metadata length.
const HEADER_LEN: u64 = 16;

/// Errors produced while building, persisting or restoring snapshots.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The artifact or one of its parts could not be encoded.
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    /// The artifact or its metadata part is not decodable.
    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),

    /// The enforcer table could not be rebuilt.
    #[error(transparent)]
    Table(#[from] TableDecodeError),

    /// A snapshot file has the wrong header.
    #[error("invalid snapshot file {path}: {reason}")]
    Format {
        /// Offending file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// Filesystem failure.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Point-in-time copy of all replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    /// Encoded [`NamespaceTable`].
    pub enforcers: Vec<u8>,
    /// Encoded [`ClusterMetadata`].
    pub meta: Vec<u8>,
}

impl SnapshotDocument {
    /// Capture the current table and metadata.
    pub fn build(table: &NamespaceTable, metadata: &MetadataStore) -> Result<Self, SnapshotError> {
        Ok(Self {
            enforcers: table.encode().map_err(SnapshotError::Encode)?,
            meta: metadata.encode().map_err(SnapshotError::Encode)?,
        })
    }

    /// Encode the artifact.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(SnapshotError::Encode)
    }

    /// Decode an artifact produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        serde_json::from_slice(bytes).map_err(SnapshotError::Decode)
    }

    /// Rebuild the table (with role graphs relinked) and the metadata.
    ///
    /// Nothing is returned unless both parts decode, so a failed restore
    /// leaves the caller's state untouched.
    pub fn restore(&self) -> Result<(NamespaceTable, ClusterMetadata), SnapshotError> {
        let table = NamespaceTable::decode(&self.enforcers)?;
        let metadata = MetadataStore::decode(&self.meta).map_err(SnapshotError::Decode)?;
        Ok((table, metadata))
    }
}

/// Directory of persisted snapshots.
#[derive(Debug)]
pub struct SnapshotStore {
    directory: PathBuf,
    retained: usize,
    next_id: AtomicU64,
}

impl SnapshotStore {
    /// Open (creating if needed) `<data_dir>/snapshots`.
    ///
    /// Leftover temporary files from an interrupted write are removed.
    pub fn open(data_dir: &Path, retained: usize) -> Result<Self, SnapshotError> {
        let directory = data_dir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&directory)?;

        for entry in fs::read_dir(&directory)?.flatten() {
            if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                tracing::debug!(path = %entry.path().display(), "removing partial snapshot");
                fs::remove_file(entry.path())?;
            }
        }

        let next_id = list_ids(&directory)?.last().map_or(1, |id| id + 1);
        Ok(Self {
            directory,
            retained: retained.max(1),
            next_id: AtomicU64::new(next_id),
        })
    }

    /// Start writing a new snapshot file.
    pub fn create(&self, meta: &WardenSnapshotMeta) -> Result<SnapshotSink, SnapshotError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = self.snapshot_path(id);
        let temp_path = path.with_extension("snap.tmp");

        let meta_bytes = serde_json::to_vec(meta).map_err(SnapshotError::Encode)?;
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        let header = (|| {
            writer.write_all(SNAPSHOT_MAGIC)?;
            writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
            writer.write_all(&(meta_bytes.len() as u64).to_le_bytes())?;
            writer.write_all(&meta_bytes)
        })();

        let sink = SnapshotSink {
            id,
            path,
            temp_path,
            writer,
        };
        if let Err(e) = header {
            sink.cancel();
            return Err(e.into());
        }
        Ok(sink)
    }

    /// Write `data` as a complete snapshot and prune old ones.
    ///
    /// On any failure the partial file is cancelled.
    pub fn persist(&self, meta: &WardenSnapshotMeta, data: &[u8]) -> Result<(), SnapshotError> {
        let mut sink = self.create(meta)?;
        if let Err(e) = sink.write(data) {
            sink.cancel();
            return Err(e.into());
        }
        let id = sink.id;
        sink.close()?;

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            file_id = id,
            bytes = data.len(),
            "persisted snapshot"
        );
        self.prune()
    }

    /// Load the newest readable snapshot, skipping corrupt files.
    pub fn load_latest(&self) -> Result<Option<StoredSnapshot>, SnapshotError> {
        for id in list_ids(&self.directory)?.into_iter().rev() {
            match self.load(id) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    tracing::warn!(file_id = id, error = %e, "failed to load snapshot, trying older one");
                }
            }
        }
        Ok(None)
    }

    fn load(&self, id: u64) -> Result<StoredSnapshot, SnapshotError> {
        let path = self.snapshot_path(id);
        let format_error = |reason: &str| SnapshotError::Format {
            path: path.clone(),
            reason: reason.to_string(),
        };
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(format_error("bad magic"));
        }

        let mut version = [0u8; 4];
        reader.read_exact(&mut version)?;
        if u32::from_le_bytes(version) != SNAPSHOT_VERSION {
            return Err(format_error("unsupported version"));
        }

        let mut len = [0u8; 8];
        reader.read_exact(&mut len)?;
        let meta_len = u64::from_le_bytes(len);
        if meta_len > file_len.saturating_sub(HEADER_LEN) {
            return Err(format_error("metadata length exceeds file size"));
        }
        let meta_len =
            usize::try_from(meta_len).map_err(|_| format_error("metadata length too large"))?;
        let mut meta_bytes = vec![0u8; meta_len];
        reader.read_exact(&mut meta_bytes)?;
        let meta: WardenSnapshotMeta =
            serde_json::from_slice(&meta_bytes).map_err(SnapshotError::Decode)?;

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(StoredSnapshot { meta, data })
    }

    fn prune(&self) -> Result<(), SnapshotError> {
        let ids = list_ids(&self.directory)?;
        if ids.len() <= self.retained {
            return Ok(());
        }

        for id in &ids[..ids.len() - self.retained] {
            let path = self.snapshot_path(*id);
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(file_id = id, "removed old snapshot"),
                Err(e) => tracing::warn!(file_id = id, error = %e, "failed to remove old snapshot"),
            }
        }
        Ok(())
    }

    fn snapshot_path(&self, id: u64) -> PathBuf {
        self.directory.join(format!("snapshot_{id:016x}.snap"))
    }
}

/// Snapshot file being written.
///
/// Nothing is visible to [`SnapshotStore::load_latest`] until
/// [`close`](Self::close) succeeds.
#[derive(Debug)]
pub struct SnapshotSink {
    id: u64,
    path: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
}

impl SnapshotSink {
    /// Append document bytes.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)
    }

    /// Flush, sync and atomically publish the file.
    pub fn close(mut self) -> io::Result<()> {
        let result = (|| {
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
            fs::rename(&self.temp_path, &self.path)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&self.temp_path);
        }
        result
    }

    /// Discard the partial file.
    pub fn cancel(self) {
        let SnapshotSink { temp_path, writer, .. } = self;
        drop(writer);
        if let Err(e) = fs::remove_file(&temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %e, "failed to remove cancelled snapshot");
        }
    }
}

/// Snapshot file IDs in ascending order.
fn list_ids(directory: &Path) -> io::Result<Vec<u64>> {
    let mut ids: Vec<u64> = fs::read_dir(directory)?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let id = name
                .to_str()?
                .strip_prefix("snapshot_")?
                .strip_suffix(".snap")?
                .to_string();
            u64::from_str_radix(&id, 16).ok()
        })
        .collect();
    ids.sort_unstable();
    Ok(ids)
}
