//! Raft log storage.
//!
//! Entries are kept in memory and mirrored to an append-only NDJSON file.
//! Vote, committed log ID and purge point live in a small JSON state file
//! that is replaced atomically.
//!
//! ```text
//! <data_dir>/raft/
//! ├── log.ndjson   # one entry per line, ascending index
//! └── state.json   # {vote, committed, last_purged}
//! ```
//!
//! Truncate and purge rewrite the log file through a temporary file and a
//! rename; appends only ever add lines.

use crate::types::{TypeConfig, WardenEntry, WardenLogId, WardenStorageError, WardenVote};
use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{LogState, RaftLogReader, StorageIOError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

const LOG_FILE: &str = "log.ndjson";
const STATE_FILE: &str = "state.json";

/// Durable non-entry state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HardState {
    vote: Option<WardenVote>,
    committed: Option<WardenLogId>,
    last_purged: Option<WardenLogId>,
}

struct Inner {
    dir: PathBuf,
    logs: BTreeMap<u64, WardenEntry>,
    hard: HardState,
    writer: BufWriter<File>,
}

/// Persistent storage for Raft logs and vote state.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<RwLock<Inner>>,
}

impl Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore").finish_non_exhaustive()
    }
}

impl LogStore {
    /// Create or open log storage in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let hard = read_hard_state(&dir.join(STATE_FILE))?;
        let (logs, torn) = read_entries(&dir.join(LOG_FILE))?;
        let writer = open_append(&dir.join(LOG_FILE))?;

        tracing::debug!(
            dir = %dir.display(),
            entries = logs.len(),
            last_purged = ?hard.last_purged,
            "opened raft log"
        );

        let mut inner = Inner {
            dir,
            logs,
            hard,
            writer,
        };
        if torn {
            inner.rewrite()?;
        }

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Whether `dir` holds any persisted raft state.
    pub fn exists(dir: &Path) -> bool {
        dir.join(STATE_FILE).exists()
            || fs::metadata(dir.join(LOG_FILE)).is_ok_and(|m| m.len() > 0)
    }
}

impl LogStore {
    /// Run file I/O against the log on the blocking pool, holding the write
    /// lock until it finishes.
    async fn blocking<T, F>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce(&mut Inner) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut inner = Arc::clone(&self.inner).write_owned().await;
        tokio::task::spawn_blocking(move || f(&mut inner))
            .await
            .map_err(io::Error::other)?
    }
}

impl Inner {
    fn append(&mut self, entries: Vec<WardenEntry>) -> io::Result<()> {
        for entry in entries {
            serde_json::to_writer(&mut self.writer, &entry)?;
            self.writer.write_all(b"\n")?;
            self.logs.insert(entry.log_id.index, entry);
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    fn truncate(&mut self, log_id: WardenLogId) -> io::Result<()> {
        self.logs.retain(|&index, _| index < log_id.index);
        self.rewrite()
    }

    fn purge(&mut self, log_id: WardenLogId) -> io::Result<()> {
        self.hard.last_purged = Some(log_id);
        self.save_hard_state()?;
        self.logs.retain(|&index, _| index > log_id.index);
        self.rewrite()
    }

    /// Replace the log file with the in-memory entries.
    fn rewrite(&mut self) -> io::Result<()> {
        let path = self.dir.join(LOG_FILE);
        let temp_path = self.dir.join(format!("{LOG_FILE}.tmp"));

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        for entry in self.logs.values() {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;
        self.writer = open_append(&path)?;
        Ok(())
    }

    fn save_hard_state(&self) -> io::Result<()> {
        let path = self.dir.join(STATE_FILE);
        let temp_path = self.dir.join(format!("{STATE_FILE}.tmp"));

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer(&mut writer, &self.hard)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &path)
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn read_hard_state(path: &Path) -> io::Result<HardState> {
    if !path.exists() {
        return Ok(HardState::default());
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Load every entry. The flag reports a torn trailing line.
fn read_entries(path: &Path) -> io::Result<(BTreeMap<u64, WardenEntry>, bool)> {
    let mut logs = BTreeMap::new();
    if !path.exists() {
        return Ok((logs, false));
    }

    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WardenEntry>(&line) {
            Ok(entry) => {
                logs.insert(entry.log_id.index, entry);
            }
            // A torn final line from a crash mid-append; the entry was never
            // acknowledged.
            Err(e) if e.is_eof() => {
                tracing::warn!(error = %e, "dropping incomplete trailing log line");
                return Ok((logs, true));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((logs, false))
}

/// Implementation of OpenRaft's log reader interface.
impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<WardenEntry>, WardenStorageError> {
        let inner = self.inner.read().await;
        Ok(inner.logs.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Implementation of OpenRaft's log storage interface.
impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, WardenStorageError> {
        let inner = self.inner.read().await;

        let last_purged_log_id = inner.hard.last_purged;
        let last_log_id = inner
            .logs
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(last_purged_log_id);

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<WardenLogId>,
    ) -> Result<(), WardenStorageError> {
        self.blocking(move |inner| {
            inner.hard.committed = committed;
            inner.save_hard_state()
        })
        .await
        .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<WardenLogId>, WardenStorageError> {
        Ok(self.inner.read().await.hard.committed)
    }

    async fn save_vote(&mut self, vote: &WardenVote) -> Result<(), WardenStorageError> {
        let vote = *vote;
        self.blocking(move |inner| {
            inner.hard.vote = Some(vote);
            inner.save_hard_state()
        })
        .await
        .map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<WardenVote>, WardenStorageError> {
        Ok(self.inner.read().await.hard.vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), WardenStorageError>
    where
        I: IntoIterator<Item = WardenEntry>,
    {
        let entries: Vec<WardenEntry> = entries.into_iter().collect();
        let result = self.blocking(move |inner| inner.append(entries)).await;
        let io_result = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        callback.log_io_completed(io_result);
        result.map_err(|e| StorageIOError::write_logs(&e).into())
    }

    async fn truncate(&mut self, log_id: WardenLogId) -> Result<(), WardenStorageError> {
        tracing::debug!(%log_id, "truncating raft log");
        self.blocking(move |inner| inner.truncate(log_id))
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: WardenLogId) -> Result<(), WardenStorageError> {
        tracing::debug!(%log_id, "purging raft log");
        self.blocking(move |inner| inner.purge(log_id))
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
