//! Persisted archive of downloaded URLs.
//!
//! The ledger is the dedup source of truth: a URL present here has a fully
//! written file at its destination and is never fetched again unless the run
//! forces re-downloads.
//!
//! # File format
//!
//! One JSON file per output directory ([`ARCHIVE_FILE_NAME`]):
//!
//! ```json
//! {
//!   "downloaded": {
//!     "https://img.example/1/1.jpg": {
//!       "timestamp": "2026-01-02T03:04:05Z",
//!       "metadata": { "gallery": "Title", "index": 1 }
//!     }
//!   }
//! }
//! ```
//!
//! # Writers
//!
//! Reads ([`ArchiveLedger::contains`]) are lock-free and may happen from any
//! worker. Writes go through a single [`LedgerWriter`] task fed by a channel;
//! each submission is acknowledged only after the file has been flushed, so a
//! storage failure reaches the worker that caused it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::download::Metadata;

/// Archive file name inside the output directory.
pub const ARCHIVE_FILE_NAME: &str = "gallery-archive.json";

/// Capacity of the writer channel; workers wait for acks so this rarely fills.
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Errors raised by ledger loading and persistence.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The archive file exists but cannot be parsed.
    #[error("archive file {path} is corrupt: {source}")]
    Corrupt {
        /// Archive path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing the archive file failed.
    #[error("archive IO error at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Serializing the in-memory state failed.
    #[error("failed to serialize archive: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The writer task is gone; no more records can be persisted.
    #[error("archive writer is no longer running")]
    WriterClosed,
}

impl LedgerError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// One entry per successfully downloaded URL.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    /// Resource URL (the ledger key).
    pub url: String,
    /// When the download finished.
    pub downloaded_at: DateTime<Utc>,
    /// Task metadata, stored verbatim.
    pub metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArchiveFile {
    #[serde(default)]
    downloaded: BTreeMap<String, StoredEntry>,
}

/// Accepts RFC 3339 timestamps and offset-less ISO-8601 ones (read as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// In-memory ledger backed by the archive file.
#[derive(Debug)]
pub struct ArchiveLedger {
    path: PathBuf,
    entries: DashMap<String, LedgerRecord>,
}

impl ArchiveLedger {
    /// Creates an empty ledger that will persist to `path`.
    #[must_use]
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: DashMap::new(),
        }
    }

    /// Returns the default archive path for an output directory.
    #[must_use]
    pub fn path_for_output_dir(output_dir: &Path) -> PathBuf {
        output_dir.join(ARCHIVE_FILE_NAME)
    }

    /// Loads the ledger from `path`.
    ///
    /// A missing or blank file yields an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] if the file cannot be parsed; the
    /// caller chooses between aborting and [`ArchiveLedger::quarantine`].
    /// Returns [`LedgerError::Io`] if the file exists but cannot be read.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no archive file yet, starting empty");
                return Ok(Self::empty(path));
            }
            Err(e) => return Err(LedgerError::io(path, e)),
        };

        if raw.iter().all(u8::is_ascii_whitespace) {
            debug!("archive file is blank, starting empty");
            return Ok(Self::empty(path));
        }

        let archive: ArchiveFile =
            serde_json::from_slice(&raw).map_err(|source| LedgerError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;

        let entries = archive
            .downloaded
            .into_iter()
            .map(|(url, entry)| {
                let record = LedgerRecord {
                    url: url.clone(),
                    downloaded_at: entry.timestamp,
                    metadata: entry.metadata,
                };
                (url, record)
            })
            .collect::<DashMap<_, _>>();

        info!(entries = entries.len(), "loaded archive");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Moves a corrupt archive aside so a fresh one can be started.
    ///
    /// Returns the path the corrupt file was moved to.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the rename fails.
    pub async fn quarantine(path: &Path) -> Result<PathBuf, LedgerError> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let file_name = path
            .file_name()
            .map_or_else(|| ARCHIVE_FILE_NAME.into(), |name| name.to_string_lossy());
        let target = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
        tokio::fs::rename(path, &target)
            .await
            .map_err(|e| LedgerError::io(path, e))?;
        warn!(
            from = %path.display(),
            to = %target.display(),
            "moved corrupt archive aside"
        );
        Ok(target)
    }

    /// Archive file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if `url` has been downloaded.
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    /// Returns a copy of the record for `url`.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<LedgerRecord> {
        self.entries.get(url).map(|entry| entry.value().clone())
    }

    /// Number of recorded URLs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a finished download in memory.
    ///
    /// Re-recording a URL refreshes its timestamp and metadata. Callers sharing
    /// the ledger between workers must go through [`LedgerWriter`].
    pub fn record(&self, url: &str, metadata: Metadata) -> LedgerRecord {
        let record = LedgerRecord {
            url: url.to_string(),
            downloaded_at: Utc::now(),
            metadata,
        };
        self.entries.insert(url.to_string(), record.clone());
        record
    }

    /// Durably writes the current state: temp file, fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] for any filesystem failure and
    /// [`LedgerError::Serialize`] if encoding fails.
    #[instrument(skip(self), fields(path = %self.path.display(), entries = self.entries.len()))]
    pub async fn persist(&self) -> Result<(), LedgerError> {
        let archive = ArchiveFile {
            downloaded: self
                .entries
                .iter()
                .map(|entry| {
                    let record = entry.value();
                    (
                        record.url.clone(),
                        StoredEntry {
                            timestamp: record.downloaded_at,
                            metadata: record.metadata.clone(),
                        },
                    )
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&archive).map_err(LedgerError::Serialize)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::io(parent, e))?;
        }

        let temp_path = temp_path_for(&self.path);
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| LedgerError::io(&temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| LedgerError::io(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| LedgerError::io(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| LedgerError::io(&self.path, e))?;

        debug!("archive persisted");
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_else(|| ARCHIVE_FILE_NAME.into());
    name.push(".tmp");
    path.with_file_name(name)
}

enum LedgerCommand {
    Record {
        url: String,
        metadata: Metadata,
        ack: oneshot::Sender<Result<(), LedgerError>>,
    },
}

/// Cloneable handle used by workers to read the ledger and submit records.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    ledger: Arc<ArchiveLedger>,
    tx: mpsc::Sender<LedgerCommand>,
}

impl std::fmt::Debug for LedgerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record { url, .. } => f.debug_struct("Record").field("url", url).finish(),
        }
    }
}

impl LedgerHandle {
    /// Lock-free membership check.
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.ledger.contains(url)
    }

    /// Submits a record and waits until it has been flushed to disk.
    ///
    /// # Errors
    ///
    /// Returns the writer's persistence error, or
    /// [`LedgerError::WriterClosed`] if the writer has stopped.
    pub async fn record(&self, url: &str, metadata: Metadata) -> Result<(), LedgerError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(LedgerCommand::Record {
                url: url.to_string(),
                metadata,
                ack,
            })
            .await
            .map_err(|_| LedgerError::WriterClosed)?;
        done.await.map_err(|_| LedgerError::WriterClosed)?
    }
}

/// The single task that owns ledger writes.
#[derive(Debug)]
pub struct LedgerWriter {
    handle: LedgerHandle,
    task: JoinHandle<()>,
}

impl LedgerWriter {
    /// Spawns the writer task for `ledger`.
    #[must_use]
    pub fn spawn(ledger: Arc<ArchiveLedger>) -> Self {
        let (tx, mut rx) = mpsc::channel::<LedgerCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_ledger = Arc::clone(&ledger);

        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    LedgerCommand::Record { url, metadata, ack } => {
                        writer_ledger.record(&url, metadata);
                        let result = writer_ledger.persist().await;
                        if let Err(error) = &result {
                            warn!(url = %url, error = %error, "failed to persist archive");
                        }
                        // Receiver may have been aborted mid-wait; the record is kept either way
                        let _ = ack.send(result);
                    }
                }
            }
            debug!("archive writer stopped");
        });

        Self {
            handle: LedgerHandle { ledger, tx },
            task,
        }
    }

    /// Returns a handle for workers.
    #[must_use]
    pub fn handle(&self) -> LedgerHandle {
        self.handle.clone()
    }

    /// Returns the ledger being written.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ArchiveLedger> {
        &self.handle.ledger
    }

    /// Closes the channel and waits for queued records to be flushed.
    ///
    /// Outstanding [`LedgerHandle`] clones keep the writer alive until dropped.
    pub async fn shutdown(self) {
        let Self { handle, task } = self;
        drop(handle);
        if let Err(error) = task.await {
            warn!(error = %error, "archive writer task panicked");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::MetadataValue;
    use tempfile::TempDir;

    fn sample_metadata() -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("gallery".into(), MetadataValue::from("Title"));
        metadata.insert("index".into(), MetadataValue::from(2_i64));
        metadata
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = ArchiveLedger::load(dir.path().join(ARCHIVE_FILE_NAME))
            .await
            .unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_load_blank_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ARCHIVE_FILE_NAME);
        std::fs::write(&path, "  \n").unwrap();
        let ledger = ArchiveLedger::load(&path).await.unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_load_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ARCHIVE_FILE_NAME);
        std::fs::write(&path, "{\"downloaded\": {\"u\": ").unwrap();
        let result = ArchiveLedger::load(&path).await;
        assert!(matches!(result, Err(LedgerError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_persist_then_load_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(ARCHIVE_FILE_NAME);

        let ledger = ArchiveLedger::empty(&path);
        ledger.record("https://img.example/1.jpg", sample_metadata());
        ledger.persist().await.unwrap();
        assert!(!temp_path_for(&path).exists(), "temp file must be renamed away");

        let reloaded = ArchiveLedger::load(&path).await.unwrap();
        assert!(reloaded.contains("https://img.example/1.jpg"));
        let record = reloaded.get("https://img.example/1.jpg").unwrap();
        assert_eq!(record.metadata, sample_metadata());
    }

    #[tokio::test]
    async fn test_record_is_idempotent_and_refreshes() {
        let ledger = ArchiveLedger::empty("unused.json");
        let first = ledger.record("u", Metadata::new());
        let second = ledger.record("u", sample_metadata());
        assert_eq!(ledger.len(), 1);
        assert!(second.downloaded_at >= first.downloaded_at);
        assert_eq!(ledger.get("u").unwrap().metadata, sample_metadata());
    }

    #[tokio::test]
    async fn test_load_accepts_offsetless_timestamps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ARCHIVE_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"downloaded": {"u": {"timestamp": "2024-05-06T07:08:09.123456", "metadata": {"gallery": "G", "url": "u"}}}}"#,
        )
        .unwrap();
        let ledger = ArchiveLedger::load(&path).await.unwrap();
        let record = ledger.get("u").unwrap();
        assert_eq!(
            record.downloaded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-05-06 07:08:09"
        );
    }

    #[tokio::test]
    async fn test_file_format_uses_downloaded_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ARCHIVE_FILE_NAME);
        let ledger = ArchiveLedger::empty(&path);
        ledger.record("u", sample_metadata());
        ledger.persist().await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &value["downloaded"]["u"];
        assert!(entry["timestamp"].is_string());
        assert_eq!(entry["metadata"]["gallery"], "Title");
        assert_eq!(entry["metadata"]["index"], 2);
    }

    #[tokio::test]
    async fn test_quarantine_moves_file_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ARCHIVE_FILE_NAME);
        std::fs::write(&path, "not json").unwrap();

        let moved = ArchiveLedger::quarantine(&path).await.unwrap();
        assert!(!path.exists());
        assert!(moved.exists());
        assert!(
            moved
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("gallery-archive.json.corrupt-")
        );
    }

    #[tokio::test]
    async fn test_writer_persists_each_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ARCHIVE_FILE_NAME);
        let writer = LedgerWriter::spawn(Arc::new(ArchiveLedger::empty(&path)));
        let handle = writer.handle();

        handle.record("a", Metadata::new()).await.unwrap();
        assert!(handle.contains("a"));
        let on_disk = ArchiveLedger::load(&path).await.unwrap();
        assert!(on_disk.contains("a"));

        handle.record("b", sample_metadata()).await.unwrap();
        drop(handle);
        writer.shutdown().await;

        let on_disk = ArchiveLedger::load(&path).await.unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[tokio::test]
    async fn test_writer_reports_flush_failure() {
        let dir = TempDir::new().unwrap();
        // A directory where the archive file should be makes the rename fail
        let path = dir.path().join(ARCHIVE_FILE_NAME);
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let writer = LedgerWriter::spawn(Arc::new(ArchiveLedger::empty(&path)));
        let result = writer.handle().record("a", Metadata::new()).await;
        assert!(matches!(result, Err(LedgerError::Io { .. })));
        writer.shutdown().await;
    }
}
