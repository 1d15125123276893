//! On-disk layout and the JSON-lines journal backend.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

use crate::entity::{EntityId, SequenceNumber};
use crate::error::JournalError;
use crate::event::{JournalRecord, NewEvent};
use crate::journal::{EventStream, Journal};

/// Manages the on-disk directory layout shared by the file-backed stores.
///
/// ```text
/// <base_dir>/
///     journal/
///         <entity_id>.jsonl           -- one JournalRecord per line
///     snapshots/
///         <entity_id>/
///             00000000000000000020.json
/// ```
///
/// `StorageLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; the stores create it lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/journal`
    pub fn journal_dir(&self) -> PathBuf {
        self.base_dir.join("journal")
    }

    /// `<base_dir>/journal/<entity_id>.jsonl`
    pub fn journal_path(&self, entity_id: &EntityId) -> PathBuf {
        self.journal_dir()
            .join(format!("{}.jsonl", entity_id.as_str()))
    }

    /// `<base_dir>/snapshots/<entity_id>`
    pub fn snapshot_dir(&self, entity_id: &EntityId) -> PathBuf {
        self.base_dir.join("snapshots").join(entity_id.as_str())
    }

    /// `<base_dir>/snapshots/<entity_id>/<sequence>.json`
    ///
    /// The sequence is zero-padded to 20 digits so lexical and numeric order
    /// agree.
    pub fn snapshot_path(&self, entity_id: &EntityId, sequence: SequenceNumber) -> PathBuf {
        self.snapshot_dir(entity_id)
            .join(format!("{sequence:020}.json"))
    }

    /// Lists every entity that has a journal file, sorted by id.
    ///
    /// Returns an empty vector if the journal directory does not exist.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason other
    /// than the directory not existing.
    pub async fn list_entities(&self) -> io::Result<Vec<EntityId>> {
        let mut entries = match fs::read_dir(self.journal_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            // Files that don't name a valid id were not written by us.
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && let Ok(id) = EntityId::new(stem)
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Per-entity write lock guarding the cached last sequence number.
///
/// `None` means the head is unknown and must be read from disk.
type HeadLock = Arc<tokio::sync::Mutex<Option<SequenceNumber>>>;

/// Journal that stores each entity's events as JSON lines in its own file.
///
/// Appends for one entity are serialized by a per-entity lock, so separate
/// entities write in parallel. Each batch is written with a single buffered
/// write followed by `sync_data`; if the write fails the file is truncated
/// back to its previous length.
///
/// The optimistic concurrency check covers every writer that shares this
/// `FileJournal` value (clones included). Separate OS processes writing the
/// same directory are not coordinated.
#[derive(Debug, Clone)]
pub struct FileJournal {
    layout: StorageLayout,
    heads: Arc<std::sync::Mutex<HashMap<EntityId, HeadLock>>>,
}

impl FileJournal {
    /// Create a journal rooted at `base_dir` (see [`StorageLayout`]).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(StorageLayout::new(base_dir))
    }

    /// Create a journal using an existing layout.
    pub fn with_layout(layout: StorageLayout) -> Self {
        Self {
            layout,
            heads: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Returns the layout this journal writes to.
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn head_lock(&self, entity_id: &EntityId) -> HeadLock {
        // A poisoned map only means another thread panicked mid-insert;
        // the map itself is still usable.
        let mut heads = self
            .heads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        heads.entry(entity_id.clone()).or_default().clone()
    }

    /// Read the last sequence number from the entity's file.
    async fn scan_head(&self, entity_id: &EntityId) -> Result<SequenceNumber, JournalError> {
        let contents = match fs::read_to_string(self.layout.journal_path(entity_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        match contents.lines().rev().find(|l| !l.trim().is_empty()) {
            None => Ok(0),
            Some(line) => serde_json::from_str::<JournalRecord>(line)
                .map(|r| r.sequence)
                .map_err(|e| JournalError::Corrupt {
                    entity_id: entity_id.clone(),
                    detail: format!("unreadable last record: {e}"),
                }),
        }
    }

    async fn write_batch(&self, path: &Path, buf: &[u8]) -> io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let previous_len = file.metadata().await?.len();

        let written = async {
            file.write_all(buf).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            // Roll back a torn batch so the journal never holds a partial one.
            if let Err(truncate_err) = file.set_len(previous_len).await {
                tracing::error!(
                    path = %path.display(),
                    error = %truncate_err,
                    "failed to roll back partial journal write"
                );
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(
        &self,
        entity_id: &EntityId,
        expected_last_seq: SequenceNumber,
        events: Vec<NewEvent>,
    ) -> Result<SequenceNumber, JournalError> {
        let lock = self.head_lock(entity_id);
        let mut head = lock.lock().await;

        let actual = match *head {
            Some(seq) => seq,
            None => self.scan_head(entity_id).await?,
        };
        *head = Some(actual);

        if actual != expected_last_seq {
            return Err(JournalError::Conflict {
                entity_id: entity_id.clone(),
                expected: expected_last_seq,
                actual,
            });
        }
        if events.is_empty() {
            return Ok(actual);
        }

        let now = Utc::now();
        let mut buf = Vec::new();
        let mut sequence = actual;
        for event in events {
            sequence += 1;
            let record = JournalRecord::new(entity_id.clone(), sequence, event, now);
            serde_json::to_writer(&mut buf, &record)?;
            buf.push(b'\n');
        }

        let path = self.layout.journal_path(entity_id);
        if let Err(e) = self.write_batch(&path, &buf).await {
            // The on-disk head is uncertain after a failed write.
            *head = None;
            return Err(e.into());
        }

        *head = Some(sequence);
        Ok(sequence)
    }

    async fn read_from(
        &self,
        entity_id: &EntityId,
        after: SequenceNumber,
    ) -> Result<EventStream, JournalError> {
        let file = match fs::File::open(self.layout.journal_path(entity_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::pin(tokio_stream::empty::<
                    Result<JournalRecord, JournalError>,
                >()));
            }
            Err(e) => return Err(e.into()),
        };

        let entity_id = entity_id.clone();
        let lines = LinesStream::new(BufReader::new(file).lines());
        let records = lines.filter_map(move |line| match line {
            Err(e) => Some(Err(JournalError::Io(e))),
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => match serde_json::from_str::<JournalRecord>(&line) {
                Ok(record) if record.sequence <= after => None,
                Ok(record) => Some(Ok(record)),
                Err(e) => Some(Err(JournalError::Corrupt {
                    entity_id: entity_id.clone(),
                    detail: e.to_string(),
                })),
            },
        });
        Ok(Box::pin(records))
    }

    async fn last_sequence(&self, entity_id: &EntityId) -> Result<SequenceNumber, JournalError> {
        let lock = self.head_lock(entity_id);
        let mut head = lock.lock().await;
        if let Some(seq) = *head {
            return Ok(seq);
        }
        let seq = self.scan_head(entity_id).await?;
        *head = Some(seq);
        Ok(seq)
    }
}
