//! Submission record storage and the dedup index.
//!
//! Every claimed `SourceEventId` stays in the store forever. Terminal records
//! are moved from the active set into the archive, which still blocks
//! re-processing of the same id.
//!
//! `FileStore` keeps two files: the active set and the low-water mark in a
//! JSON document that is rewritten atomically after each mutation, and the
//! archive in an append-only JSON-lines log next to it
//! (`records.json` → `records.archive.jsonl`). A record present in both is
//! archived; that only happens when the process stops between the two writes.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::io::AsyncWriteExt;

use crate::types::{RawEvent, RecordState, RelayError, SourceEventId, SubmissionRecord};

/// Result of trying to take ownership of an event id
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// First delivery: a fresh record in `Seen`
    Fresh(SubmissionRecord),
    /// Redelivery of a terminally failed id that never reached the chain
    Revived(SubmissionRecord),
    /// Already owned; the event must be discarded
    Duplicate(RecordState),
}

/// The storage trait behind the orchestrator.
///
/// `claim` is the only way records are created and must be atomic: of two
/// concurrent claims for the same id exactly one gets `Fresh`/`Revived`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn claim(&self, event: &RawEvent) -> Result<Claim, RelayError>;
    async fn update(&self, record: &SubmissionRecord) -> Result<(), RelayError>;
    /// Move a terminal record to the archive.
    async fn archive(&self, id: &SourceEventId) -> Result<(), RelayError>;
    async fn get(&self, id: &SourceEventId) -> Result<Option<SubmissionRecord>, RelayError>;
    async fn non_terminal(&self) -> Result<Vec<SubmissionRecord>, RelayError>;
    async fn list(&self) -> Result<Vec<SubmissionRecord>, RelayError>;
    /// Greatest id such that it and every claimed id before it are terminal.
    async fn low_water_mark(&self) -> Result<Option<SourceEventId>, RelayError>;
}

/// In-memory book shared by both backends
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RecordBook {
    #[serde(default)]
    low_water_mark: Option<SourceEventId>,
    #[serde(default)]
    active: BTreeMap<SourceEventId, SubmissionRecord>,
    /// Persisted separately by `FileStore`
    #[serde(skip)]
    archived: BTreeMap<SourceEventId, SubmissionRecord>,
}

/// What a single-id mutation touched, so it can be undone
struct Snapshot {
    id: SourceEventId,
    active: Option<SubmissionRecord>,
    was_archived: bool,
    low_water_mark: Option<SourceEventId>,
}

impl RecordBook {
    fn claim(&mut self, event: &RawEvent) -> Claim {
        if let Some(existing) = self.archived.get(&event.id) {
            return Claim::Duplicate(existing.state.clone());
        }

        match self.active.get_mut(&event.id) {
            None => {
                let record = SubmissionRecord::new(event.clone());
                self.active.insert(event.id, record.clone());
                Claim::Fresh(record)
            }
            Some(existing) if existing.is_revivable() => {
                existing.revivals += 1;
                existing.attempts = 0;
                existing.advance(RecordState::Seen);
                Claim::Revived(existing.clone())
            }
            Some(existing) => Claim::Duplicate(existing.state.clone()),
        }
    }

    fn update(&mut self, record: &SubmissionRecord) -> Result<(), RelayError> {
        if self.archived.contains_key(&record.source_event_id) {
            return Err(RelayError::Store(format!(
                "record {} is archived and can no longer change",
                record.source_event_id
            )));
        }
        let mut record = record.clone();
        record.updated_at = Utc::now();
        self.active.insert(record.source_event_id, record);
        self.recompute_low_water_mark();
        Ok(())
    }

    fn archive(&mut self, id: &SourceEventId) -> Result<(), RelayError> {
        match self.active.get(id) {
            Some(record) if record.is_terminal() => {
                if let Some(record) = self.active.remove(id) {
                    self.archived.insert(*id, record);
                }
                self.recompute_low_water_mark();
                Ok(())
            }
            Some(record) => Err(RelayError::Store(format!(
                "cannot archive {} in non-terminal state {}",
                id, record.state
            ))),
            None if self.archived.contains_key(id) => Ok(()),
            None => Err(RelayError::Store(format!("unknown record {}", id))),
        }
    }

    fn snapshot(&self, id: &SourceEventId) -> Snapshot {
        Snapshot {
            id: *id,
            active: self.active.get(id).cloned(),
            was_archived: self.archived.contains_key(id),
            low_water_mark: self.low_water_mark,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        match snapshot.active {
            Some(record) => {
                self.active.insert(snapshot.id, record);
            }
            None => {
                self.active.remove(&snapshot.id);
            }
        }
        if !snapshot.was_archived {
            self.archived.remove(&snapshot.id);
        }
        self.low_water_mark = snapshot.low_water_mark;
    }

    fn get(&self, id: &SourceEventId) -> Option<SubmissionRecord> {
        self.active
            .get(id)
            .or_else(|| self.archived.get(id))
            .cloned()
    }

    fn recompute_low_water_mark(&mut self) {
        let first_open = self
            .active
            .values()
            .find(|record| !record.is_terminal())
            .map(|record| record.source_event_id);

        let (active_below, archived_below) = match first_open {
            Some(open) => (
                self.active.range(..open).next_back().map(|(id, _)| *id),
                self.archived.range(..open).next_back().map(|(id, _)| *id),
            ),
            None => (
                self.active.keys().next_back().copied(),
                self.archived.keys().next_back().copied(),
            ),
        };

        // never move backwards, a restart must not replay finalized ranges
        self.low_water_mark = self.low_water_mark.max(active_below.max(archived_below));
    }
}

/// In-memory storage (for tests and ephemeral runs)
#[derive(Default)]
pub struct MemoryStore {
    book: Mutex<RecordBook>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RecordBook>, RelayError> {
        self.book
            .lock()
            .map_err(|_| RelayError::Store("record book lock poisoned".to_string()))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn claim(&self, event: &RawEvent) -> Result<Claim, RelayError> {
        Ok(self.lock()?.claim(event))
    }

    async fn update(&self, record: &SubmissionRecord) -> Result<(), RelayError> {
        self.lock()?.update(record)
    }

    async fn archive(&self, id: &SourceEventId) -> Result<(), RelayError> {
        self.lock()?.archive(id)
    }

    async fn get(&self, id: &SourceEventId) -> Result<Option<SubmissionRecord>, RelayError> {
        Ok(self.lock()?.get(id))
    }

    async fn non_terminal(&self) -> Result<Vec<SubmissionRecord>, RelayError> {
        let book = self.lock()?;
        Ok(book
            .active
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<SubmissionRecord>, RelayError> {
        let book = self.lock()?;
        Ok(book
            .active
            .values()
            .chain(book.archived.values())
            .cloned()
            .collect())
    }

    async fn low_water_mark(&self) -> Result<Option<SourceEventId>, RelayError> {
        Ok(self.lock()?.low_water_mark)
    }
}

/// Durable storage: active records in a JSON file, the archive in an
/// append-only log beside it
pub struct FileStore {
    path: PathBuf,
    archive_path: PathBuf,
    book: tokio::sync::Mutex<RecordBook>,
}

impl FileStore {
    /// Open existing record files or start empty ones.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        let archive_path = path.with_extension("archive.jsonl");

        let mut book = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<RecordBook>(&bytes).map_err(|e| {
                RelayError::Store(format!("corrupt record file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecordBook::default(),
            Err(e) => return Err(e.into()),
        };
        book.archived = Self::read_archive(&archive_path).await?;

        // archived but still listed as active: the rewrite after the append never happened
        let archived = &book.archived;
        book.active.retain(|id, _| !archived.contains_key(id));
        book.recompute_low_water_mark();

        info!(
            "Opened record store {}: {} active, {} archived, low-water mark {:?}",
            path.display(),
            book.active.len(),
            book.archived.len(),
            book.low_water_mark.map(|id| id.to_string())
        );

        Ok(Self {
            path,
            archive_path,
            book: tokio::sync::Mutex::new(book),
        })
    }

    async fn read_archive(
        path: &Path,
    ) -> Result<BTreeMap<SourceEventId, SubmissionRecord>, RelayError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        let mut archived = BTreeMap::new();
        for (n, line) in lines.iter().enumerate() {
            match serde_json::from_str::<SubmissionRecord>(line) {
                Ok(record) => {
                    archived.insert(record.source_event_id, record);
                }
                // a torn final append: that record is still in the active file
                Err(e) if n + 1 == lines.len() => {
                    warn!("Ignoring incomplete last entry of {}: {}", path.display(), e)
                }
                Err(e) => {
                    return Err(RelayError::Store(format!(
                        "corrupt archive {} at entry {}: {}",
                        path.display(),
                        n + 1,
                        e
                    )))
                }
            }
        }
        Ok(archived)
    }

    async fn persist(&self, book: &RecordBook) -> Result<(), RelayError> {
        let bytes = serde_json::to_vec_pretty(book)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }

    async fn append_archive(&self, record: &SubmissionRecord) -> Result<(), RelayError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.archive_path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn claim(&self, event: &RawEvent) -> Result<Claim, RelayError> {
        let mut book = self.book.lock().await;
        let before = book.snapshot(&event.id);
        let claim = book.claim(event);
        if !matches!(claim, Claim::Duplicate(_)) {
            if let Err(e) = self.persist(&book).await {
                // a claim that is not on disk would not survive a restart
                book.restore(before);
                return Err(e);
            }
        }
        Ok(claim)
    }

    async fn update(&self, record: &SubmissionRecord) -> Result<(), RelayError> {
        let mut book = self.book.lock().await;
        let before = book.snapshot(&record.source_event_id);
        book.update(record)?;
        if let Err(e) = self.persist(&book).await {
            book.restore(before);
            return Err(e);
        }
        Ok(())
    }

    async fn archive(&self, id: &SourceEventId) -> Result<(), RelayError> {
        let mut book = self.book.lock().await;
        let before = book.snapshot(id);
        book.archive(id)?;
        if before.was_archived {
            return Ok(());
        }

        let appended = match book.archived.get(id) {
            Some(record) => self.append_archive(record).await,
            None => Ok(()),
        };
        if let Err(e) = appended {
            book.restore(before);
            return Err(e);
        }

        // once appended the record is archived for good, even if this rewrite fails
        self.persist(&book).await
    }

    async fn get(&self, id: &SourceEventId) -> Result<Option<SubmissionRecord>, RelayError> {
        Ok(self.book.lock().await.get(id))
    }

    async fn non_terminal(&self) -> Result<Vec<SubmissionRecord>, RelayError> {
        let book = self.book.lock().await;
        Ok(book
            .active
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<SubmissionRecord>, RelayError> {
        let book = self.book.lock().await;
        Ok(book
            .active
            .values()
            .chain(book.archived.values())
            .cloned()
            .collect())
    }

    async fn low_water_mark(&self) -> Result<Option<SourceEventId>, RelayError> {
        Ok(self.book.lock().await.low_water_mark)
    }
}
