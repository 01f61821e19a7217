//! The notes manager: deletion, creation and sync as seen from the browser.
//! Every call may be slow and is made off the owner thread.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::storage::{NewNote, NoteRecord, StorageHandle};

pub mod memory;

pub use memory::MemoryNotesService;

/// Failure shown to the user as a dismissible notice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{title}: {message}")]
pub struct ServiceError {
    pub title: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn offline() -> Self {
        Self::new("Network Error", "The notes server cannot be reached right now.")
    }

    fn from_anyhow(title: &str, err: &anyhow::Error) -> Self {
        Self::new(title, format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Pending deletions confirmed and removed for good.
    pub purged: usize,
    pub live: usize,
}

pub trait NotesService: Send + Sync {
    fn is_online(&self) -> bool;
    fn sync(&self) -> Result<SyncSummary, ServiceError>;
    /// Removes a record. It leaves live results as soon as this returns.
    fn delete(&self, id: i64) -> Result<(), ServiceError>;
    /// Creates a record; `None` when the manager declined to create one.
    fn add(&self, content: &str, category: &str) -> Result<Option<NoteRecord>, ServiceError>;
    fn set_category(&self, id: i64, category: &str) -> Result<(), ServiceError>;
}

/// Notes manager over the local SQLite store. Deletions are flagged first
/// and purged once "the server" is reachable.
pub struct LocalNotesService {
    storage: StorageHandle,
    online: AtomicBool,
}

impl LocalNotesService {
    pub fn new(storage: StorageHandle, online: bool) -> Self {
        Self {
            storage,
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }
}

impl NotesService for LocalNotesService {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn sync(&self) -> Result<SyncSummary, ServiceError> {
        if !self.is_online() {
            return Err(ServiceError::offline());
        }
        let purged = self
            .storage
            .purge_deleted()
            .map_err(|err| ServiceError::from_anyhow("Sync Failed", &err))?;
        let live = self
            .storage
            .count_live()
            .map_err(|err| ServiceError::from_anyhow("Sync Failed", &err))?;
        tracing::info!(purged, live, "sync finished");
        Ok(SyncSummary { purged, live })
    }

    fn delete(&self, id: i64) -> Result<(), ServiceError> {
        self.storage
            .mark_deleted(id)
            .map_err(|err| ServiceError::from_anyhow("Delete Failed", &err))?;
        if self.is_online() {
            self.storage
                .purge_note(id)
                .map_err(|err| ServiceError::from_anyhow("Delete Failed", &err))?;
        } else {
            tracing::debug!(id, "offline, deletion stays pending until next sync");
        }
        Ok(())
    }

    fn add(&self, content: &str, category: &str) -> Result<Option<NoteRecord>, ServiceError> {
        let record = self
            .storage
            .create_note(NewNote::new(content, category))
            .map_err(|err| ServiceError::from_anyhow("Add Failed", &err))?;
        Ok(Some(record))
    }

    fn set_category(&self, id: i64, category: &str) -> Result<(), ServiceError> {
        self.storage
            .set_category(id, category)
            .map_err(|err| ServiceError::from_anyhow("Move Failed", &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::init_storage;
    use crate::storage::RecordSource;
    use assert_matches::assert_matches;

    #[test]
    fn offline_delete_stays_pending_until_sync() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let service = LocalNotesService::new(storage.clone(), false);
        let note = service.add("draft", "Work")?.expect("created");

        service.delete(note.id)?;
        assert!(storage.fetch_live_records()?.is_empty());
        assert!(storage.fetch_note_by_id(note.id)?.is_some());
        assert_eq!(service.sync(), Err(ServiceError::offline()));

        service.set_online(true);
        assert_eq!(service.sync()?, SyncSummary { purged: 1, live: 0 });
        assert!(storage.fetch_note_by_id(note.id)?.is_none());
        Ok(())
    }

    #[test]
    fn failures_carry_a_title_and_message() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let service = LocalNotesService::new(storage, true);
        let err = service.delete(404).expect_err("missing note");
        assert_eq!(err.title, "Delete Failed");
        assert!(err.message.contains("404"));
        assert_matches!(service.set_category(404, "x"), Err(ServiceError { .. }));
        Ok(())
    }
}
