use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{NotesService, ServiceError, SyncSummary};
use crate::storage::{MemoryRecordStore, NewNote, NoteRecord};

/// Notes manager over a [`MemoryRecordStore`], with knobs for failures and
/// latency.
pub struct MemoryNotesService {
    store: MemoryRecordStore,
    online: AtomicBool,
    failure: Mutex<Option<ServiceError>>,
    latency: Mutex<Duration>,
}

impl MemoryNotesService {
    pub fn new(store: MemoryRecordStore) -> Self {
        Self {
            store,
            online: AtomicBool::new(true),
            failure: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    pub fn store(&self) -> &MemoryRecordStore {
        &self.store
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// The next call fails with `error`.
    pub fn fail_next(&self, error: ServiceError) {
        *self.failure.lock() = Some(error);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    fn begin_call(&self) -> Result<(), ServiceError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl NotesService for MemoryNotesService {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn sync(&self) -> Result<SyncSummary, ServiceError> {
        self.begin_call()?;
        if !self.is_online() {
            return Err(ServiceError::offline());
        }
        Ok(SyncSummary {
            purged: 0,
            live: self.store.len(),
        })
    }

    fn delete(&self, id: i64) -> Result<(), ServiceError> {
        self.begin_call()?;
        self.store
            .remove(id)
            .map(|_| ())
            .map_err(|err| ServiceError::from_anyhow("Delete Failed", &err))
    }

    fn add(&self, content: &str, category: &str) -> Result<Option<NoteRecord>, ServiceError> {
        self.begin_call()?;
        Ok(Some(self.store.insert(NewNote::new(content, category))))
    }

    fn set_category(&self, id: i64, category: &str) -> Result<(), ServiceError> {
        self.begin_call()?;
        self.store
            .set_category(id, category)
            .map_err(|err| ServiceError::from_anyhow("Move Failed", &err))
    }
}
