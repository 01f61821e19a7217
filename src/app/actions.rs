use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::query::{FetchRequest, QueryError, Snapshot};
use crate::service::{NotesService, ServiceError, SyncSummary};
use crate::storage::{NoteRecord, RecordSource};

/// Completions redelivered to the owner thread.
#[derive(Debug)]
pub enum BrowserEvent {
    DeleteFinished {
        id: i64,
        result: Result<(), ServiceError>,
    },
    SyncFinished {
        /// False for the quiet sync started when the screen becomes active.
        user_initiated: bool,
        result: Result<SyncSummary, ServiceError>,
    },
    NoteAdded {
        result: Result<Option<NoteRecord>, ServiceError>,
    },
    SearchFinished {
        generation: u64,
        result: Result<Snapshot, QueryError>,
    },
    /// The record store changed behind the browser's back.
    StoreChanged,
}

/// Runs slow notes-manager calls and search fetches on worker threads.
#[derive(Clone)]
pub struct ActionCoordinator {
    service: Arc<dyn NotesService>,
    events: Sender<BrowserEvent>,
}

impl ActionCoordinator {
    pub fn new(service: Arc<dyn NotesService>, events: Sender<BrowserEvent>) -> Self {
        Self { service, events }
    }

    pub fn service(&self) -> &Arc<dyn NotesService> {
        &self.service
    }

    pub fn spawn_delete(&self, id: i64) -> Result<()> {
        let service = Arc::clone(&self.service);
        self.spawn("notes-delete", move || BrowserEvent::DeleteFinished {
            id,
            result: service.delete(id),
        })
    }

    pub fn spawn_sync(&self, user_initiated: bool) -> Result<()> {
        let service = Arc::clone(&self.service);
        self.spawn("notes-sync", move || BrowserEvent::SyncFinished {
            user_initiated,
            result: service.sync(),
        })
    }

    pub fn spawn_add(&self, content: String, category: String) -> Result<()> {
        let service = Arc::clone(&self.service);
        self.spawn("notes-add", move || BrowserEvent::NoteAdded {
            result: service.add(&content, &category),
        })
    }

    pub fn spawn_search<S>(&self, request: FetchRequest, source: S) -> Result<()>
    where
        S: RecordSource + 'static,
    {
        self.spawn("notes-search", move || BrowserEvent::SearchFinished {
            generation: request.generation,
            result: request.execute(&source).map_err(QueryError::Store),
        })
    }

    fn spawn<F>(&self, name: &str, job: F) -> Result<()>
    where
        F: FnOnce() -> BrowserEvent + Send + 'static,
    {
        let events = self.events.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let event = job();
                if events.send(event).is_err() {
                    tracing::debug!("browser went away before the worker finished");
                }
            })
            .with_context(|| format!("spawning {name} worker"))?;
        Ok(())
    }
}
