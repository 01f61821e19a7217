//! Owner-thread coordinator for the notes list: user actions, background
//! completions and the path from query results to the presenter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::actions::{ActionCoordinator, BrowserEvent};
use super::state::{select_replacement, PendingDelete, ScreenState};
use crate::config::{AppConfig, SearchOptions};
use crate::groups::{GroupKey, GroupStateStore};
use crate::query::{QueryController, QueryError, Snapshot};
use crate::search::SearchFilter;
use crate::service::{NotesService, ServiceError};
use crate::storage::{NoteRecord, RecordSource};
use crate::view::{
    DropProposal, DropTarget, ListMutationApplier, ListPresenter, OperationBatch, PayloadKind,
    Projector, RemovedRecord, RowPath, RowSource,
};

pub struct Browser<S, P> {
    query: QueryController<S>,
    projector: Projector,
    applier: ListMutationApplier,
    presenter: P,
    actions: ActionCoordinator,
    sender: Sender<BrowserEvent>,
    events: Receiver<BrowserEvent>,
    state: ScreenState,
    search_options: SearchOptions,
    sync_on_start: bool,
}

impl<S, P> Browser<S, P>
where
    S: RecordSource + Clone + 'static,
    P: ListPresenter,
{
    pub fn new(
        source: S,
        service: Arc<dyn NotesService>,
        group_store: Box<dyn GroupStateStore>,
        presenter: P,
        config: &AppConfig,
    ) -> Self {
        let (sender, events) = crossbeam_channel::unbounded();
        Self {
            query: QueryController::new(source),
            projector: Projector::new(group_store, config.browser.no_category_label.clone()),
            applier: ListMutationApplier::new(),
            presenter,
            actions: ActionCoordinator::new(service, sender.clone()),
            sender,
            events,
            state: ScreenState::default(),
            search_options: config.search.clone(),
            sync_on_start: config.sync.sync_on_start,
        }
    }

    /// First query. On failure the list stays empty until a later change.
    pub fn load(&mut self) -> Result<(), QueryError> {
        let changes = self.query.refresh()?;
        let batch = self.projector.reload(changes.snapshot);
        self.apply(batch);
        Ok(())
    }

    pub fn state(&self) -> &ScreenState {
        &self.state
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.query.current_snapshot()
    }

    pub fn service(&self) -> &Arc<dyn NotesService> {
        self.actions.service()
    }

    /// Handle for other threads to announce store changes.
    pub fn event_sender(&self) -> Sender<BrowserEvent> {
        self.sender.clone()
    }

    pub fn active_record(&self) -> Option<&NoteRecord> {
        self.state
            .active_record
            .and_then(|id| self.projector.record_by_id(id))
    }

    /// Flips the group at `index`; `key` is the group the caller saw there.
    pub fn toggle_group(&mut self, index: usize, key: &GroupKey) -> bool {
        let Some((collapsed, batch)) = self.projector.toggle(index, key) else {
            return false;
        };
        tracing::debug!(group = %key, collapsed, "group toggled");
        self.apply(batch);
        true
    }

    /// Starts deleting the record shown at `path`. Returns false, and does
    /// nothing, when the path no longer shows a record or a delete is
    /// already running.
    pub fn delete_record(&mut self, path: RowPath) -> bool {
        let Some(id) = self.projector.record_id_at(path) else {
            tracing::debug!(?path, "delete on a stale row, ignoring");
            return false;
        };
        let Some(key) = self.projector.group_key(path.group).cloned() else {
            return false;
        };
        let count_before = self.projector.visible_row_count(path.group);
        self.start_delete(id, key, path.row, count_before)
    }

    /// Deletes whatever is open in the detail surface, even when its group
    /// is collapsed.
    pub fn delete_active_record(&mut self) -> bool {
        let Some(id) = self.state.active_record else {
            return false;
        };
        let model = self.projector.model();
        let Some(path) = model.locate(id) else {
            tracing::debug!(id, "active record no longer listed");
            return false;
        };
        let group = &model.groups()[path.group];
        let key = group.key.clone();
        let count_before = group.rows.len();
        self.start_delete(id, key, path.row, count_before)
    }

    fn start_delete(&mut self, id: i64, key: GroupKey, row: usize, count_before: usize) -> bool {
        if self.state.pending_delete.is_some() {
            tracing::debug!(id, "a delete is already running");
            return false;
        }
        if self.state.active_record == Some(id) {
            self.state.active_record = None;
        }
        self.state.pending_delete = Some(PendingDelete {
            id,
            key,
            row,
            count_before,
        });
        self.state.progress.deleting = Some(id);
        if let Err(err) = self.actions.spawn_delete(id) {
            tracing::error!(?err, "could not start delete");
            self.state.pending_delete = None;
            self.state.progress.deleting = None;
            self.state
                .show_notice(ServiceError::new("Delete Failed", format!("{err:#}")));
            return false;
        }
        true
    }

    /// Applies `text` as the search filter. Blank text clears it. The fetch
    /// runs off-thread; an older fetch finishing late is dropped.
    pub fn search(&mut self, text: &str) {
        let filter = SearchFilter::parse(text, &self.search_options);
        self.state.search.text = text.to_string();
        self.state.search.last_error = filter.as_ref().and_then(|f| f.error()).map(str::to_string);

        let request = self.query.begin_filter(filter);
        self.state.search.generation = request.generation;
        self.state.progress.searching = true;
        let source = self.query.source().clone();
        if let Err(err) = self.actions.spawn_search(request.clone(), source) {
            tracing::warn!(?err, "search worker unavailable, querying inline");
            let result = request
                .execute(self.query.source())
                .map_err(QueryError::Store);
            self.finish_search(request.generation, result);
        }
    }

    /// User-requested sync. Ignored while offline or already refreshing.
    pub fn refresh(&mut self) -> bool {
        if !self.service().is_online() {
            tracing::debug!("offline, refresh ignored");
            return false;
        }
        if self.state.is_refreshing() {
            return false;
        }
        self.state.begin_refresh();
        if let Err(err) = self.actions.spawn_sync(true) {
            tracing::error!(?err, "could not start sync");
            self.state
                .end_refresh(Some(ServiceError::new("Sync Failed", format!("{err:#}"))));
            return false;
        }
        true
    }

    /// Screen came to the foreground; starts a quiet sync when configured.
    pub fn on_became_active(&mut self) -> bool {
        if !self.sync_on_start || !self.service().is_online() || self.state.is_refreshing() {
            return false;
        }
        match self.actions.spawn_sync(false) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(?err, "could not start background sync");
                false
            }
        }
    }

    /// Creates a note off-thread; it becomes the active record once it exists.
    pub fn add_note(&mut self, content: &str, category: &str) -> bool {
        if !self.state.actions_enabled {
            tracing::debug!("add ignored while actions are disabled");
            return false;
        }
        self.state.progress.adding = true;
        if let Err(err) = self
            .actions
            .spawn_add(content.to_string(), category.to_string())
        {
            tracing::error!(?err, "could not start add");
            self.state.progress.adding = false;
            self.state
                .show_notice(ServiceError::new("Add Failed", format!("{err:#}")));
            return false;
        }
        true
    }

    /// Accepted drops become new uncategorized notes.
    pub fn accept_drop(
        &mut self,
        destination: Option<RowPath>,
        payload: &[PayloadKind],
        text: &str,
    ) -> DropProposal {
        let proposal = self.projector.drop_proposal(destination, payload);
        if proposal == DropProposal::Copy && !self.add_note(text, "") {
            return DropProposal::Forbidden;
        }
        proposal
    }

    /// Makes the record at `path` the active one and hands it out.
    pub fn select_row(&mut self, path: RowPath) -> Option<NoteRecord> {
        let record = self.projector.record(path)?.clone();
        self.state.selection = Some(path);
        self.state.active_record = Some(record.id);
        Some(record)
    }

    pub fn dismiss_notice(&mut self) {
        self.state.dismiss_notice();
    }

    /// Re-queries and pushes the difference to the presenter.
    pub fn notify_store_changed(&mut self) {
        self.requery();
    }

    pub fn handle_event(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::DeleteFinished { id, result } => self.finish_delete(id, result),
            BrowserEvent::SyncFinished {
                user_initiated,
                result,
            } => {
                let failure = result.err();
                if let Some(err) = &failure {
                    tracing::warn!(title = %err.title, message = %err.message, "sync failed");
                }
                if user_initiated {
                    self.state.end_refresh(failure);
                } else if let Some(err) = failure {
                    self.state.show_notice(err);
                }
                self.requery();
            }
            BrowserEvent::NoteAdded { result } => {
                self.state.progress.adding = false;
                match result {
                    Ok(Some(record)) => {
                        self.requery();
                        self.state.active_record = Some(record.id);
                        self.state.selection = self.projector.model().visible_path_of(record.id);
                    }
                    Ok(None) => tracing::debug!("notes manager declined to create a note"),
                    Err(err) => {
                        tracing::warn!(title = %err.title, "add failed");
                        self.state.show_notice(err);
                    }
                }
            }
            BrowserEvent::SearchFinished { generation, result } => {
                self.finish_search(generation, result)
            }
            BrowserEvent::StoreChanged => self.requery(),
        }
    }

    /// Handles every event already queued. Returns how many there were.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for one event and handles it.
    pub fn wait_event(&mut self, timeout: Duration) -> bool {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Handles events until no background work is left or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.state.progress.is_idle() {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            self.wait_event(left);
        }
        self.pump();
        true
    }

    fn finish_delete(&mut self, id: i64, result: Result<(), ServiceError>) {
        self.state.progress.deleting = None;
        let pending = match self.state.pending_delete.take() {
            Some(pending) if pending.id == id => pending,
            other => {
                tracing::debug!(id, "delete finished without a matching request");
                self.state.pending_delete = other;
                self.requery();
                return;
            }
        };
        match result {
            Ok(()) => {
                self.requery();
                tracing::debug!(
                    id,
                    group = %pending.key,
                    count_before = pending.count_before,
                    "delete finished"
                );
                self.select_after_removal(
                    id,
                    &pending.key,
                    pending.row,
                    Some(pending.count_before),
                );
            }
            Err(err) => {
                tracing::warn!(id, title = %err.title, message = %err.message, "delete failed");
                self.state.show_notice(err);
                self.requery();
            }
        }
    }

    fn finish_search(&mut self, generation: u64, result: Result<Snapshot, QueryError>) {
        match self.query.complete_filter(generation, result) {
            Ok(snapshot) => {
                self.state.progress.searching = false;
                let batch = self.projector.reload(snapshot);
                self.apply(batch);
            }
            Err(QueryError::Stale { got, current }) => {
                tracing::debug!(got, current, "stale search result dropped");
            }
            Err(QueryError::Overtaken { generation }) => {
                self.state.progress.searching = false;
                tracing::debug!(generation, "search result older than the list, dropped");
            }
            Err(err) => {
                self.state.progress.searching = false;
                tracing::debug!(?err, "search fetch failed, keeping current list");
            }
        }
    }

    fn requery(&mut self) {
        let changes = match self.query.refresh() {
            Ok(changes) => changes,
            Err(err) => {
                tracing::debug!(?err, "re-query skipped");
                return;
            }
        };
        if changes.superseded_fetch.is_some() {
            self.state.progress.searching = false;
        }
        self.projector.will_change_content();
        for delta in &changes.deltas {
            self.projector.did_change(delta);
        }
        let batch = self.projector.did_change_content(changes.snapshot);
        self.apply(batch);
    }

    fn apply(&mut self, batch: OperationBatch) {
        let report = self
            .applier
            .apply(&batch, &mut self.presenter, self.state.active_record);
        self.presenter.rebind(&self.projector);
        if let Some(removed) = report.active_removed {
            self.replace_active(removed);
        }
        self.revalidate_selection();
    }

    /// The active record vanished without a delete from this screen.
    fn replace_active(&mut self, removed: RemovedRecord) {
        tracing::debug!(id = removed.id, group = %removed.key, "active record left the list");
        self.select_after_removal(removed.id, &removed.key, removed.row, None);
    }

    /// Picks the row that takes over from `removed_id`. `count_before` is the
    /// group's row count when a delete started; rows that arrived since then
    /// are not candidates.
    fn select_after_removal(
        &mut self,
        removed_id: i64,
        key: &GroupKey,
        row: usize,
        count_before: Option<usize>,
    ) {
        let group = self.projector.model().group_index(key);
        let visible = group.map_or(0, |gi| self.projector.visible_row_count(gi));
        let remaining = match count_before {
            Some(count) => visible.min(count.saturating_sub(1)),
            None => visible,
        };
        let replacement = group
            .zip(select_replacement(remaining, row))
            .map(|(gi, ri)| RowPath::new(gi, ri))
            .and_then(|path| self.projector.record_id_at(path).map(|id| (path, id)))
            .filter(|(_, id)| *id != removed_id);
        match replacement {
            Some((path, id)) => {
                self.state.selection = Some(path);
                self.state.active_record = Some(id);
            }
            None => {
                self.state.selection = None;
                self.state.active_record = None;
            }
        }
    }

    fn revalidate_selection(&mut self) {
        self.state.selection = match self.state.active_record {
            Some(id) => self.projector.model().visible_path_of(id),
            None => self
                .state
                .selection
                .filter(|path| self.projector.record_id_at(*path).is_some()),
        };
    }
}
