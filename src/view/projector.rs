//! Reconciles query results with the collapse flags into the on-screen
//! model, and turns each content change into one [`OperationBatch`].

use std::collections::HashSet;
use std::sync::Arc;

use super::applier::replay;
use super::{
    DropProposal, DropTarget, EditActions, GroupHeader, HeaderSource, OperationBatch,
    PayloadKind, ReferenceList, RemovedRecord, RowPath, RowSource, ViewModel,
};
use crate::groups::{load_or_default, GroupCollapseState, GroupKey, GroupStateStore};
use crate::query::{diff_snapshots, Delta, Snapshot};
use crate::storage::NoteRecord;

/// Deltas collected between `will_change_content` and `did_change_content`.
/// Paths are hints in the old snapshot's index space.
#[derive(Debug, Default)]
struct PendingChanges {
    removed: Vec<(i64, Option<RowPath>)>,
    added: HashSet<i64>,
    updated: Vec<(i64, Option<RowPath>)>,
}

impl PendingChanges {
    fn record(&mut self, delta: &Delta) {
        match delta {
            Delta::RowDeleted { record, at, .. } => self.removed.push((record.id, Some(*at))),
            Delta::RowInserted { record, .. } => {
                self.added.insert(record.id);
            }
            Delta::RowUpdated { record, at, .. } => self.updated.push((record.id, Some(*at))),
            Delta::RowMoved {
                record, from_path, ..
            } => {
                self.removed.push((record.id, Some(*from_path)));
                self.added.insert(record.id);
            }
            Delta::GroupAppeared { key, .. } | Delta::GroupDisappeared { key, .. } => {
                tracing::trace!(group = %key, "group lifecycle delta");
            }
        }
    }

    fn from_deltas(deltas: &[Delta]) -> Self {
        let mut pending = Self::default();
        for delta in deltas {
            pending.record(delta);
        }
        pending
    }
}

pub struct Projector {
    model: ViewModel,
    snapshot: Arc<Snapshot>,
    collapse: GroupCollapseState,
    store: Box<dyn GroupStateStore>,
    pending: Option<PendingChanges>,
    no_category_label: String,
}

impl Projector {
    /// Starts empty with the flags `store` holds; a failing store means
    /// every group starts expanded.
    pub fn new(store: Box<dyn GroupStateStore>, no_category_label: impl Into<String>) -> Self {
        let collapse = load_or_default(store.as_ref());
        Self {
            model: ViewModel::default(),
            snapshot: Arc::new(Snapshot::default()),
            collapse,
            store,
            pending: None,
            no_category_label: no_category_label.into(),
        }
    }

    pub fn model(&self) -> &ViewModel {
        &self.model
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn collapse_state(&self) -> &GroupCollapseState {
        &self.collapse
    }

    pub fn no_category_label(&self) -> &str {
        &self.no_category_label
    }

    pub fn is_collapsed(&self, key: &GroupKey) -> bool {
        self.collapse.is_collapsed(key)
    }

    /// Record shown at `path`, looked up in the current snapshot.
    pub fn record(&self, path: RowPath) -> Option<&NoteRecord> {
        let id = self.model.record_id_at(path)?;
        self.snapshot.record(id)
    }

    pub fn record_by_id(&self, id: i64) -> Option<&NoteRecord> {
        self.snapshot.record(id)
    }

    /// Replaces everything with `snapshot`. The collapse flags converge onto
    /// the groups of the unfiltered record set, so a filter that hides a
    /// group never prunes or resets its flag.
    pub fn reload(&mut self, snapshot: Arc<Snapshot>) -> OperationBatch {
        self.reconcile(&snapshot);
        self.pending = None;
        self.model = ViewModel::project(&snapshot, &self.collapse);
        let removed = self.removed_records(&snapshot);
        self.snapshot = snapshot;
        OperationBatch {
            removed,
            ..OperationBatch::reload_all()
        }
    }

    /// Opens a change window. Deltas until `did_change_content` go into one batch.
    pub fn will_change_content(&mut self) {
        if self.pending.is_some() {
            tracing::debug!("change window already open");
            return;
        }
        self.pending = Some(PendingChanges::default());
    }

    pub fn did_change(&mut self, delta: &Delta) {
        self.pending
            .get_or_insert_with(PendingChanges::default)
            .record(delta);
    }

    /// Closes the change window: reconciles and persists the collapse flags,
    /// moves to `snapshot` and returns the batch that takes a list showing
    /// the old model to one showing the new model.
    ///
    /// Without an open window the deltas are derived from the snapshots.
    pub fn did_change_content(&mut self, snapshot: Arc<Snapshot>) -> OperationBatch {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => PendingChanges::from_deltas(&diff_snapshots(&self.snapshot, &snapshot)),
        };
        self.reconcile(&snapshot);

        let next = ViewModel::project(&snapshot, &self.collapse);
        let mut batch = self.plan(&pending, &next);
        batch.removed = self.removed_records(&snapshot);

        let mut reference = ReferenceList::from_source(&self.model);
        replay(&batch, &mut reference);
        if let Err(mismatch) = reference.verify(&next) {
            tracing::warn!(%mismatch, "incremental batch disagrees with snapshot, reloading list");
            batch = OperationBatch {
                removed: std::mem::take(&mut batch.removed),
                ..OperationBatch::reload_all()
            };
        }

        self.model = next;
        self.snapshot = snapshot;
        batch
    }

    /// Flips the flag of the group at `index`. `key` is what the caller saw
    /// there; when it no longer matches the group is found by key, and when
    /// the group is gone the toggle does nothing.
    pub fn toggle(&mut self, index: usize, key: &GroupKey) -> Option<(bool, OperationBatch)> {
        let index = match self.model.group_key(index) {
            Some(current) if current == key => index,
            _ => {
                let found = self.model.group_index(key);
                tracing::debug!(group = %key, index, ?found, "toggle index was stale");
                found?
            }
        };
        let collapsed = self.collapse.toggle(key);
        self.model.set_collapsed(index, collapsed);
        self.persist();

        let mut batch = OperationBatch::default();
        batch.reloaded_groups.insert(index);
        Some((collapsed, batch))
    }

    fn reconcile(&mut self, snapshot: &Snapshot) {
        let report = self.collapse.reconcile(snapshot.source_group_keys());
        if report.is_changed() {
            tracing::debug!(
                added = report.added.len(),
                pruned = report.pruned.len(),
                "collapse state reconciled"
            );
            self.persist();
        }
    }

    fn persist(&self) {
        if let Err(err) = self.store.save(&self.collapse) {
            tracing::warn!(?err, "could not persist group state, keeping it in memory");
        }
    }

    /// Validates a path hint against the current model by identity, falling
    /// back to a search.
    fn resolve_pre(&self, id: i64, hint: Option<RowPath>) -> Option<RowPath> {
        if let Some(path) = hint {
            let matches = self
                .model
                .groups()
                .get(path.group)
                .and_then(|group| group.rows.get(path.row))
                == Some(&id);
            if matches {
                return Some(path);
            }
        }
        let found = self.model.locate(id);
        if found.is_none() {
            tracing::debug!(id, ?hint, "row no longer in the list, skipping");
        }
        found
    }

    fn plan(&self, pending: &PendingChanges, next: &ViewModel) -> OperationBatch {
        let mut batch = OperationBatch::default();
        let pre = &self.model;

        for (gi, group) in pre.groups().iter().enumerate() {
            if next.group_index(&group.key).is_none() {
                batch.deleted_groups.insert(gi);
            }
        }
        for (gi, group) in next.groups().iter().enumerate() {
            if pre.group_index(&group.key).is_none() {
                batch.inserted_groups.insert(gi);
            }
        }

        let mut removed_ids = HashSet::new();
        for &(id, hint) in &pending.removed {
            removed_ids.insert(id);
            let Some(path) = self.resolve_pre(id, hint) else {
                continue;
            };
            if batch.deleted_groups.contains(&path.group) || pre.groups()[path.group].collapsed {
                continue;
            }
            batch.deleted_rows.insert(path);
        }

        for &id in &pending.added {
            let Some(path) = next.locate(id) else {
                tracing::debug!(id, "inserted row missing from new snapshot, skipping");
                continue;
            };
            if batch.inserted_groups.contains(&path.group) || next.groups()[path.group].collapsed {
                continue;
            }
            batch.inserted_rows.insert(path);
        }

        for &(id, hint) in &pending.updated {
            if removed_ids.contains(&id) || pending.added.contains(&id) {
                continue;
            }
            let Some(path) = self.resolve_pre(id, hint) else {
                continue;
            };
            if batch.deleted_groups.contains(&path.group) || pre.groups()[path.group].collapsed {
                continue;
            }
            batch.reloaded_rows.insert(path);
        }
        batch
    }

    fn removed_records(&self, next: &Snapshot) -> Vec<RemovedRecord> {
        let mut removed = Vec::new();
        for group in self.model.groups() {
            for (row, &id) in group.rows.iter().enumerate() {
                if next.path_of(id).is_none() {
                    removed.push(RemovedRecord {
                        id,
                        key: group.key.clone(),
                        row,
                    });
                }
            }
        }
        removed
    }
}

impl RowSource for Projector {
    fn group_count(&self) -> usize {
        self.model.group_count()
    }

    fn group_key(&self, group: usize) -> Option<&GroupKey> {
        self.model.group_key(group)
    }

    fn visible_row_count(&self, group: usize) -> usize {
        self.model.visible_row_count(group)
    }

    fn record_id_at(&self, path: RowPath) -> Option<i64> {
        self.model.record_id_at(path)
    }
}

impl HeaderSource for Projector {
    fn group_header(&self, group: usize) -> Option<GroupHeader> {
        let view = self.model.groups().get(group)?;
        Some(GroupHeader {
            index: group,
            key: view.key.clone(),
            display_title: view.key.display_title(&self.no_category_label).to_string(),
            collapsed: view.collapsed,
            record_count: view.rows.len(),
        })
    }
}

impl EditActions for Projector {
    fn can_delete(&self, path: RowPath) -> bool {
        self.record(path).is_some()
    }
}

impl DropTarget for Projector {
    /// Text-like payloads may be dropped onto the first group and become new
    /// uncategorized notes.
    fn drop_proposal(&self, destination: Option<RowPath>, payload: &[PayloadKind]) -> DropProposal {
        match destination {
            Some(path) if path.group == 0 && payload.iter().any(|kind| kind.is_textual()) => {
                DropProposal::Copy
            }
            _ => DropProposal::Forbidden,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::{GroupCollapse, MemoryGroupStateStore};
    use crate::config::SearchOptions;
    use crate::search::SearchFilter;

    fn note(id: i64, category: &str, modified: i64) -> NoteRecord {
        NoteRecord {
            id,
            guid: format!("g{id}"),
            title: format!("n{id}"),
            content: String::new(),
            category: category.into(),
            modified,
            delete_needed: false,
        }
    }

    fn snap(records: Vec<NoteRecord>) -> Arc<Snapshot> {
        Arc::new(Snapshot::build(records, None, 0))
    }

    fn loaded(records: Vec<NoteRecord>) -> (MemoryGroupStateStore, Projector, ReferenceList) {
        let store = MemoryGroupStateStore::new();
        let mut projector = Projector::new(Box::new(store.clone()), "Uncategorized");
        projector.reload(snap(records));
        let list = ReferenceList::from_source(&projector);
        (store, projector, list)
    }

    fn change(projector: &mut Projector, list: &mut ReferenceList, records: Vec<NoteRecord>) -> OperationBatch {
        let next = snap(records);
        projector.will_change_content();
        for delta in diff_snapshots(projector.snapshot(), &next) {
            projector.did_change(&delta);
        }
        let batch = projector.did_change_content(next);
        replay(&batch, list);
        list.resolve(projector);
        batch
    }

    fn key(value: &str) -> GroupKey {
        GroupKey::new(value)
    }

    #[test]
    fn collapsed_group_hides_rows_and_survives_inserts() {
        let (store, mut projector, mut list) =
            loaded(vec![note(1, "Work", 100), note(2, "Work", 90), note(3, "Home", 80)]);
        let home = projector.model().group_index(&key("Home")).expect("home group");
        let (_, batch) = projector.toggle(home, &key("Home")).expect("toggle");
        replay(&batch, &mut list);
        list.resolve(&projector);

        let batch = change(
            &mut projector,
            &mut list,
            vec![note(1, "Work", 100), note(2, "Work", 90), note(3, "Home", 80), note(4, "Home", 70)],
        );
        assert!(!batch.full_reload);
        assert!(batch.inserted_rows.is_empty());
        assert!(projector.is_collapsed(&key("Home")));
        assert_eq!(
            list.content(),
            vec![(key("Home"), vec![]), (key("Work"), vec![1, 2])]
        );

        change(&mut projector, &mut list, vec![note(1, "Work", 100), note(2, "Work", 90)]);
        assert!(!projector.collapse_state().contains(&key("Home")));
        assert_eq!(list.content(), vec![(key("Work"), vec![1, 2])]);
        assert!(store.saved_entries().iter().all(|e| e.title != "Home"));
        assert!(list.violations().is_empty());
    }

    #[test]
    fn filtered_content_change_keeps_hidden_group_flags() {
        let (store, mut projector, mut list) =
            loaded(vec![note(1, "Work", 100), note(2, "Home", 80)]);
        let home = projector.model().group_index(&key("Home")).expect("home group");
        projector.toggle(home, &key("Home")).expect("toggle");

        let filter = SearchFilter::parse("n1", &SearchOptions::default());
        let filtered = |records: Vec<NoteRecord>| Arc::new(Snapshot::build(records, filter.as_ref(), 0));
        let batch = projector.reload(filtered(vec![note(1, "Work", 100), note(2, "Home", 80)]));
        replay(&batch, &mut list);
        list.resolve(&projector);
        assert_eq!(list.content(), vec![(key("Work"), vec![1])]);

        let next = filtered(vec![note(1, "Work", 100), note(2, "Home", 80), note(10, "Work", 90)]);
        projector.will_change_content();
        for delta in diff_snapshots(projector.snapshot(), &next) {
            projector.did_change(&delta);
        }
        let batch = projector.did_change_content(next);
        replay(&batch, &mut list);
        list.resolve(&projector);
        assert_eq!(list.content(), vec![(key("Work"), vec![1, 10])]);
        assert!(projector.collapse_state().contains(&key("Home")));
        assert!(projector.is_collapsed(&key("Home")));

        let batch = projector.reload(snap(vec![note(1, "Work", 100), note(2, "Home", 80), note(10, "Work", 90)]));
        replay(&batch, &mut list);
        list.resolve(&projector);
        assert_eq!(
            list.content(),
            vec![(key("Home"), vec![]), (key("Work"), vec![1, 10])]
        );
        assert!(store
            .saved_entries()
            .iter()
            .any(|e| e.title == "Home" && e.collapsed));
        assert!(list.violations().is_empty());
    }

    #[test]
    fn last_row_deletion_removes_the_group() {
        let (_store, mut projector, mut list) = loaded(vec![note(1, "A", 2), note(2, "B", 1)]);
        let batch = change(&mut projector, &mut list, vec![note(1, "A", 2)]);
        assert_eq!(batch.deleted_groups.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert!(batch.deleted_rows.is_empty());
        assert_eq!(batch.removed.len(), 1);
        assert_eq!(batch.removed[0].id, 2);
    }

    #[test]
    fn move_between_groups_is_delete_then_insert() {
        let (_store, mut projector, mut list) =
            loaded(vec![note(1, "A", 3), note(2, "A", 2), note(3, "B", 1)]);
        let batch = change(
            &mut projector,
            &mut list,
            vec![note(1, "A", 3), note(2, "B", 2), note(3, "B", 1)],
        );
        assert_eq!(batch.deleted_rows.iter().copied().collect::<Vec<_>>(), vec![RowPath::new(0, 1)]);
        assert_eq!(batch.inserted_rows.iter().copied().collect::<Vec<_>>(), vec![RowPath::new(1, 0)]);
        assert!(batch.removed.is_empty());
        assert_eq!(list.content(), projector.model().visible());
    }

    #[test]
    fn stale_hints_are_revalidated_by_identity() {
        let (_store, mut projector, mut list) = loaded(vec![note(1, "A", 3), note(2, "A", 2)]);
        let next = snap(vec![note(1, "A", 3)]);
        projector.will_change_content();
        projector.did_change(&Delta::RowDeleted {
            key: key("A"),
            record: note(2, "A", 2),
            at: RowPath::new(0, 7),
        });
        projector.did_change(&Delta::RowDeleted {
            key: key("A"),
            record: note(99, "A", 2),
            at: RowPath::new(0, 0),
        });
        let batch = projector.did_change_content(next);
        assert!(!batch.full_reload);
        assert_eq!(batch.deleted_rows.iter().copied().collect::<Vec<_>>(), vec![RowPath::new(0, 1)]);
        replay(&batch, &mut list);
        assert_eq!(list.content(), vec![(key("A"), vec![1])]);
    }

    #[test]
    fn missing_deltas_fall_back_to_a_full_reload() {
        let (_store, mut projector, _list) = loaded(vec![note(1, "A", 3)]);
        projector.will_change_content();
        let batch = projector.did_change_content(snap(vec![note(1, "A", 3), note(2, "A", 9)]));
        assert!(batch.full_reload);
        assert_eq!(projector.model().visible(), vec![(key("A"), vec![2, 1])]);
    }

    #[test]
    fn toggle_twice_restores_rows_and_flag() {
        let (store, mut projector, mut list) = loaded(vec![note(1, "A", 2), note(2, "A", 1)]);
        let before = projector.model().clone();

        let (collapsed, batch) = projector.toggle(0, &key("A")).expect("first toggle");
        assert!(collapsed);
        replay(&batch, &mut list);
        list.resolve(&projector);
        assert_eq!(list.content(), vec![(key("A"), vec![])]);

        let (collapsed, batch) = projector.toggle(0, &key("A")).expect("second toggle");
        assert!(!collapsed);
        replay(&batch, &mut list);
        list.resolve(&projector);
        assert_eq!(projector.model(), &before);
        assert_eq!(list.content(), vec![(key("A"), vec![1, 2])]);
        assert_eq!(
            store.saved_entries(),
            vec![GroupCollapse {
                title: "A".into(),
                collapsed: false
            }]
        );
    }

    #[test]
    fn toggle_on_vanished_group_is_a_no_op() {
        let (_store, mut projector, _list) = loaded(vec![note(1, "A", 2)]);
        assert!(projector.toggle(0, &key("Gone")).is_none());
        assert!(projector.toggle(5, &key("Gone")).is_none());
        let (_, batch) = projector.toggle(9, &key("A")).expect("found by key");
        assert!(batch.reloaded_groups.contains(&0));
    }

    #[test]
    fn persistence_failure_keeps_flags_in_memory() {
        let store = MemoryGroupStateStore::with_entries(vec![GroupCollapse {
            title: "A".into(),
            collapsed: true,
        }]);
        store.set_failing(true);
        let mut projector = Projector::new(Box::new(store.clone()), "Uncategorized");
        projector.reload(snap(vec![note(1, "A", 1)]));
        assert!(!projector.is_collapsed(&key("A")));

        projector.toggle(0, &key("A"));
        assert!(projector.is_collapsed(&key("A")));
        assert_eq!(projector.visible_row_count(0), 0);
    }

    #[test]
    fn headers_and_capabilities() {
        let (_store, mut projector, _list) = loaded(vec![note(1, "", 2), note(2, "Work", 1)]);
        let header = projector.group_header(0).expect("header");
        assert_eq!(header.display_title, "Uncategorized");
        assert_eq!(header.record_count, 1);
        assert!(projector.group_header(2).is_none());

        assert!(projector.can_delete(RowPath::new(1, 0)));
        assert!(!projector.can_delete(RowPath::new(1, 1)));
        projector.toggle(1, &key("Work")).expect("toggle");
        assert!(!projector.can_delete(RowPath::new(1, 0)));

        assert_eq!(
            projector.drop_proposal(Some(RowPath::new(0, 0)), &[PayloadKind::PlainText]),
            DropProposal::Copy
        );
        assert_eq!(
            projector.drop_proposal(Some(RowPath::new(1, 0)), &[PayloadKind::PlainText]),
            DropProposal::Forbidden
        );
        assert_eq!(
            projector.drop_proposal(Some(RowPath::new(0, 0)), &[PayloadKind::Image]),
            DropProposal::Forbidden
        );
        assert_eq!(projector.drop_proposal(None, &[PayloadKind::Text]), DropProposal::Forbidden);
    }
}
