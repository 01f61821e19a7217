use std::collections::BTreeSet;

use super::{OperationBatch, RemovedRecord, RowPath, RowSource};

/// Whatever draws the list. Calls between `begin_updates` and `end_updates`
/// form one visual transaction: deletions and reloads address the list as it
/// was before the transaction, insertions address it as it will be after.
pub trait ListPresenter {
    fn begin_updates(&mut self);
    fn delete_groups(&mut self, groups: &[usize]);
    fn insert_groups(&mut self, groups: &[usize]);
    fn reload_groups(&mut self, groups: &[usize]);
    fn delete_rows(&mut self, rows: &[RowPath]);
    fn insert_rows(&mut self, rows: &[RowPath]);
    fn reload_rows(&mut self, rows: &[RowPath]);
    fn end_updates(&mut self);
    /// Drops everything and re-reads the whole list.
    fn reload_all(&mut self);
    /// Called after every batch so inserted and reloaded rows can be read
    /// back from the data source.
    fn rebind(&mut self, _source: &dyn RowSource) {}
}

/// Plays `batch` into `presenter` as a single transaction.
pub fn replay(batch: &OperationBatch, presenter: &mut dyn ListPresenter) {
    if batch.full_reload {
        presenter.reload_all();
        return;
    }
    if batch.operation_count() == 0 {
        return;
    }
    let groups = |set: &BTreeSet<usize>| set.iter().copied().collect::<Vec<_>>();
    let rows = |set: &BTreeSet<RowPath>| set.iter().copied().collect::<Vec<_>>();

    presenter.begin_updates();
    if !batch.deleted_rows.is_empty() {
        presenter.delete_rows(&rows(&batch.deleted_rows));
    }
    if !batch.deleted_groups.is_empty() {
        presenter.delete_groups(&groups(&batch.deleted_groups));
    }
    if !batch.inserted_groups.is_empty() {
        presenter.insert_groups(&groups(&batch.inserted_groups));
    }
    if !batch.inserted_rows.is_empty() {
        presenter.insert_rows(&rows(&batch.inserted_rows));
    }
    if !batch.reloaded_groups.is_empty() {
        presenter.reload_groups(&groups(&batch.reloaded_groups));
    }
    if !batch.reloaded_rows.is_empty() {
        presenter.reload_rows(&rows(&batch.reloaded_rows));
    }
    presenter.end_updates();
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub operations: usize,
    pub full_reload: bool,
    /// Set when the active record left the list in this batch.
    pub active_removed: Option<RemovedRecord>,
}

/// Pushes operation batches to the presentation layer and watches for the
/// active record disappearing.
#[derive(Debug, Default)]
pub struct ListMutationApplier {
    batches: u64,
}

impl ListMutationApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches_applied(&self) -> u64 {
        self.batches
    }

    pub fn apply(
        &mut self,
        batch: &OperationBatch,
        presenter: &mut dyn ListPresenter,
        active: Option<i64>,
    ) -> ApplyReport {
        if batch.is_empty() && batch.removed.is_empty() {
            return ApplyReport::default();
        }
        replay(batch, presenter);
        self.batches += 1;

        let active_removed = active.and_then(|id| batch.removes(id)).cloned();
        tracing::debug!(
            batch = self.batches,
            operations = batch.operation_count(),
            full_reload = batch.full_reload,
            active_removed = active_removed.is_some(),
            "applied list batch"
        );
        ApplyReport {
            operations: batch.operation_count(),
            full_reload: batch.full_reload,
            active_removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::GroupKey;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl ListPresenter for Recorder {
        fn begin_updates(&mut self) {
            self.calls.push("begin".into());
        }
        fn delete_groups(&mut self, groups: &[usize]) {
            self.calls.push(format!("delete-groups {groups:?}"));
        }
        fn insert_groups(&mut self, groups: &[usize]) {
            self.calls.push(format!("insert-groups {groups:?}"));
        }
        fn reload_groups(&mut self, groups: &[usize]) {
            self.calls.push(format!("reload-groups {groups:?}"));
        }
        fn delete_rows(&mut self, rows: &[RowPath]) {
            let rows: Vec<_> = rows.iter().map(|p| (p.group, p.row)).collect();
            self.calls.push(format!("delete-rows {rows:?}"));
        }
        fn insert_rows(&mut self, rows: &[RowPath]) {
            let rows: Vec<_> = rows.iter().map(|p| (p.group, p.row)).collect();
            self.calls.push(format!("insert-rows {rows:?}"));
        }
        fn reload_rows(&mut self, rows: &[RowPath]) {
            let rows: Vec<_> = rows.iter().map(|p| (p.group, p.row)).collect();
            self.calls.push(format!("reload-rows {rows:?}"));
        }
        fn end_updates(&mut self) {
            self.calls.push("end".into());
        }
        fn reload_all(&mut self) {
            self.calls.push("reload-all".into());
        }
    }

    #[test]
    fn batch_is_wrapped_in_one_transaction() {
        let mut batch = OperationBatch::default();
        batch.deleted_rows.insert(RowPath::new(0, 2));
        batch.deleted_rows.insert(RowPath::new(0, 0));
        batch.deleted_groups.insert(1);
        batch.inserted_rows.insert(RowPath::new(0, 1));

        let mut recorder = Recorder::default();
        let report = ListMutationApplier::new().apply(&batch, &mut recorder, None);

        assert_eq!(report.operations, 4);
        insta::assert_debug_snapshot!(recorder.calls, @r###"
        [
            "begin",
            "delete-rows [(0, 0), (0, 2)]",
            "delete-groups [1]",
            "insert-rows [(0, 1)]",
            "end",
        ]
        "###);
    }

    #[test]
    fn active_record_removal_is_reported() {
        let mut batch = OperationBatch::default();
        batch.deleted_rows.insert(RowPath::new(0, 1));
        batch.removed.push(RemovedRecord {
            id: 42,
            key: GroupKey::new("Work"),
            row: 1,
        });

        let mut applier = ListMutationApplier::new();
        let mut recorder = Recorder::default();
        let report = applier.apply(&batch, &mut recorder, Some(42));
        assert_eq!(report.active_removed.map(|r| r.row), Some(1));

        let report = applier.apply(&batch, &mut recorder, Some(7));
        assert!(report.active_removed.is_none());
        assert_eq!(applier.batches_applied(), 2);
    }

    #[test]
    fn empty_batch_touches_nothing() {
        let mut recorder = Recorder::default();
        let report = ListMutationApplier::new().apply(&OperationBatch::default(), &mut recorder, Some(1));
        assert_eq!(report, ApplyReport::default());
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn full_reload_skips_the_transaction() {
        let mut recorder = Recorder::default();
        ListMutationApplier::new().apply(&OperationBatch::reload_all(), &mut recorder, None);
        assert_eq!(recorder.calls, vec!["reload-all".to_string()]);
    }
}
