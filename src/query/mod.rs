//! Grouped, filtered view over the record store.
//!
//! The controller owns the active [`SearchFilter`] and the last good
//! [`Snapshot`]. Every re-query is diffed against that snapshot and handed
//! out as a [`ChangeSet`]: an ordered list of [`Delta`]s plus the snapshot
//! they lead to.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::groups::GroupKey;
use crate::search::SearchFilter;
use crate::storage::{group_order, NoteRecord, RecordSource};

mod diff;

pub use diff::diff_snapshots;

/// Position in snapshot index space: group index, then row index within
/// the group. Collapse state plays no part here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowPath {
    pub group: usize,
    pub row: usize,
}

impl RowPath {
    pub fn new(group: usize, row: usize) -> Self {
        Self { group, row }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub key: GroupKey,
    pub records: Vec<NoteRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    generation: u64,
    groups: Vec<GroupSnapshot>,
    /// Keys of every group in the live record set, filter or not.
    source_keys: Vec<GroupKey>,
}

impl Snapshot {
    /// Filters, sorts and groups `records`. Soft-deleted records never make it in.
    pub fn build(records: Vec<NoteRecord>, filter: Option<&SearchFilter>, generation: u64) -> Self {
        let live = records.into_iter().filter(|record| !record.delete_needed);
        let mut source_keys: Vec<GroupKey> = Vec::new();
        let mut live: Vec<NoteRecord> = live
            .inspect(|record| source_keys.push(GroupKey::new(record.category.clone())))
            .filter(|record| filter.map_or(true, |f| f.matches_record(record)))
            .collect();
        source_keys.sort();
        source_keys.dedup();
        live.sort_by(group_order);

        let mut groups: Vec<GroupSnapshot> = Vec::new();
        for record in live {
            match groups.last_mut() {
                Some(group) if group.key.as_str() == record.category => group.records.push(record),
                _ => groups.push(GroupSnapshot {
                    key: GroupKey::new(record.category.clone()),
                    records: vec![record],
                }),
            }
        }
        Self {
            generation,
            groups,
            source_keys,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn groups(&self) -> &[GroupSnapshot] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn record_count(&self) -> usize {
        self.groups.iter().map(|g| g.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.iter().map(|g| &g.key)
    }

    /// Groups the record set holds regardless of the filter. Equal to
    /// [`Snapshot::group_keys`] when no filter is active.
    pub fn source_group_keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.source_keys.iter()
    }

    pub fn group_index(&self, key: &GroupKey) -> Option<usize> {
        self.groups.iter().position(|g| &g.key == key)
    }

    pub fn group(&self, key: &GroupKey) -> Option<&GroupSnapshot> {
        self.groups.iter().find(|g| &g.key == key)
    }

    pub fn record_at(&self, path: RowPath) -> Option<&NoteRecord> {
        self.groups.get(path.group)?.records.get(path.row)
    }

    pub fn path_of(&self, id: i64) -> Option<RowPath> {
        self.groups.iter().enumerate().find_map(|(gi, group)| {
            group
                .records
                .iter()
                .position(|r| r.id == id)
                .map(|ri| RowPath::new(gi, ri))
        })
    }

    pub fn record(&self, id: i64) -> Option<&NoteRecord> {
        self.path_of(id).and_then(|path| self.record_at(path))
    }

    pub(crate) fn positions(&self) -> HashMap<i64, RowPath> {
        let mut map = HashMap::with_capacity(self.record_count());
        for (gi, group) in self.groups.iter().enumerate() {
            for (ri, record) in group.records.iter().enumerate() {
                map.insert(record.id, RowPath::new(gi, ri));
            }
        }
        map
    }
}

/// One incremental change between two snapshots. `at` paths of deletions,
/// updates and move sources are in the old snapshot's index space; paths of
/// insertions and move destinations are in the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    GroupAppeared {
        key: GroupKey,
        index: usize,
    },
    GroupDisappeared {
        key: GroupKey,
        index: usize,
    },
    RowInserted {
        key: GroupKey,
        record: NoteRecord,
        at: RowPath,
    },
    RowDeleted {
        key: GroupKey,
        record: NoteRecord,
        at: RowPath,
    },
    RowUpdated {
        key: GroupKey,
        record: NoteRecord,
        at: RowPath,
    },
    RowMoved {
        from: GroupKey,
        to: GroupKey,
        record: NoteRecord,
        from_path: RowPath,
        to_path: RowPath,
    },
}

impl Delta {
    pub fn record_id(&self) -> Option<i64> {
        match self {
            Delta::RowInserted { record, .. }
            | Delta::RowDeleted { record, .. }
            | Delta::RowUpdated { record, .. }
            | Delta::RowMoved { record, .. } => Some(record.id),
            Delta::GroupAppeared { .. } | Delta::GroupDisappeared { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub deltas: Vec<Delta>,
    pub snapshot: Arc<Snapshot>,
    /// Generation of an off-thread filter fetch this re-query made obsolete.
    /// The snapshot already reflects that fetch's filter.
    pub superseded_fetch: Option<u64>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("re-query failed: {0}")]
    Store(#[source] anyhow::Error),
    #[error("fetch for generation {got} superseded by generation {current}")]
    Stale { got: u64, current: u64 },
    #[error("fetch for generation {generation} overtaken by a newer re-query")]
    Overtaken { generation: u64 },
}

/// Ticket for a fetch running off the owner thread.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub generation: u64,
    pub filter: Option<SearchFilter>,
}

impl FetchRequest {
    /// Runs the fetch; safe to call from any thread.
    pub fn execute<S: RecordSource + ?Sized>(&self, source: &S) -> Result<Snapshot> {
        let records = source.fetch_live_records()?;
        Ok(Snapshot::build(records, self.filter.as_ref(), self.generation))
    }
}

pub struct QueryController<S> {
    source: S,
    filter: Option<SearchFilter>,
    snapshot: Arc<Snapshot>,
    generation: u64,
    /// Generation of the filter fetch handed out and not yet completed.
    pending_fetch: Option<u64>,
    failing: bool,
}

impl<S: RecordSource> QueryController<S> {
    /// Starts with an empty snapshot; call [`QueryController::refresh`] to load.
    pub fn new(source: S) -> Self {
        Self {
            source,
            filter: None,
            snapshot: Arc::new(Snapshot::default()),
            generation: 0,
            pending_fetch: None,
            failing: false,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn filter(&self) -> Option<&SearchFilter> {
        self.filter.as_ref()
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-runs the current predicate and diffs the result against the last
    /// good snapshot. On failure the previous snapshot stays in place.
    ///
    /// A filter fetch still in flight read the store earlier than this, so
    /// it is overtaken: its result will be refused by
    /// [`QueryController::complete_filter`].
    pub fn refresh(&mut self) -> Result<ChangeSet, QueryError> {
        let request = FetchRequest {
            generation: self.generation,
            filter: self.filter.clone(),
        };
        let next = self.run(&request)?;
        let superseded_fetch = self.pending_fetch.take();
        if let Some(generation) = superseded_fetch {
            tracing::debug!(generation, "re-query overtook an in-flight filter fetch");
        }
        let deltas = diff_snapshots(&self.snapshot, &next);
        self.snapshot = Arc::new(next);
        Ok(ChangeSet {
            deltas,
            snapshot: self.current_snapshot(),
            superseded_fetch,
        })
    }

    /// Swaps the predicate and re-queries synchronously. The returned
    /// snapshot is consistent with `filter`.
    pub fn set_filter(&mut self, filter: Option<SearchFilter>) -> Result<Arc<Snapshot>, QueryError> {
        let request = self.begin_filter(filter);
        let result = self.run(&request);
        self.complete_filter(request.generation, result)
    }

    /// Installs `filter` and hands out a ticket for an off-thread fetch.
    /// Any fetch started earlier becomes stale.
    pub fn begin_filter(&mut self, filter: Option<SearchFilter>) -> FetchRequest {
        self.generation += 1;
        self.filter = filter;
        self.pending_fetch = Some(self.generation);
        FetchRequest {
            generation: self.generation,
            filter: self.filter.clone(),
        }
    }

    /// Accepts the outcome of a fetch started with [`QueryController::begin_filter`].
    pub fn complete_filter(
        &mut self,
        generation: u64,
        result: Result<Snapshot, QueryError>,
    ) -> Result<Arc<Snapshot>, QueryError> {
        if generation != self.generation {
            tracing::debug!(generation, current = self.generation, "discarding stale fetch");
            return Err(QueryError::Stale {
                got: generation,
                current: self.generation,
            });
        }
        if self.pending_fetch != Some(generation) {
            tracing::debug!(generation, "discarding fetch overtaken by a re-query");
            return Err(QueryError::Overtaken { generation });
        }
        self.pending_fetch = None;
        let snapshot = result?;
        self.snapshot = Arc::new(snapshot);
        Ok(self.current_snapshot())
    }

    fn run(&mut self, request: &FetchRequest) -> Result<Snapshot, QueryError> {
        match request.execute(&self.source) {
            Ok(snapshot) => {
                if self.failing {
                    tracing::info!("record store queries recovered");
                }
                self.failing = false;
                Ok(snapshot)
            }
            Err(err) => {
                if self.failing {
                    tracing::debug!(?err, "re-query still failing");
                } else {
                    tracing::warn!(?err, "re-query failed, keeping last snapshot");
                }
                self.failing = true;
                Err(QueryError::Store(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchOptions;
    use crate::storage::{MemoryRecordStore, NewNote};
    use assert_matches::assert_matches;

    fn filter(text: &str) -> Option<SearchFilter> {
        SearchFilter::parse(text, &SearchOptions::default())
    }

    #[test]
    fn snapshot_groups_by_category_with_newest_first() {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("b", "Work").modified_at(90));
        store.insert(NewNote::new("c", "Home").modified_at(80));
        store.insert(NewNote::new("a", "Work").modified_at(100));

        let mut controller = QueryController::new(store);
        let changes = controller.refresh().expect("refresh");
        let snapshot = changes.snapshot;
        let keys: Vec<_> = snapshot.group_keys().map(GroupKey::as_str).collect();
        assert_eq!(keys, vec!["Home", "Work"]);
        let work: Vec<_> = snapshot.groups()[1]
            .records
            .iter()
            .map(|r| r.title.as_str())
            .collect();
        assert_eq!(work, vec!["a", "b"]);
    }

    #[test]
    fn filter_restricts_membership_but_keeps_grouping() -> anyhow::Result<()> {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("Foobar", "Work").modified_at(3));
        store.insert(NewNote::new("bar\nFOO stuff", "Home").modified_at(2));
        store.insert(NewNote::new("unrelated", "Home").modified_at(1));

        let mut controller = QueryController::new(store);
        let snapshot = controller.set_filter(filter("foo"))?;
        assert_eq!(snapshot.group_count(), 2);
        assert_eq!(snapshot.record_count(), 2);

        let cleared = controller.set_filter(None)?;
        assert_eq!(cleared.record_count(), 3);
        Ok(())
    }

    #[test]
    fn malformed_predicate_yields_no_results() -> anyhow::Result<()> {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("anything", "Work"));
        let mut controller = QueryController::new(store);
        let snapshot = controller.set_filter(filter("re:[oops"))?;
        assert!(snapshot.is_empty());
        Ok(())
    }

    #[test]
    fn failed_requery_keeps_last_good_snapshot() {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("kept", "Work"));
        let mut controller = QueryController::new(store.clone());
        controller.refresh().expect("initial refresh");

        store.set_fail_reads(true);
        store.insert(NewNote::new("unseen", "Work"));
        assert_matches!(controller.refresh(), Err(QueryError::Store(_)));
        assert_matches!(controller.refresh(), Err(QueryError::Store(_)));
        assert_eq!(controller.current_snapshot().record_count(), 1);

        store.set_fail_reads(false);
        let changes = controller.refresh().expect("recovered");
        assert_eq!(changes.deltas.len(), 1);
        assert_eq!(changes.snapshot.record_count(), 2);
    }

    #[test]
    fn stale_fetch_is_discarded() {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("foo", "Work"));
        store.insert(NewNote::new("bar", "Work"));
        let mut controller = QueryController::new(store.clone());

        let first = controller.begin_filter(filter("foo"));
        let second = controller.begin_filter(filter("bar"));
        let first_result = first.execute(&store).map_err(QueryError::Store);
        let second_result = second.execute(&store).map_err(QueryError::Store);

        let applied = controller
            .complete_filter(second.generation, second_result)
            .expect("latest fetch applies");
        assert_eq!(applied.record_count(), 1);
        assert_matches!(
            controller.complete_filter(first.generation, first_result),
            Err(QueryError::Stale { .. })
        );
        let current = controller.current_snapshot();
        assert_eq!(current.groups()[0].records[0].title, "bar");
    }

    #[test]
    fn fetch_older_than_a_refresh_is_refused() {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("foo one", "Work").modified_at(1));
        let mut controller = QueryController::new(store.clone());
        controller.refresh().expect("initial refresh");

        let request = controller.begin_filter(filter("foo"));
        let early = request.execute(&store).map_err(QueryError::Store);
        store.insert(NewNote::new("foo two", "Work").modified_at(2));

        let changes = controller.refresh().expect("refresh");
        assert_eq!(changes.superseded_fetch, Some(request.generation));
        assert_eq!(changes.snapshot.record_count(), 2);

        assert_matches!(
            controller.complete_filter(request.generation, early),
            Err(QueryError::Overtaken { .. })
        );
        assert_eq!(controller.current_snapshot().record_count(), 2);

        // Later refreshes no longer report it.
        assert_eq!(controller.refresh().expect("refresh").superseded_fetch, None);
    }

    #[test]
    fn failed_refresh_leaves_the_pending_fetch_valid() {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("foo", "Work"));
        let mut controller = QueryController::new(store.clone());

        let request = controller.begin_filter(filter("foo"));
        let result = request.execute(&store).map_err(QueryError::Store);
        store.set_fail_reads(true);
        assert_matches!(controller.refresh(), Err(QueryError::Store(_)));

        let applied = controller
            .complete_filter(request.generation, result)
            .expect("fetch still current");
        assert_eq!(applied.record_count(), 1);
    }

    #[test]
    fn filtered_snapshot_remembers_every_source_group() {
        let store = MemoryRecordStore::new();
        store.insert(NewNote::new("foo", "Work"));
        store.insert(NewNote::new("bar", "Home"));
        let records = store.fetch_live_records().expect("records");
        let snapshot = Snapshot::build(records, filter("foo").as_ref(), 0);
        let shown: Vec<_> = snapshot.group_keys().map(GroupKey::as_str).collect();
        let source: Vec<_> = snapshot.source_group_keys().map(GroupKey::as_str).collect();
        assert_eq!(shown, vec!["Work"]);
        assert_eq!(source, vec!["Home", "Work"]);
    }
}
