//! On-screen model of the grouped list and the operations that keep a
//! presentation layer in step with it.
//!
//! The projector exposes one narrow trait per capability the list needs
//! ([`RowSource`], [`HeaderSource`], [`EditActions`], [`DropTarget`]) rather
//! than a single all-purpose delegate.

use std::collections::BTreeSet;

use strum::{Display, EnumString};

use crate::groups::{GroupCollapseState, GroupKey};
use crate::query::Snapshot;

pub mod applier;
pub mod display;
pub mod projector;
pub mod reference;

pub use crate::query::RowPath;
pub use applier::{ApplyReport, ListMutationApplier, ListPresenter};
pub use display::{format_relative_date, GroupHeader, RowDisplay};
pub use projector::Projector;
pub use reference::ReferenceList;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewGroup {
    pub key: GroupKey,
    pub collapsed: bool,
    /// Every record id in the group, in display order, whether shown or not.
    pub rows: Vec<i64>,
}

impl ViewGroup {
    pub fn visible_rows(&self) -> &[i64] {
        if self.collapsed {
            &[]
        } else {
            &self.rows
        }
    }
}

/// Ordered groups with their row references. Rows are record ids; the
/// record itself is looked up in the current snapshot on every access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewModel {
    groups: Vec<ViewGroup>,
}

impl ViewModel {
    pub fn project(snapshot: &Snapshot, collapse: &GroupCollapseState) -> Self {
        let groups = snapshot
            .groups()
            .iter()
            .map(|group| ViewGroup {
                key: group.key.clone(),
                collapsed: collapse.is_collapsed(&group.key),
                rows: group.records.iter().map(|r| r.id).collect(),
            })
            .collect();
        Self { groups }
    }

    pub fn groups(&self) -> &[ViewGroup] {
        &self.groups
    }

    pub fn group_index(&self, key: &GroupKey) -> Option<usize> {
        self.groups.iter().position(|g| &g.key == key)
    }

    /// Where `id` sits, ignoring collapse state.
    pub fn locate(&self, id: i64) -> Option<RowPath> {
        self.groups.iter().enumerate().find_map(|(gi, group)| {
            group
                .rows
                .iter()
                .position(|row| *row == id)
                .map(|ri| RowPath::new(gi, ri))
        })
    }

    /// Where `id` is shown, if its group is expanded.
    pub fn visible_path_of(&self, id: i64) -> Option<RowPath> {
        self.locate(id)
            .filter(|path| !self.groups[path.group].collapsed)
    }

    /// Visible content as `(group key, visible ids)` pairs.
    pub fn visible(&self) -> Vec<(GroupKey, Vec<i64>)> {
        self.groups
            .iter()
            .map(|g| (g.key.clone(), g.visible_rows().to_vec()))
            .collect()
    }

    pub(crate) fn set_collapsed(&mut self, group: usize, collapsed: bool) {
        if let Some(group) = self.groups.get_mut(group) {
            group.collapsed = collapsed;
        }
    }
}

/// Group and row counts plus row identity, in visible index space.
pub trait RowSource {
    fn group_count(&self) -> usize;
    fn group_key(&self, group: usize) -> Option<&GroupKey>;
    fn visible_row_count(&self, group: usize) -> usize;
    fn record_id_at(&self, path: RowPath) -> Option<i64>;
}

pub trait HeaderSource {
    fn group_header(&self, group: usize) -> Option<GroupHeader>;
}

pub trait EditActions {
    fn can_delete(&self, path: RowPath) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PayloadKind {
    PlainText,
    Text,
    Xml,
    Html,
    Json,
    Image,
    Url,
}

impl PayloadKind {
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            PayloadKind::PlainText
                | PayloadKind::Text
                | PayloadKind::Xml
                | PayloadKind::Html
                | PayloadKind::Json
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropProposal {
    Copy,
    Forbidden,
}

pub trait DropTarget {
    fn drop_proposal(&self, destination: Option<RowPath>, payload: &[PayloadKind]) -> DropProposal;
}

impl RowSource for ViewModel {
    fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn group_key(&self, group: usize) -> Option<&GroupKey> {
        self.groups.get(group).map(|g| &g.key)
    }

    fn visible_row_count(&self, group: usize) -> usize {
        self.groups
            .get(group)
            .map(|g| g.visible_rows().len())
            .unwrap_or(0)
    }

    fn record_id_at(&self, path: RowPath) -> Option<i64> {
        self.groups
            .get(path.group)?
            .visible_rows()
            .get(path.row)
            .copied()
    }
}

/// A record that left the result set in a batch, with its pre-batch place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedRecord {
    pub id: i64,
    pub key: GroupKey,
    pub row: usize,
}

/// One atomic set of list mutations.
///
/// Deletions, group reloads and row reloads use pre-batch indices;
/// insertions use post-batch indices. Row indices are in visible space, so a
/// collapsed group never carries row operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationBatch {
    pub deleted_groups: BTreeSet<usize>,
    pub inserted_groups: BTreeSet<usize>,
    pub reloaded_groups: BTreeSet<usize>,
    pub deleted_rows: BTreeSet<RowPath>,
    pub inserted_rows: BTreeSet<RowPath>,
    pub reloaded_rows: BTreeSet<RowPath>,
    /// Replace everything; the index sets are ignored.
    pub full_reload: bool,
    pub removed: Vec<RemovedRecord>,
}

impl OperationBatch {
    pub fn reload_all() -> Self {
        Self {
            full_reload: true,
            ..Self::default()
        }
    }

    pub fn operation_count(&self) -> usize {
        self.deleted_groups.len()
            + self.inserted_groups.len()
            + self.reloaded_groups.len()
            + self.deleted_rows.len()
            + self.inserted_rows.len()
            + self.reloaded_rows.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.full_reload && self.operation_count() == 0
    }

    pub fn removes(&self, id: i64) -> Option<&RemovedRecord> {
        self.removed.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NoteRecord;

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

    #[test]
    fn collapsed_groups_keep_rows_but_show_none() {
        let snapshot = Snapshot::build(vec![note(1, "A", 2), note(2, "B", 1)], None, 0);
        let mut collapse = GroupCollapseState::default();
        collapse.set_collapsed(&GroupKey::new("B"), true);
        let model = ViewModel::project(&snapshot, &collapse);

        assert_eq!(model.visible_row_count(0), 1);
        assert_eq!(model.visible_row_count(1), 0);
        assert_eq!(model.locate(2), Some(RowPath::new(1, 0)));
        assert_eq!(model.visible_path_of(2), None);
        assert_eq!(model.record_id_at(RowPath::new(1, 0)), None);
    }

    #[test]
    fn payload_kinds_parse_from_kebab_case() {
        assert_eq!("plain-text".parse::<PayloadKind>().ok(), Some(PayloadKind::PlainText));
        assert!(PayloadKind::Json.is_textual());
        assert!(!PayloadKind::Image.is_textual());
    }
}
