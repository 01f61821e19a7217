//! Plain in-memory list that follows [`ListPresenter`] calls with the same
//! index rules a UI list widget uses. The TUI keeps one as its rendered
//! model; tests replay batches into one and compare it with the snapshot.

use std::collections::BTreeSet;

use super::{ListPresenter, RowPath, RowSource};
use crate::groups::GroupKey;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    /// `None` until an inserted group is resolved.
    key: Option<GroupKey>,
    /// `None` for inserted or reloaded groups; a `None` row is an inserted
    /// row waiting for its record id.
    rows: Option<Vec<Option<i64>>>,
}

#[derive(Debug, Clone, Default)]
struct Staged {
    deleted_groups: BTreeSet<usize>,
    inserted_groups: BTreeSet<usize>,
    reloaded_groups: BTreeSet<usize>,
    deleted_rows: BTreeSet<RowPath>,
    inserted_rows: BTreeSet<RowPath>,
    reloaded_rows: BTreeSet<RowPath>,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceList {
    groups: Vec<Slot>,
    staged: Option<Staged>,
    full_reload: bool,
    violations: Vec<String>,
}

impl ReferenceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the visible content of `source` as the starting state.
    pub fn from_source(source: &dyn RowSource) -> Self {
        let mut list = Self::default();
        list.rebuild(source);
        list
    }

    /// Index errors seen so far, in the order they happened.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    #[cfg(test)]
    pub fn needs_resolve(&self) -> bool {
        self.full_reload
            || self.groups.iter().any(|slot| {
                slot.key.is_none()
                    || slot
                        .rows
                        .as_ref()
                        .map_or(true, |rows| rows.iter().any(Option::is_none))
            })
    }

    /// Fills every placeholder left by inserts and reloads from `source`.
    pub fn resolve(&mut self, source: &dyn RowSource) {
        if self.full_reload {
            self.rebuild(source);
            return;
        }
        for (gi, slot) in self.groups.iter_mut().enumerate() {
            if slot.key.is_none() {
                match source.group_key(gi) {
                    Some(key) => slot.key = Some(key.clone()),
                    None => self
                        .violations
                        .push(format!("inserted group {gi} has no counterpart")),
                }
            }
            match slot.rows.as_mut() {
                None => {
                    slot.rows = Some(
                        (0..source.visible_row_count(gi))
                            .map(|ri| source.record_id_at(RowPath::new(gi, ri)))
                            .collect(),
                    );
                }
                Some(rows) => {
                    for (ri, row) in rows.iter_mut().enumerate() {
                        if row.is_none() {
                            *row = source.record_id_at(RowPath::new(gi, ri));
                            if row.is_none() {
                                self.violations
                                    .push(format!("inserted row {gi}/{ri} has no counterpart"));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Resolved content as `(group key, visible ids)` pairs.
    pub fn content(&self) -> Vec<(GroupKey, Vec<i64>)> {
        self.groups
            .iter()
            .map(|slot| {
                (
                    slot.key.clone().unwrap_or_default(),
                    slot.rows
                        .iter()
                        .flatten()
                        .filter_map(|row| *row)
                        .collect(),
                )
            })
            .collect()
    }

    /// Resolves a copy against `source` and checks it matches exactly.
    pub fn verify(&self, source: &dyn RowSource) -> Result<(), String> {
        let mut resolved = self.clone();
        resolved.resolve(source);
        if !resolved.violations.is_empty() {
            return Err(resolved.violations.join("; "));
        }
        let expected = visible_content(source);
        let actual = resolved.content();
        if expected != actual {
            return Err(format!("expected {expected:?}, rendered {actual:?}"));
        }
        Ok(())
    }

    fn rebuild(&mut self, source: &dyn RowSource) {
        self.full_reload = false;
        self.groups = visible_content(source)
            .into_iter()
            .map(|(key, rows)| Slot {
                key: Some(key),
                rows: Some(rows.into_iter().map(Some).collect()),
            })
            .collect();
    }

    fn staged(&mut self) -> &mut Staged {
        self.staged.get_or_insert_with(Staged::default)
    }

    /// Runs `op` as a batch of its own when no batch is open.
    fn with_batch(&mut self, op: impl FnOnce(&mut Staged)) {
        let implicit = self.staged.is_none();
        op(self.staged());
        if implicit {
            self.end_updates();
        }
    }

    fn commit(&mut self, staged: Staged) {
        let pre_groups = self.groups.len();
        for &group in staged.deleted_groups.iter().chain(&staged.reloaded_groups) {
            if group >= pre_groups {
                self.violations
                    .push(format!("group {group} out of bounds ({pre_groups} groups)"));
            }
        }
        let deleted_rows =
            rows_in_bounds(&self.groups, &staged.deleted_rows, "deleted", &mut self.violations);
        // Reloaded rows keep their record; only their bounds matter here.
        rows_in_bounds(&self.groups, &staged.reloaded_rows, "reloaded", &mut self.violations);

        for &group in &staged.reloaded_groups {
            if let Some(slot) = self.groups.get_mut(group) {
                slot.rows = None;
            }
        }

        for path in deleted_rows.iter().rev() {
            if staged.deleted_groups.contains(&path.group) {
                continue;
            }
            if let Some(Slot { rows: Some(rows), .. }) = self.groups.get_mut(path.group) {
                rows.remove(path.row);
            }
        }
        for &group in staged.deleted_groups.iter().rev() {
            if group < self.groups.len() {
                self.groups.remove(group);
            }
        }

        for &group in &staged.inserted_groups {
            if group > self.groups.len() {
                self.violations.push(format!(
                    "inserted group {group} out of bounds ({} groups)",
                    self.groups.len()
                ));
                continue;
            }
            self.groups.insert(group, Slot { key: None, rows: None });
        }
        for path in &staged.inserted_rows {
            match self.groups.get_mut(path.group) {
                Some(Slot { rows: Some(rows), .. }) if path.row <= rows.len() => {
                    rows.insert(path.row, None);
                }
                Some(Slot { rows: None, .. }) => {}
                _ => self.violations.push(format!(
                    "inserted row {}/{} out of bounds",
                    path.group, path.row
                )),
            }
        }
    }
}

fn rows_in_bounds(
    groups: &[Slot],
    paths: &BTreeSet<RowPath>,
    kind: &str,
    violations: &mut Vec<String>,
) -> Vec<RowPath> {
    let mut valid = Vec::with_capacity(paths.len());
    for path in paths {
        let ok = match groups.get(path.group) {
            Some(Slot { rows: Some(rows), .. }) => path.row < rows.len(),
            Some(Slot { rows: None, .. }) => true,
            None => false,
        };
        if ok {
            valid.push(*path);
        } else {
            violations.push(format!("{kind} row {}/{} out of bounds", path.group, path.row));
        }
    }
    valid
}

fn visible_content(source: &dyn RowSource) -> Vec<(GroupKey, Vec<i64>)> {
    (0..source.group_count())
        .map(|gi| {
            let key = source.group_key(gi).cloned().unwrap_or_default();
            let rows = (0..source.visible_row_count(gi))
                .filter_map(|ri| source.record_id_at(RowPath::new(gi, ri)))
                .collect();
            (key, rows)
        })
        .collect()
}

impl ListPresenter for ReferenceList {
    fn begin_updates(&mut self) {
        self.staged();
    }

    fn delete_groups(&mut self, groups: &[usize]) {
        self.with_batch(|staged| staged.deleted_groups.extend(groups));
    }

    fn insert_groups(&mut self, groups: &[usize]) {
        self.with_batch(|staged| staged.inserted_groups.extend(groups));
    }

    fn reload_groups(&mut self, groups: &[usize]) {
        self.with_batch(|staged| staged.reloaded_groups.extend(groups));
    }

    fn delete_rows(&mut self, rows: &[RowPath]) {
        self.with_batch(|staged| staged.deleted_rows.extend(rows));
    }

    fn insert_rows(&mut self, rows: &[RowPath]) {
        self.with_batch(|staged| staged.inserted_rows.extend(rows));
    }

    fn reload_rows(&mut self, rows: &[RowPath]) {
        self.with_batch(|staged| staged.reloaded_rows.extend(rows));
    }

    fn end_updates(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.commit(staged);
        }
    }

    fn reload_all(&mut self) {
        self.staged = None;
        self.groups.clear();
        self.full_reload = true;
    }

    fn rebind(&mut self, source: &dyn RowSource) {
        self.resolve(source);
    }
}
