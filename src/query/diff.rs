use std::collections::HashSet;

use super::{Delta, RowPath, Snapshot};
use crate::groups::GroupKey;

/// Computes the deltas leading from `old` to `new`.
///
/// Deltas come out in dependency order: plain deletions, group appearances,
/// moves, group disappearances, insertions, then updates. A group therefore
/// appears before anything lands in it and disappears only after its last
/// row has left.
///
/// Rows that stay in the same group keep their relative order unless they
/// are reported as moves; the kept set is the longest run of rows whose new
/// positions are already increasing.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<Delta> {
    let old_pos = old.positions();
    let new_pos = new.positions();

    let old_keys: HashSet<&GroupKey> = old.group_keys().collect();
    let new_keys: HashSet<&GroupKey> = new.group_keys().collect();

    let mut deleted = Vec::new();
    let mut appeared = Vec::new();
    let mut moved = Vec::new();
    let mut disappeared = Vec::new();
    let mut inserted = Vec::new();
    let mut updated = Vec::new();

    for (gi, group) in old.groups().iter().enumerate() {
        if !new_keys.contains(&group.key) {
            disappeared.push(Delta::GroupDisappeared {
                key: group.key.clone(),
                index: gi,
            });
        }

        let mut staying: Vec<(usize, usize)> = Vec::new();
        for (ri, record) in group.records.iter().enumerate() {
            let from_path = RowPath::new(gi, ri);
            match new_pos.get(&record.id) {
                None => deleted.push(Delta::RowDeleted {
                    key: group.key.clone(),
                    record: record.clone(),
                    at: from_path,
                }),
                Some(to_path) => {
                    let to_group = &new.groups()[to_path.group];
                    if to_group.key != group.key {
                        moved.push(Delta::RowMoved {
                            from: group.key.clone(),
                            to: to_group.key.clone(),
                            record: to_group.records[to_path.row].clone(),
                            from_path,
                            to_path: *to_path,
                        });
                    } else {
                        staying.push((ri, to_path.row));
                    }
                }
            }
        }

        let Some(new_gi) = new.group_index(&group.key) else {
            continue;
        };
        let kept = longest_increasing(&staying);
        for (idx, (ri, new_ri)) in staying.iter().copied().enumerate() {
            let before = &group.records[ri];
            let after = &new.groups()[new_gi].records[new_ri];
            let from_path = RowPath::new(gi, ri);
            let to_path = RowPath::new(new_gi, new_ri);
            if kept.contains(&idx) {
                if before.display_differs(after) {
                    updated.push(Delta::RowUpdated {
                        key: group.key.clone(),
                        record: after.clone(),
                        at: from_path,
                    });
                }
            } else {
                moved.push(Delta::RowMoved {
                    from: group.key.clone(),
                    to: group.key.clone(),
                    record: after.clone(),
                    from_path,
                    to_path,
                });
            }
        }
    }

    for (gi, group) in new.groups().iter().enumerate() {
        if !old_keys.contains(&group.key) {
            appeared.push(Delta::GroupAppeared {
                key: group.key.clone(),
                index: gi,
            });
        }
        for (ri, record) in group.records.iter().enumerate() {
            if !old_pos.contains_key(&record.id) {
                inserted.push(Delta::RowInserted {
                    key: group.key.clone(),
                    record: record.clone(),
                    at: RowPath::new(gi, ri),
                });
            }
        }
    }

    let mut deltas = Vec::with_capacity(
        deleted.len() + appeared.len() + moved.len() + disappeared.len() + inserted.len() + updated.len(),
    );
    deltas.extend(deleted);
    deltas.extend(appeared);
    deltas.extend(moved);
    deltas.extend(disappeared);
    deltas.extend(inserted);
    deltas.extend(updated);
    deltas
}

/// Indices into `pairs` forming the longest strictly increasing run of the
/// second component. `pairs` is already ordered by the first component.
fn longest_increasing(pairs: &[(usize, usize)]) -> HashSet<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut parent: Vec<Option<usize>> = vec![None; pairs.len()];
    for (idx, &(_, value)) in pairs.iter().enumerate() {
        let slot = tails.partition_point(|&tail| pairs[tail].1 < value);
        if slot > 0 {
            parent[idx] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(idx);
        } else {
            tails[slot] = idx;
        }
    }

    let mut kept = HashSet::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(idx) = cursor {
        kept.insert(idx);
        cursor = parent[idx];
    }
    kept
}
