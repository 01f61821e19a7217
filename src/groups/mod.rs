use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageHandle;

/// Settings key the collapse flags live under.
pub const COLLAPSE_STATE_KEY: &str = "group_collapse_state";

/// Category value records are grouped by. The empty key is "uncategorized".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn uncategorized() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_uncategorized(&self) -> bool {
        self.0.is_empty()
    }

    pub fn display_title<'a>(&'a self, no_category_label: &'a str) -> &'a str {
        if self.is_uncategorized() {
            no_category_label
        } else {
            &self.0
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Persisted layout of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCollapse {
    pub title: String,
    pub collapsed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<GroupKey>,
    pub pruned: Vec<GroupKey>,
}

impl ReconcileReport {
    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.pruned.is_empty()
    }
}

/// Collapsed flag per group, unique by key. Order is kept only so the
/// persisted list stays stable between saves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupCollapseState {
    entries: IndexMap<GroupKey, bool>,
}

impl GroupCollapseState {
    pub fn from_entries(entries: Vec<GroupCollapse>) -> Self {
        let mut map = IndexMap::with_capacity(entries.len());
        for entry in entries {
            map.entry(GroupKey::new(entry.title))
                .or_insert(entry.collapsed);
        }
        Self { entries: map }
    }

    pub fn to_entries(&self) -> Vec<GroupCollapse> {
        self.entries
            .iter()
            .map(|(key, collapsed)| GroupCollapse {
                title: key.as_str().to_string(),
                collapsed: *collapsed,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Unknown groups read as expanded.
    pub fn is_collapsed(&self, key: &GroupKey) -> bool {
        self.entries.get(key).copied().unwrap_or(false)
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.entries.keys()
    }

    pub fn set_collapsed(&mut self, key: &GroupKey, collapsed: bool) {
        match self.entries.get_mut(key) {
            Some(flag) => *flag = collapsed,
            None => {
                self.entries.insert(key.clone(), collapsed);
            }
        }
    }

    /// Flips the flag and returns the new value.
    pub fn toggle(&mut self, key: &GroupKey) -> bool {
        let collapsed = !self.is_collapsed(key);
        self.set_collapsed(key, collapsed);
        collapsed
    }

    /// Converges the tracked keys onto `observed`: stale entries are pruned,
    /// new ones start expanded.
    pub fn reconcile<'a, I>(&mut self, observed: I) -> ReconcileReport
    where
        I: IntoIterator<Item = &'a GroupKey>,
    {
        let observed: Vec<&GroupKey> = observed.into_iter().collect();
        let mut report = ReconcileReport::default();
        self.entries.retain(|key, _| {
            let keep = observed.contains(&key);
            if !keep {
                report.pruned.push(key.clone());
            }
            keep
        });
        for key in observed {
            if !self.entries.contains_key(key) {
                self.entries.insert(key.clone(), false);
                report.added.push(key.clone());
            }
        }
        report
    }
}

#[derive(Debug, Error)]
pub enum GroupStateError {
    #[error("loading group state: {0}")]
    Load(#[source] anyhow::Error),
    #[error("saving group state: {0}")]
    Save(#[source] anyhow::Error),
    #[error("stored group state is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable home for the collapse flags. Last write wins.
pub trait GroupStateStore: Send {
    fn load(&self) -> Result<GroupCollapseState, GroupStateError>;
    fn save(&self, state: &GroupCollapseState) -> Result<(), GroupStateError>;
}

fn encode(state: &GroupCollapseState) -> Result<String, GroupStateError> {
    Ok(serde_json::to_string(&state.to_entries())?)
}

fn decode(raw: &str) -> Result<GroupCollapseState, GroupStateError> {
    let entries: Vec<GroupCollapse> = serde_json::from_str(raw)?;
    Ok(GroupCollapseState::from_entries(entries))
}

/// Loads the flags, falling back to an empty state when the store fails.
pub fn load_or_default(store: &dyn GroupStateStore) -> GroupCollapseState {
    match store.load() {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(?err, "group state unavailable, starting with defaults");
            GroupCollapseState::default()
        }
    }
}

/// Keeps the flags in the record store's settings table.
#[derive(Clone)]
pub struct SqliteGroupStateStore {
    storage: StorageHandle,
}

impl SqliteGroupStateStore {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }
}

impl GroupStateStore for SqliteGroupStateStore {
    fn load(&self) -> Result<GroupCollapseState, GroupStateError> {
        let raw = self
            .storage
            .read_setting(COLLAPSE_STATE_KEY)
            .map_err(GroupStateError::Load)?;
        match raw {
            Some(raw) => decode(&raw),
            None => Ok(GroupCollapseState::default()),
        }
    }

    fn save(&self, state: &GroupCollapseState) -> Result<(), GroupStateError> {
        let raw = encode(state)?;
        self.storage
            .write_setting(COLLAPSE_STATE_KEY, &raw)
            .map_err(GroupStateError::Save)
    }
}

/// In-process store; clones share the saved value.
#[derive(Clone, Default)]
pub struct MemoryGroupStateStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    raw: Option<String>,
    fail: bool,
    saves: usize,
}

impl MemoryGroupStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<GroupCollapse>) -> Self {
        let store = Self::default();
        store.inner.lock().raw = serde_json::to_string(&entries).ok();
        store
    }

    pub fn set_failing(&self, fail: bool) {
        self.inner.lock().fail = fail;
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().saves
    }

    pub fn saved_entries(&self) -> Vec<GroupCollapse> {
        self.inner
            .lock()
            .raw
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

impl GroupStateStore for MemoryGroupStateStore {
    fn load(&self) -> Result<GroupCollapseState, GroupStateError> {
        let inner = self.inner.lock();
        if inner.fail {
            return Err(GroupStateError::Load(anyhow::anyhow!(
                "group state store unavailable"
            )));
        }
        match inner.raw.as_deref() {
            Some(raw) => decode(raw),
            None => Ok(GroupCollapseState::default()),
        }
    }

    fn save(&self, state: &GroupCollapseState) -> Result<(), GroupStateError> {
        let raw = encode(state)?;
        let mut inner = self.inner.lock();
        if inner.fail {
            return Err(GroupStateError::Save(anyhow::anyhow!(
                "group state store unavailable"
            )));
        }
        inner.raw = Some(raw);
        inner.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::init_storage;
    use assert_matches::assert_matches;

    fn key(value: &str) -> GroupKey {
        GroupKey::new(value)
    }

    #[test]
    fn reconcile_prunes_stale_and_adds_new_expanded() {
        let mut state = GroupCollapseState::from_entries(vec![
            GroupCollapse {
                title: "Work".into(),
                collapsed: true,
            },
            GroupCollapse {
                title: "Gone".into(),
                collapsed: true,
            },
        ]);
        let observed = [key("Home"), key("Work")];
        let report = state.reconcile(observed.iter());

        assert_eq!(report.pruned, vec![key("Gone")]);
        assert_eq!(report.added, vec![key("Home")]);
        assert!(state.is_collapsed(&key("Work")));
        assert!(!state.is_collapsed(&key("Home")));
        assert_eq!(state.len(), 2);

        let again = state.reconcile(observed.iter());
        assert!(!again.is_changed());
    }

    #[test]
    fn duplicate_entries_keep_the_first_flag() {
        let state = GroupCollapseState::from_entries(vec![
            GroupCollapse {
                title: "A".into(),
                collapsed: true,
            },
            GroupCollapse {
                title: "A".into(),
                collapsed: false,
            },
        ]);
        assert_eq!(state.len(), 1);
        assert!(state.is_collapsed(&key("A")));
    }

    #[test]
    fn toggle_twice_is_identity() {
        let mut state = GroupCollapseState::default();
        state.reconcile([key("A")].iter());
        let before = state.clone();
        assert!(state.toggle(&key("A")));
        assert!(!state.toggle(&key("A")));
        assert_eq!(state, before);
    }

    #[test]
    fn persisted_layout_is_a_plain_title_collapsed_list() -> anyhow::Result<()> {
        let mut state = GroupCollapseState::default();
        state.reconcile([key(""), key("Work")].iter());
        state.toggle(&key("Work"));
        let raw = encode(&state)?;
        assert_eq!(
            raw,
            r#"[{"title":"","collapsed":false},{"title":"Work","collapsed":true}]"#
        );
        Ok(())
    }

    #[test]
    fn sqlite_store_round_trips_and_reports_corruption() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let store = SqliteGroupStateStore::new(storage.clone());
        assert!(store.load()?.is_empty());

        let mut state = GroupCollapseState::default();
        state.set_collapsed(&key("Home"), true);
        store.save(&state)?;
        assert_eq!(store.load()?, state);

        storage.write_setting(COLLAPSE_STATE_KEY, "{not json")?;
        assert_matches!(store.load(), Err(GroupStateError::Corrupt(_)));
        assert!(load_or_default(&store).is_empty());
        Ok(())
    }

    #[test]
    fn memory_store_failure_falls_back_to_defaults() {
        let store = MemoryGroupStateStore::with_entries(vec![GroupCollapse {
            title: "Work".into(),
            collapsed: true,
        }]);
        assert!(load_or_default(&store).is_collapsed(&key("Work")));

        store.set_failing(true);
        assert!(load_or_default(&store).is_empty());
        assert_matches!(
            store.save(&GroupCollapseState::default()),
            Err(GroupStateError::Save(_))
        );
    }
}
