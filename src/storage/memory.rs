use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;

use super::{group_order, derive_title, NewNote, NoteRecord, RecordSource};

/// Record store kept entirely in memory. Clones share the same records, so a
/// test can mutate the store while a controller reads from its own handle.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    records: Vec<NoteRecord>,
    next_id: i64,
    fail_reads: bool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, note: NewNote) -> NoteRecord {
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let record = NoteRecord {
            id: inner.next_id,
            guid: format!("mem-{}", inner.next_id),
            title: note.resolved_title(),
            content: note.content,
            category: note.category.trim().to_string(),
            modified: note.modified.unwrap_or(inner.next_id),
            delete_needed: false,
        };
        inner.records.push(record.clone());
        record
    }

    pub fn get(&self, id: i64) -> Option<NoteRecord> {
        self.inner.read().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn remove(&self, id: i64) -> Result<NoteRecord> {
        let mut inner = self.inner.write();
        let Some(pos) = inner.records.iter().position(|r| r.id == id) else {
            bail!("note {id} not found");
        };
        Ok(inner.records.remove(pos))
    }

    pub fn mark_deleted(&self, id: i64) -> Result<()> {
        self.modify(id, |record| record.delete_needed = true)
    }

    pub fn set_category(&self, id: i64, category: &str) -> Result<()> {
        let category = category.trim().to_string();
        self.modify(id, move |record| record.category = category)
    }

    pub fn touch(&self, id: i64, content: &str, modified: i64) -> Result<()> {
        let content = content.to_string();
        self.modify(id, move |record| {
            record.title = derive_title(&content);
            record.content = content;
            record.modified = modified;
        })
    }

    /// Makes every subsequent fetch fail until cleared again.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.write().fail_reads = fail;
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| !r.delete_needed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn modify<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut NoteRecord),
    {
        let mut inner = self.inner.write();
        match inner
            .records
            .iter_mut()
            .find(|r| r.id == id && !r.delete_needed)
        {
            Some(record) => {
                f(record);
                Ok(())
            }
            None => bail!("note {id} not found"),
        }
    }
}

impl RecordSource for MemoryRecordStore {
    fn fetch_live_records(&self) -> Result<Vec<NoteRecord>> {
        let inner = self.inner.read();
        if inner.fail_reads {
            bail!("record store unavailable");
        }
        let mut records: Vec<_> = inner
            .records
            .iter()
            .filter(|r| !r.delete_needed)
            .cloned()
            .collect();
        records.sort_by(group_order);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_records() -> anyhow::Result<()> {
        let store = MemoryRecordStore::new();
        let reader = store.clone();
        let note = store.insert(NewNote::new("alpha", "Work").modified_at(10));
        assert_eq!(reader.fetch_live_records()?.len(), 1);

        store.mark_deleted(note.id)?;
        assert!(reader.fetch_live_records()?.is_empty());
        assert!(store.set_category(note.id, "Home").is_err());
        Ok(())
    }

    #[test]
    fn failing_reads_surface_as_errors() {
        let store = MemoryRecordStore::new();
        store.set_fail_reads(true);
        assert!(store.fetch_live_records().is_err());
        store.set_fail_reads(false);
        assert!(store.fetch_live_records().is_ok());
    }
}
