use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::config::StorageOptions;

pub mod memory;
mod schema;

pub use memory::MemoryRecordStore;

const TITLE_MAX_GRAPHEMES: usize = 64;
const UNTITLED: &str = "New note";
const NOTE_COLUMNS: &str = "id, guid, title, content, category, modified, delete_needed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRecord {
    pub id: i64,
    pub guid: String,
    pub title: String,
    pub content: String,
    /// Group key; the empty string means "uncategorized".
    pub category: String,
    /// Unix seconds.
    pub modified: i64,
    /// Soft-delete marker: set while a deletion is pending against the server.
    pub delete_needed: bool,
}

impl NoteRecord {
    /// True when anything the list shows for this record differs from `other`.
    pub fn display_differs(&self, other: &NoteRecord) -> bool {
        self.title != other.title || self.content != other.content || self.modified != other.modified
    }
}

/// Sort used for every grouped result: category ascending, then most recently
/// modified first. The id keeps ties deterministic.
pub fn group_order(a: &NoteRecord, b: &NoteRecord) -> Ordering {
    a.category
        .cmp(&b.category)
        .then_with(|| b.modified.cmp(&a.modified))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub title: Option<String>,
    pub content: String,
    pub category: String,
    pub modified: Option<i64>,
}

impl NewNote {
    pub fn new(content: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: category.into(),
            ..Self::default()
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn modified_at(mut self, modified: i64) -> Self {
        self.modified = Some(modified);
        self
    }

    fn resolved_title(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => derive_title(&self.content),
        }
    }
}

/// Anything that can hand out the live (not soft-deleted) record set.
pub trait RecordSource: Send + Sync {
    fn fetch_live_records(&self) -> Result<Vec<NoteRecord>>;
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn fetch_note_by_id(&self, note_id: i64) -> Result<Option<NoteRecord>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1");
            let record = conn
                .query_row(&sql, params![note_id], map_note)
                .optional()
                .with_context(|| format!("fetching note {note_id}"))?;
            Ok(record)
        })
    }

    pub fn create_note(&self, note: NewNote) -> Result<NoteRecord> {
        let title = note.resolved_title();
        let category = note.category.trim().to_string();
        let modified = note
            .modified
            .unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp());
        let guid = Uuid::new_v4().to_string();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO notes (guid, title, content, category, modified, delete_needed)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![guid, title, note.content, category, modified],
            )
            .context("inserting note")?;
            Ok(NoteRecord {
                id: conn.last_insert_rowid(),
                guid,
                title,
                content: note.content,
                category,
                modified,
                delete_needed: false,
            })
        })
    }

    pub fn update_content(&self, note_id: i64, content: &str) -> Result<()> {
        let title = derive_title(content);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE notes SET content = ?1, title = ?2, modified = ?3
                     WHERE id = ?4 AND delete_needed = 0",
                    params![content, title, now, note_id],
                )
                .context("updating note content")?;
            if updated == 0 {
                bail!("note {note_id} not found");
            }
            Ok(())
        })
    }

    pub fn set_category(&self, note_id: i64, category: &str) -> Result<()> {
        let category = category.trim();
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE notes SET category = ?1 WHERE id = ?2 AND delete_needed = 0",
                    params![category, note_id],
                )
                .context("updating note category")?;
            if updated == 0 {
                bail!("note {note_id} not found");
            }
            Ok(())
        })
    }

    /// Flags a note for deletion; it leaves every live query immediately.
    pub fn mark_deleted(&self, note_id: i64) -> Result<()> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE notes SET delete_needed = 1 WHERE id = ?1 AND delete_needed = 0",
                    params![note_id],
                )
                .context("marking note for deletion")?;
            if updated == 0 {
                bail!("note {note_id} not found");
            }
            Ok(())
        })
    }

    pub fn purge_note(&self, note_id: i64) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM notes WHERE id = ?1", params![note_id])
                .context("purging note")?;
            Ok(())
        })
    }

    pub fn purge_deleted(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let count = conn
                .execute("DELETE FROM notes WHERE delete_needed = 1", [])
                .context("purging notes pending deletion")?;
            Ok(count)
        })
    }

    pub fn count_live(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM notes WHERE delete_needed = 0",
                    [],
                    |row| row.get(0),
                )
                .context("counting notes")?;
            Ok(count as usize)
        })
    }

    pub fn read_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .with_context(|| format!("reading setting {key}"))?;
            Ok(value)
        })
    }

    pub fn write_setting(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("writing setting {key}"))?;
            Ok(())
        })
    }

    /// Inserts a few starter notes when the store holds nothing yet.
    pub fn seed_first_run(&self) -> Result<usize> {
        if self.count_live()? > 0 {
            return Ok(0);
        }
        tracing::info!("seeding first-run notes");
        let notes = [
            NewNote::new(
                "Welcome to Notes Browser\n\nNotes are grouped by category. Press space on a header to collapse it.",
                "",
            ),
            NewNote::new("Keyboard Shortcuts\n\nj/k move, space toggles, d deletes, / searches, r refreshes, q quits.", "Help"),
            NewNote::new("Inbox\n\nCapture quick thoughts here.", "Personal"),
        ];
        let count = notes.len();
        for note in notes {
            self.create_note(note)?;
        }
        Ok(count)
    }
}

impl RecordSource for StorageHandle {
    fn fetch_live_records(&self) -> Result<Vec<NoteRecord>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {NOTE_COLUMNS}
                 FROM notes
                 WHERE delete_needed = 0
                 ORDER BY category ASC, modified DESC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([], map_note)?
                .collect::<Result<Vec<_>, _>>()
                .context("querying live notes")?;
            Ok(records)
        })
    }
}

fn map_note(row: &Row<'_>) -> rusqlite::Result<NoteRecord> {
    Ok(NoteRecord {
        id: row.get(0)?,
        guid: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        category: row.get(4)?,
        modified: row.get(5)?,
        delete_needed: row.get::<_, i64>(6)? != 0,
    })
}

/// First non-blank line of the content, clipped to a readable length.
pub fn derive_title(content: &str) -> String {
    let Some(line) = content.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return UNTITLED.to_string();
    };
    let mut graphemes = line.graphemes(true);
    let mut title: String = graphemes.by_ref().take(TITLE_MAX_GRAPHEMES).collect();
    if graphemes.next().is_some() {
        title.push('…');
    }
    title
}

pub fn init(options: &StorageOptions) -> Result<StorageHandle> {
    let db_path = &options.database_path;
    if db_path.as_os_str().is_empty() {
        bail!("storage database path is not configured");
    }
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, options)?;
    schema::apply(&conn)?;
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(options.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}
