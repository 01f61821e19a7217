use std::fmt::Write as _;
use std::io::{self, Read};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use time::OffsetDateTime;

use crate::app::App;
use crate::config::AppConfig;
use crate::groups::{load_or_default, GroupKey, GroupStateStore, SqliteGroupStateStore};
use crate::query::Snapshot;
use crate::search::SearchFilter;
use crate::service::{LocalNotesService, NotesService};
use crate::storage::{RecordSource, StorageHandle};
use crate::ui::header_label;
use crate::view::{HeaderSource, Projector, RowDisplay, RowPath, RowSource};

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Only show notes matching this search text (prefix with `re:` for a pattern)
    #[arg(long)]
    pub search: Option<String>,
    /// Print the rows of collapsed groups too
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NewArgs {
    /// Note content. The first line becomes the title. Read from stdin if omitted.
    #[arg()]
    pub content: Option<String>,
    /// Category to file the note under
    #[arg(long, default_value = "")]
    pub category: String,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Note identifier
    pub note_id: i64,
}

#[derive(Args, Debug, Clone)]
pub struct MoveArgs {
    /// Note identifier
    pub note_id: i64,
    /// New category; an empty string files the note as uncategorized
    pub category: String,
}

#[derive(Args, Debug, Clone)]
pub struct ToggleArgs {
    /// Category whose group should be collapsed or expanded
    #[arg(default_value = "")]
    pub category: String,
}

pub fn run_tui(app: &mut App) -> Result<()> {
    app.run()
}

pub fn list_notes(config: Arc<AppConfig>, storage: StorageHandle, args: ListArgs) -> Result<()> {
    let filter = args
        .search
        .as_deref()
        .and_then(|text| SearchFilter::parse(text, &config.search));
    if let Some(reason) = filter.as_ref().and_then(SearchFilter::error) {
        bail!("invalid search pattern: {reason}");
    }
    let records = storage.fetch_live_records()?;
    let snapshot = Snapshot::build(records, filter.as_ref(), 0);

    let mut projector = Projector::new(
        Box::new(SqliteGroupStateStore::new(storage)),
        config.browser.no_category_label.clone(),
    );
    projector.reload(Arc::new(snapshot));

    let listing = render_listing(&projector, args.all, OffsetDateTime::now_utc());
    if listing.is_empty() {
        println!("No notes found.");
    } else {
        print!("{listing}");
    }
    Ok(())
}

/// Plain-text rendering of the grouped list, one header per group followed
/// by its rows. Rows of collapsed groups only appear with `include_collapsed`.
pub fn render_listing(projector: &Projector, include_collapsed: bool, now: OffsetDateTime) -> String {
    let mut out = String::new();
    for group in 0..projector.group_count() {
        let Some(header) = projector.group_header(group) else {
            continue;
        };
        let _ = writeln!(out, "{}", header_label(&header));

        let ids: Vec<i64> = if include_collapsed {
            projector
                .snapshot()
                .group(&header.key)
                .map(|g| g.records.iter().map(|r| r.id).collect())
                .unwrap_or_default()
        } else {
            (0..projector.visible_row_count(group))
                .filter_map(|row| projector.record_id_at(RowPath::new(group, row)))
                .collect()
        };
        for id in ids {
            if let Some(record) = projector.record_by_id(id) {
                let display = RowDisplay::bind(record, now);
                let _ = writeln!(
                    out,
                    "  {:>5}  {}  ({})",
                    record.id, display.title, display.formatted_relative_date
                );
            }
        }
    }
    out
}

pub fn new_note(config: Arc<AppConfig>, storage: StorageHandle, args: NewArgs) -> Result<()> {
    let content = match args.content {
        Some(content) => content,
        None => read_stdin()?,
    };
    if content.trim().is_empty() {
        bail!("note content is empty");
    }
    let service = LocalNotesService::new(storage, config.sync.online);
    let record = service
        .add(&content, &args.category)?
        .context("note was not created")?;
    println!("Created note {} ({})", record.id, record.title);
    Ok(())
}

pub fn delete_note(config: Arc<AppConfig>, storage: StorageHandle, args: DeleteArgs) -> Result<()> {
    if storage.fetch_note_by_id(args.note_id)?.is_none() {
        bail!("note {} not found", args.note_id);
    }
    let service = LocalNotesService::new(storage, config.sync.online);
    service.delete(args.note_id)?;
    if service.is_online() {
        println!("Deleted note {}", args.note_id);
    } else {
        println!("Marked note {} for deletion (offline)", args.note_id);
    }
    Ok(())
}

pub fn move_note(config: Arc<AppConfig>, storage: StorageHandle, args: MoveArgs) -> Result<()> {
    if storage.fetch_note_by_id(args.note_id)?.is_none() {
        bail!("note {} not found", args.note_id);
    }
    let service = LocalNotesService::new(storage, config.sync.online);
    let category = args.category.trim();
    service.set_category(args.note_id, category)?;
    let label = GroupKey::new(category)
        .display_title(&config.browser.no_category_label)
        .to_string();
    println!("Moved note {} to {label}", args.note_id);
    Ok(())
}

pub fn toggle_group(config: Arc<AppConfig>, storage: StorageHandle, args: ToggleArgs) -> Result<()> {
    let key = GroupKey::new(args.category.trim());
    let store = SqliteGroupStateStore::new(storage.clone());
    let collapsed = toggle_stored_group(&store, &storage, &key)?;
    let label = key.display_title(&config.browser.no_category_label);
    println!(
        "{label} is now {}",
        if collapsed { "collapsed" } else { "expanded" }
    );
    Ok(())
}

/// Flips one group's stored flag. Only groups that currently hold live
/// records can be toggled.
fn toggle_stored_group(
    store: &dyn GroupStateStore,
    source: &dyn RecordSource,
    key: &GroupKey,
) -> Result<bool> {
    let snapshot = Snapshot::build(source.fetch_live_records()?, None, 0);
    if snapshot.group(key).is_none() {
        bail!("no group named {key:?}");
    }
    let mut state = load_or_default(store);
    state.reconcile(snapshot.group_keys());
    let collapsed = state.toggle(key);
    store.save(&state).context("saving group state")?;
    Ok(collapsed)
}

pub fn list_groups(config: Arc<AppConfig>, storage: StorageHandle) -> Result<()> {
    let store = SqliteGroupStateStore::new(storage);
    let state = store.load().context("loading group state")?;
    if state.is_empty() {
        println!("No group state stored yet.");
        return Ok(());
    }
    for entry in state.to_entries() {
        let key = GroupKey::new(entry.title);
        println!(
            "{:<10} {}",
            if entry.collapsed { "collapsed" } else { "expanded" },
            key.display_title(&config.browser.no_category_label)
        );
    }
    Ok(())
}

pub fn sync_notes(config: Arc<AppConfig>, storage: StorageHandle) -> Result<()> {
    let service = LocalNotesService::new(storage, config.sync.online);
    let summary = service.sync()?;
    println!(
        "Sync finished: {} purged, {} live notes",
        summary.purged, summary.live
    );
    Ok(())
}

fn read_stdin() -> Result<String> {
    if atty::is(atty::Stream::Stdin) {
        bail!("no content given; pass it as an argument or pipe it on stdin");
    }
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("reading note content from stdin")?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::MemoryGroupStateStore;
    use crate::storage::tests::init_storage;
    use crate::storage::NewNote;
    use time::macros::datetime;

    #[test]
    fn listing_hides_rows_of_collapsed_groups() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let now = datetime!(2024-03-15 12:00 UTC);
        let ts = now.unix_timestamp();
        storage.create_note(NewNote::new("Plan\nq3", "Work").modified_at(ts))?;
        storage.create_note(NewNote::new("Groceries", "Home").modified_at(ts - 86_400))?;

        let store = SqliteGroupStateStore::new(storage.clone());
        toggle_stored_group(&store, &storage, &GroupKey::new("Work"))?;

        let mut projector = Projector::new(Box::new(store), "Uncategorized");
        projector.reload(Arc::new(Snapshot::build(storage.fetch_live_records()?, None, 0)));
        insta::assert_snapshot!(render_listing(&projector, false, now), @r###"
        ▾ Home (1)
              2  Groceries  (Yesterday)
        ▸ Work (1)
        "###);
        let all = render_listing(&projector, true, now);
        assert!(all.contains("Plan  (Today)"));
        Ok(())
    }

    #[test]
    fn toggling_an_unknown_group_is_rejected() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.create_note(NewNote::new("a", "Work"))?;
        let store = MemoryGroupStateStore::new();
        assert!(toggle_stored_group(&store, &storage, &GroupKey::new("Nope")).is_err());
        assert_eq!(store.save_count(), 0);

        assert!(toggle_stored_group(&store, &storage, &GroupKey::new("Work"))?);
        assert!(!toggle_stored_group(&store, &storage, &GroupKey::new("Work"))?);
        assert_eq!(store.save_count(), 2);
        Ok(())
    }
}
