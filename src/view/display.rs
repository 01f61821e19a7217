use once_cell::sync::Lazy;
use time::format_description::{self, FormatItem};
use time::OffsetDateTime;

use crate::groups::GroupKey;
use crate::storage::NoteRecord;

static SHORT_DATE: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[month]/[day]/[year repr:last_two]").unwrap_or_default()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHeader {
    pub index: usize,
    pub key: GroupKey,
    pub display_title: String,
    pub collapsed: bool,
    /// Records in the group, shown or not.
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDisplay {
    pub title: String,
    pub formatted_relative_date: String,
}

impl RowDisplay {
    pub fn bind(record: &NoteRecord, now: OffsetDateTime) -> Self {
        Self {
            title: record.title.clone(),
            formatted_relative_date: format_relative_date(record.modified, now),
        }
    }
}

/// "Today", "Yesterday" or "Tomorrow" when close to `now`, otherwise a short
/// month/day/year date. Days are counted in UTC.
pub fn format_relative_date(modified: i64, now: OffsetDateTime) -> String {
    let Ok(when) = OffsetDateTime::from_unix_timestamp(modified) else {
        return modified.to_string();
    };
    let days = (when.date() - now.date()).whole_days();
    match days {
        0 => "Today".to_string(),
        -1 => "Yesterday".to_string(),
        1 => "Tomorrow".to_string(),
        _ => when
            .format(&*SHORT_DATE)
            .unwrap_or_else(|_| when.date().to_string()),
    }
}
