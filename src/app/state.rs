use crate::groups::GroupKey;
use crate::service::ServiceError;
use crate::view::RowPath;

/// Which background work the screen is waiting on. Flags rather than one
/// enum: a search can run while a sync is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub refreshing: bool,
    pub deleting: Option<i64>,
    pub searching: bool,
    pub adding: bool,
}

impl Progress {
    pub fn is_idle(&self) -> bool {
        !self.refreshing && self.deleting.is_none() && !self.searching && !self.adding
    }
}

/// Where a delete started, captured before the record store is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub id: i64,
    pub key: GroupKey,
    pub row: usize,
    pub count_before: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchState {
    pub text: String,
    pub generation: u64,
    pub last_error: Option<String>,
}

impl SearchState {
    pub fn is_active(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: String,
}

impl From<ServiceError> for Notice {
    fn from(err: ServiceError) -> Self {
        Self {
            title: err.title,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenState {
    pub progress: Progress,
    /// Add and settings actions; off while a refresh is running.
    pub actions_enabled: bool,
    pub pending_delete: Option<PendingDelete>,
    pub search: SearchState,
    /// Record open in the detail surface.
    pub active_record: Option<i64>,
    pub selection: Option<RowPath>,
    pub notice: Option<Notice>,
}

impl Default for ScreenState {
    fn default() -> Self {
        Self {
            progress: Progress::default(),
            actions_enabled: true,
            pending_delete: None,
            search: SearchState::default(),
            active_record: None,
            selection: None,
            notice: None,
        }
    }
}

impl ScreenState {
    pub fn is_refreshing(&self) -> bool {
        self.progress.refreshing
    }

    pub fn begin_refresh(&mut self) {
        self.progress.refreshing = true;
        self.actions_enabled = false;
    }

    /// Restores the actions whatever the outcome was.
    pub fn end_refresh(&mut self, failure: Option<ServiceError>) {
        self.progress.refreshing = false;
        self.actions_enabled = true;
        if let Some(err) = failure {
            self.notice = Some(err.into());
        }
    }

    pub fn show_notice(&mut self, err: ServiceError) {
        self.notice = Some(err.into());
    }

    pub fn dismiss_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }
}

/// Row to select after deleting row `row` of a group that has `remaining`
/// rows left: the row that slid into its place, else the new last row,
/// else nothing.
pub fn select_replacement(remaining: usize, row: usize) -> Option<usize> {
    match remaining {
        0 => None,
        n => Some(row.min(n - 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_follows_same_index_then_last_row() {
        // Group of three, rows 0..=2.
        assert_eq!(select_replacement(2, 0), Some(0));
        assert_eq!(select_replacement(2, 1), Some(1));
        assert_eq!(select_replacement(2, 2), Some(1));
        // Single-row group.
        assert_eq!(select_replacement(0, 0), None);
    }

    #[test]
    fn refresh_always_restores_actions() {
        let mut state = ScreenState::default();
        state.begin_refresh();
        assert!(state.is_refreshing());
        assert!(!state.actions_enabled);

        state.end_refresh(Some(ServiceError::offline()));
        assert!(!state.is_refreshing());
        assert!(state.actions_enabled);
        let notice = state.dismiss_notice().expect("notice shown");
        assert_eq!(notice.title, "Network Error");
        assert!(state.notice.is_none());
    }

    #[test]
    fn whitespace_search_is_inactive() {
        let search = SearchState {
            text: "   ".into(),
            ..SearchState::default()
        };
        assert!(!search.is_active());
    }
}
