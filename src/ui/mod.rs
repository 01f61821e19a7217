use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Frame;
use time::OffsetDateTime;
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

use crate::app::state::ScreenState;
use crate::view::{
    GroupHeader, HeaderSource, ListPresenter, Projector, ReferenceList, RowDisplay, RowPath,
    RowSource,
};

/// One line of the flattened list: a group header or a visible row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListLine {
    Header { group: usize },
    Row { path: RowPath, id: i64 },
}

/// Presenter backing the terminal list. Batches land in a [`ReferenceList`];
/// the flattened lines are rebuilt from it once a batch has been read back.
#[derive(Debug, Default)]
pub struct TuiListPresenter {
    rendered: ReferenceList,
    lines: Vec<ListLine>,
    batches: u64,
}

impl TuiListPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[ListLine] {
        &self.lines
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn line_of(&self, path: RowPath) -> Option<usize> {
        self.lines
            .iter()
            .position(|line| matches!(line, ListLine::Row { path: p, .. } if *p == path))
    }

    fn rebuild_lines(&mut self) {
        self.lines.clear();
        for (group, (_, ids)) in self.rendered.content().into_iter().enumerate() {
            self.lines.push(ListLine::Header { group });
            self.lines.extend(
                ids.into_iter()
                    .enumerate()
                    .map(|(row, id)| ListLine::Row {
                        path: RowPath::new(group, row),
                        id,
                    }),
            );
        }
    }
}

impl ListPresenter for TuiListPresenter {
    fn begin_updates(&mut self) {
        self.rendered.begin_updates();
    }

    fn delete_groups(&mut self, groups: &[usize]) {
        self.rendered.delete_groups(groups);
    }

    fn insert_groups(&mut self, groups: &[usize]) {
        self.rendered.insert_groups(groups);
    }

    fn reload_groups(&mut self, groups: &[usize]) {
        self.rendered.reload_groups(groups);
    }

    fn delete_rows(&mut self, rows: &[RowPath]) {
        self.rendered.delete_rows(rows);
    }

    fn insert_rows(&mut self, rows: &[RowPath]) {
        self.rendered.insert_rows(rows);
    }

    fn reload_rows(&mut self, rows: &[RowPath]) {
        self.rendered.reload_rows(rows);
    }

    fn end_updates(&mut self) {
        self.rendered.end_updates();
        self.batches += 1;
    }

    fn reload_all(&mut self) {
        self.rendered.reload_all();
        self.batches += 1;
    }

    fn rebind(&mut self, source: &dyn RowSource) {
        let seen = self.rendered.violations().len();
        self.rendered.resolve(source);
        if self.rendered.violations().len() > seen {
            tracing::warn!(
                violations = ?&self.rendered.violations()[seen..],
                "rendered list drifted, rebuilding"
            );
            self.rendered = ReferenceList::from_source(source);
        }
        self.rebuild_lines();
    }
}

/// What the frame needs besides the browser itself.
pub struct FrameInput<'a> {
    pub lines: &'a [ListLine],
    pub projector: &'a Projector,
    pub state: &'a ScreenState,
    /// Search text being typed, when the search field has focus.
    pub search_input: Option<&'a str>,
    pub now: OffsetDateTime,
}

pub fn draw_browser(frame: &mut Frame, input: &FrameInput<'_>, list_state: &mut ListState) {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(3)])
        .split(frame.size());

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(vertical[0]);

    let active = input.state.active_record;
    let mut items = Vec::with_capacity(input.lines.len());
    for line in input.lines {
        match *line {
            ListLine::Header { group } => {
                if let Some(header) = input.projector.group_header(group) {
                    items.push(ListItem::new(Line::from(Span::styled(
                        header_label(&header),
                        Style::default()
                            .fg(Color::Cyan)
                            .add_modifier(Modifier::BOLD),
                    ))));
                }
            }
            ListLine::Row { id, .. } => {
                let Some(record) = input.projector.record_by_id(id) else {
                    items.push(ListItem::new(""));
                    continue;
                };
                let display = RowDisplay::bind(record, input.now);
                let title_style = if active == Some(id) {
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                };
                items.push(ListItem::new(Line::from(vec![
                    Span::raw("   "),
                    Span::styled(clip(&display.title, 40), title_style),
                    Span::raw("  "),
                    Span::styled(display.formatted_relative_date, Style::default().fg(Color::Gray)),
                ])));
            }
        }
    }
    if items.is_empty() {
        let empty = if input.state.search.is_active() {
            "No notes match the search."
        } else {
            "No notes yet. Press `n` to create one."
        };
        items.push(ListItem::new(empty));
    }

    let list = List::new(items)
        .block(Block::default().title("Notes").borders(Borders::ALL))
        .highlight_style(
            Style::default()
                .bg(Color::Blue)
                .fg(Color::Black)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▸ ");
    frame.render_stateful_widget(list, columns[0], list_state);

    let detail: Text = active
        .and_then(|id| input.projector.record_by_id(id))
        .map(|record| {
            let mut lines = vec![
                Line::from(Span::styled(
                    record.title.clone(),
                    Style::default().add_modifier(Modifier::BOLD),
                )),
                Line::from(Span::styled(
                    RowDisplay::bind(record, input.now).formatted_relative_date,
                    Style::default().fg(Color::Gray),
                )),
                Line::from(""),
            ];
            lines.extend(record.content.lines().map(|line| Line::from(line.to_string())));
            Text::from(lines)
        })
        .unwrap_or_else(|| Text::from("Select a note to see its contents."));
    let detail = Paragraph::new(detail)
        .block(Block::default().title("Note").borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    frame.render_widget(Clear, columns[1]);
    frame.render_widget(detail, columns[1]);

    let status = Paragraph::new(status_text(input.state, input.search_input))
        .style(Style::default().fg(Color::Gray));
    frame.render_widget(status, vertical[1]);
}

/// "▾ Work (2)" for an expanded group, "▸ Work (2)" for a collapsed one.
pub fn header_label(header: &GroupHeader) -> String {
    let marker = if header.collapsed { '▸' } else { '▾' };
    format!("{marker} {} ({})", header.display_title, header.record_count)
}

fn status_text(state: &ScreenState, search_input: Option<&str>) -> Text<'static> {
    let mut first = Vec::new();
    if state.progress.refreshing {
        first.push(Span::styled(
            "⟳ Syncing… ",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ));
    }
    if state.progress.deleting.is_some() {
        first.push(Span::raw("Deleting… "));
    }
    match search_input {
        Some(text) => first.push(Span::styled(
            format!("/{text}"),
            Style::default().fg(Color::White),
        )),
        None if state.search.is_active() => {
            first.push(Span::raw(format!("Search: {} ", state.search.text.trim())));
        }
        None => {}
    }
    if let Some(error) = &state.search.last_error {
        first.push(Span::styled(
            format!(" ({error})"),
            Style::default().fg(Color::Red),
        ));
    }

    let second = match &state.notice {
        Some(notice) => Line::from(vec![
            Span::styled(
                format!("{}: ", notice.title),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            ),
            Span::raw(notice.message.clone()),
            Span::styled("  [x] dismiss", Style::default().fg(Color::DarkGray)),
        ]),
        None => {
            let mut help = String::from("j/k move  space toggle  enter open  d delete  / search");
            if state.actions_enabled {
                help.push_str("  n new");
            }
            help.push_str("  r sync  q quit");
            Line::from(help)
        }
    };
    Text::from(vec![Line::from(first), second])
}

/// Clips to `max` columns on a grapheme boundary.
fn clip(text: &str, max: usize) -> String {
    if text.width() <= max {
        return text.to_string();
    }
    let mut out = String::new();
    for grapheme in text.graphemes(true) {
        if out.width() + grapheme.width() + 1 > max {
            break;
        }
        out.push_str(grapheme);
    }
    out.push('…');
    out
}
