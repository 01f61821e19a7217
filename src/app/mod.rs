use std::io::Stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::widgets::ListState;
use ratatui::Terminal;
use time::OffsetDateTime;

use crate::config::AppConfig;
use crate::groups::SqliteGroupStateStore;
use crate::service::LocalNotesService;
use crate::storage::StorageHandle;
use crate::ui::{self, FrameInput, ListLine, TuiListPresenter};
use crate::view::{RowPath, RowSource};

pub mod actions;
pub mod browser;
pub mod state;

pub use actions::{ActionCoordinator, BrowserEvent};
pub use browser::Browser;
pub use state::{select_replacement, Notice, ScreenState};

enum Action {
    Quit,
    SelectNext,
    SelectPrevious,
    Activate,
    Toggle,
    Delete,
    DeleteActive,
    StartSearch,
    Refresh,
    NewNote,
    DismissNotice,
}

pub struct App {
    pub config: Arc<AppConfig>,
    browser: Browser<StorageHandle, TuiListPresenter>,
    list_state: ListState,
    cursor: usize,
    last_selection: Option<RowPath>,
    search_input: Option<String>,
    should_quit: bool,
    tick_rate: Duration,
}

impl App {
    pub fn new(config: Arc<AppConfig>, storage: StorageHandle) -> Result<Self> {
        let service = Arc::new(LocalNotesService::new(storage.clone(), config.sync.online));
        let group_store = Box::new(SqliteGroupStateStore::new(storage.clone()));
        let mut browser = Browser::new(
            storage,
            service,
            group_store,
            TuiListPresenter::new(),
            &config,
        );
        if let Err(err) = browser.load() {
            tracing::warn!(?err, "initial query failed, starting with an empty list");
        }
        browser.on_became_active();
        let tick_rate = config.browser.tick_rate();
        Ok(Self {
            config,
            browser,
            list_state: ListState::default(),
            cursor: 0,
            last_selection: None,
            search_input: None,
            should_quit: false,
            tick_rate,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let mut terminal = setup_terminal()?;
        let result = self.event_loop(&mut terminal);
        restore_terminal(&mut terminal)?;
        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            self.follow_selection();
            terminal
                .draw(|frame| {
                    let lines = self.browser.presenter().lines();
                    self.list_state
                        .select((!lines.is_empty()).then_some(self.cursor));
                    let input = FrameInput {
                        lines,
                        projector: self.browser.projector(),
                        state: self.browser.state(),
                        search_input: self.search_input.as_deref(),
                        now: OffsetDateTime::now_utc(),
                    };
                    ui::draw_browser(frame, &input, &mut self.list_state);
                })
                .context("rendering frame")?;

            if self.should_quit {
                break;
            }

            let timeout = self
                .tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(0));

            if event::poll(timeout).context("polling for terminal events")? {
                if let Event::Key(key) = event::read().context("reading terminal event")? {
                    self.handle_key(key);
                }
            }

            if last_tick.elapsed() >= self.tick_rate {
                self.browser.pump();
                last_tick = Instant::now();
            }
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }

        if let Some(input) = self.search_input.as_mut() {
            match key.code {
                KeyCode::Esc => {
                    self.search_input = None;
                    self.browser.search("");
                }
                KeyCode::Enter => self.search_input = None,
                KeyCode::Backspace => {
                    input.pop();
                    let text = input.clone();
                    self.browser.search(&text);
                }
                KeyCode::Char(ch)
                    if !key.modifiers.intersects(
                        KeyModifiers::CONTROL | KeyModifiers::ALT | KeyModifiers::SUPER,
                    ) =>
                {
                    input.push(ch);
                    let text = input.clone();
                    self.browser.search(&text);
                }
                _ => {}
            }
            return;
        }

        let plain = !key
            .modifiers
            .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT | KeyModifiers::SUPER);
        let action = match key.code {
            KeyCode::Char('q') => Some(Action::Quit),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(Action::Quit)
            }
            KeyCode::Char('j') | KeyCode::Down => Some(Action::SelectNext),
            KeyCode::Char('k') | KeyCode::Up => Some(Action::SelectPrevious),
            KeyCode::Enter => Some(Action::Activate),
            KeyCode::Char(' ') => Some(Action::Toggle),
            KeyCode::Char('d') if plain => Some(Action::Delete),
            KeyCode::Char('D') => Some(Action::DeleteActive),
            KeyCode::Char('/') => Some(Action::StartSearch),
            KeyCode::Char('r') if plain => Some(Action::Refresh),
            KeyCode::Char('n') if plain => Some(Action::NewNote),
            KeyCode::Char('x') | KeyCode::Esc => Some(Action::DismissNotice),
            _ => None,
        };

        if let Some(action) = action {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Quit => self.should_quit = true,
            Action::SelectNext => {
                let len = self.browser.presenter().lines().len();
                if self.cursor + 1 < len {
                    self.cursor += 1;
                }
            }
            Action::SelectPrevious => self.cursor = self.cursor.saturating_sub(1),
            Action::Activate => match self.current_line() {
                Some(ListLine::Row { path, .. }) => {
                    self.browser.select_row(path);
                }
                Some(ListLine::Header { group }) => self.toggle(group),
                None => {}
            },
            Action::Toggle => {
                let group = match self.current_line() {
                    Some(ListLine::Header { group }) => group,
                    Some(ListLine::Row { path, .. }) => path.group,
                    None => return,
                };
                self.toggle(group);
            }
            Action::Delete => {
                if let Some(ListLine::Row { path, .. }) = self.current_line() {
                    self.browser.delete_record(path);
                }
            }
            Action::DeleteActive => {
                self.browser.delete_active_record();
            }
            Action::StartSearch => {
                self.search_input = Some(self.browser.state().search.text.clone());
            }
            Action::Refresh => {
                if !self.browser.refresh() {
                    tracing::debug!("refresh not started");
                }
            }
            Action::NewNote => {
                self.browser.add_note("", "");
            }
            Action::DismissNotice => self.browser.dismiss_notice(),
        }
        self.clamp_cursor();
    }

    fn toggle(&mut self, group: usize) {
        let Some(key) = self.browser.projector().group_key(group).cloned() else {
            return;
        };
        self.browser.toggle_group(group, &key);
        if let Some(line) = self
            .browser
            .presenter()
            .lines()
            .iter()
            .position(|line| *line == ListLine::Header { group })
        {
            self.cursor = line;
        }
    }

    fn current_line(&self) -> Option<ListLine> {
        self.browser.presenter().lines().get(self.cursor).copied()
    }

    fn clamp_cursor(&mut self) {
        let len = self.browser.presenter().lines().len();
        self.cursor = self.cursor.min(len.saturating_sub(1));
    }

    /// Moves the cursor when the browser picked a new selection on its own,
    /// e.g. the replacement after a delete.
    fn follow_selection(&mut self) {
        let selection = self.browser.state().selection;
        if selection != self.last_selection {
            if let Some(line) = selection.and_then(|path| self.browser.presenter().line_of(path)) {
                self.cursor = line;
            }
            self.last_selection = selection;
        }
        self.clamp_cursor();
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode().context("enabling raw mode")?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen).context("entering alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).context("creating terminal")
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode().context("disabling raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("leaving alternate screen")?;
    terminal.show_cursor().context("showing cursor")?;
    Ok(())
}
