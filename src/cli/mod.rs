use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::App;
use crate::config::{ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::storage;

pub mod commands;

use self::commands::{DeleteArgs, ListArgs, MoveArgs, NewArgs, ToggleArgs};

const LOG_FILE: &str = "notes-browser.log";

#[derive(Parser, Debug)]
#[command(
    name = "notebrowse",
    version,
    about = "Grouped, collapsible notes browser for the terminal"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over NOTES_BROWSER_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over NOTES_BROWSER_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch the interactive browser (default)
    Tui,
    /// Print the grouped note list
    List(ListArgs),
    /// Create a note from the command line
    New(NewArgs),
    /// Delete a note through the notes manager
    Delete(DeleteArgs),
    /// Move a note to another category
    Move(MoveArgs),
    /// Collapse or expand a category group
    Toggle(ToggleArgs),
    /// Show the stored collapse state of every group
    Groups,
    /// Purge deletions that are still pending
    Sync,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    let command = cli.command.unwrap_or(Commands::Tui);

    // The terminal belongs to the browser while it runs, so its logs go to a file.
    let log_file = matches!(command, Commands::Tui).then(|| paths.log_dir.join(LOG_FILE));
    init_tracing(&cli.log_level, log_file.as_deref())
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&config.storage)?;

    let config = Arc::new(config);
    match command {
        Commands::Tui => {
            if let Err(err) = storage.seed_first_run() {
                tracing::warn!(?err, "could not seed first-run notes");
            }
            let mut app = App::new(config, storage)?;
            commands::run_tui(&mut app)
        }
        Commands::List(args) => commands::list_notes(config, storage, args),
        Commands::New(args) => commands::new_note(config, storage, args),
        Commands::Delete(args) => commands::delete_note(config, storage, args),
        Commands::Move(args) => commands::move_note(config, storage, args),
        Commands::Toggle(args) => commands::toggle_group(config, storage, args),
        Commands::Groups => commands::list_groups(config, storage),
        Commands::Sync => commands::sync_notes(config, storage),
    }
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        match log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                fmt()
                    .with_env_filter(env_filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
            }
            None => {
                fmt()
                    .with_env_filter(env_filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
        Ok::<(), anyhow::Error>(())
    })
    .map(|_| ())
}
