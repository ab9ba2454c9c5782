use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigLoader, PathOverrides};
use crate::events::SqliteEventLog;
use crate::quotes::QuoteBook;
use crate::storage;

pub mod commands;

use self::commands::{
    AccountArgs, BrowseArgs, DuplicatesArgs, QuoteRefArgs, ShowArgs, SubmitArgs, UpdateArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "quotebook",
    version,
    about = "Archive, deduplicate and browse chat quotes"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over QUOTEBOOK_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over QUOTEBOOK_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or inspect accounts
    Account(AccountArgs),
    /// Store a new draft quote
    Submit(SubmitArgs),
    /// Change a draft, optionally publishing it
    Update(UpdateArgs),
    /// Publish a draft (or fold a pending edit back into its quote)
    Publish(QuoteRefArgs),
    /// Open an edit draft for a published quote
    Edit(QuoteRefArgs),
    /// Throw a draft away
    Discard(QuoteRefArgs),
    /// Delete a published quote
    Delete(QuoteRefArgs),
    /// Print a single quote
    Show(ShowArgs),
    /// Page through recent quotes, drafts or search results
    Browse(BrowseArgs),
    /// List quotes that look like copies of a quote or of new text
    Duplicates(DuplicatesArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let loader = ConfigLoader::discover(PathOverrides {
        config_file: cli.config.clone(),
        data_dir: cli.data_dir.clone(),
    })?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&paths, &config.storage)?;
    let events = Arc::new(SqliteEventLog::new(storage.clone()));
    let book = QuoteBook::new(storage, events);

    let output = match cli.command {
        Commands::Account(args) => commands::account(&book, args),
        Commands::Submit(args) => commands::submit(&book, &config, args),
        Commands::Update(args) => commands::update(&book, args),
        Commands::Publish(args) => commands::publish(&book, args),
        Commands::Edit(args) => commands::edit(&book, args),
        Commands::Discard(args) => commands::discard(&book, args),
        Commands::Delete(args) => commands::delete(&book, args),
        Commands::Show(args) => commands::show(&book, args),
        Commands::Browse(args) => commands::browse(&book, &config, args),
        Commands::Duplicates(args) => commands::duplicates(&book, &config, args),
    }?;
    print!("{output}");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
