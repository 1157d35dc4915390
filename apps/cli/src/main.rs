//! fetchq CLI - inspect and manage a download catalog
//!
//! Opens a namespace with admission switched off, so commands only edit the
//! catalog. Transfers run in whatever process hosts the engine with a real
//! transport.

mod commands;
mod output;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use fetchq_core::{Collaborators, DownloadEngine, FetchError, TransferContext, TransferOutcome, Transport};
use fetchq_types::{Download, DownloadBlock, EngineConfig, Priority, Status};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// fetchq - download queue manager
#[derive(Parser)]
#[command(name = "fetchq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding the namespace databases
    #[arg(long, env = "FETCHQ_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Namespace to operate on
    #[arg(short = 'n', long, default_value = "default")]
    namespace: String,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Which downloads a bulk command applies to
#[derive(Args, Debug)]
pub struct Target {
    /// Download IDs
    ids: Vec<String>,

    /// Every download in this group
    #[arg(long, conflicts_with_all = ["ids", "all"])]
    group: Option<i32>,

    /// Every download in the namespace
    #[arg(long, conflicts_with = "ids")]
    all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a download to the queue
    Add {
        /// URL to download
        url: String,

        /// Destination file
        file: PathBuf,

        /// Priority (low, normal, high)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Group id
        #[arg(short, long, default_value_t = 0)]
        group: i32,

        /// Tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Keep it ADDED instead of queueing it
        #[arg(long)]
        hold: bool,
    },

    /// Catalog a file that was downloaded elsewhere
    AddCompleted {
        /// URL the file came from
        url: String,

        /// File on disk
        file: PathBuf,

        /// Group id
        #[arg(short, long, default_value_t = 0)]
        group: i32,
    },

    /// List downloads
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<Status>,

        /// Filter by group
        #[arg(short, long)]
        group: Option<i32>,

        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download ID
        id: String,
    },

    /// Summarize every group
    Groups,

    /// Pause downloads
    Pause(Target),

    /// Resume paused or held downloads
    Resume(Target),

    /// Cancel downloads
    Cancel(Target),

    /// Retry failed or cancelled downloads
    Retry(Target),

    /// Remove downloads from the catalog, keeping their files
    Remove(Target),

    /// Remove downloads and delete their files
    Delete(Target),

    /// Remove every download with a status
    Clear {
        /// Status to clear
        status: Status,

        /// Also delete the files
        #[arg(long)]
        with_files: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Transport for a process that never transfers
struct DetachedTransport;

#[async_trait]
impl Transport for DetachedTransport {
    async fn transfer(
        &self,
        _download: Download,
        _blocks: Vec<DownloadBlock>,
        _ctx: TransferContext,
    ) -> Result<TransferOutcome, FetchError> {
        Err(FetchError::Transport(
            "the fetchq CLI does not transfer files".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fetchq_core=debug")))
            .with_writer(std::io::stderr)
            .init();
    }

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "fetchq", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = EngineConfig::new(cli.namespace).with_concurrent_limit(0);
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let database = config.database_path();
    let engine = DownloadEngine::open(config, Collaborators::new(Arc::new(DetachedTransport))).await?;
    tracing::debug!("Using catalog {}", database.display());
    let result = run(&engine, cli.command, cli.output).await;
    engine.close().await?;
    result
}

async fn run(engine: &DownloadEngine, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Add {
            url,
            file,
            priority,
            group,
            tag,
            hold,
        } => commands::add_download(engine, url, file, priority, group, tag, hold, format).await,

        Commands::AddCompleted { url, file, group } => {
            commands::add_completed(engine, url, file, group, format).await
        }

        Commands::List {
            status,
            group,
            tag,
            all,
        } => commands::list_downloads(engine, status, group, tag, all, format).await,

        Commands::Info { id } => commands::show_info(engine, &id, format).await,

        Commands::Groups => commands::list_groups(engine, format).await,

        Commands::Pause(target) => commands::apply(engine, commands::Action::Pause, target, format).await,
        Commands::Resume(target) => commands::apply(engine, commands::Action::Resume, target, format).await,
        Commands::Cancel(target) => commands::apply(engine, commands::Action::Cancel, target, format).await,
        Commands::Retry(target) => commands::apply(engine, commands::Action::Retry, target, format).await,
        Commands::Remove(target) => commands::apply(engine, commands::Action::Remove, target, format).await,
        Commands::Delete(target) => commands::apply(engine, commands::Action::Delete, target, format).await,

        Commands::Clear {
            status,
            with_files,
            yes,
        } => commands::clear(engine, status, with_files, yes, format).await,

        Commands::Completions { .. } => Ok(()),
    }
}
