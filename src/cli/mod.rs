//! CLI parser and dispatch.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "labelqueue")]
#[command(about = "Crowd-sourced annotation dispatcher")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery of ./labelqueue.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// SQLite database file (overrides the config file)
    #[arg(long, global = true, env = "LABELQUEUE_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled, for logging setup before `Cli::parse`.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize an annotation task's items from a source document file
    Seed {
        /// Task name; grouping tag shared by every item the dispatcher serves
        #[arg(long)]
        task: String,
        /// JSON file holding an array of source documents
        #[arg(long)]
        source: PathBuf,
        /// Field on each source document to use as `docId` (default: "id")
        #[arg(long, default_value = "id")]
        doc_id_field: String,
        /// Only seed the first N documents (0 = all)
        #[arg(long, default_value = "0")]
        max_count: usize,
    },

    /// Run one dispatcher against a terminal-driven demo loop
    Serve {
        /// Task name to serve
        #[arg(long)]
        task: String,
        /// Required valid label count per item
        #[arg(long, default_value = "2")]
        annotations_per_item: u32,
        /// High-water mark for the unannotated queue
        #[arg(long, default_value = "200")]
        queue_size: usize,
        /// Number of simulated concurrent annotators to run
        #[arg(long, default_value = "4")]
        demo_annotators: usize,
    },

    /// Print completion stats for a task
    Stats {
        /// Task name to report on
        #[arg(long)]
        task: String,
    },
}

fn resolve_config(cli_config: Option<PathBuf>, cli_db: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = cli_config.unwrap_or_else(|| PathBuf::from("labelqueue.toml"));
    let mut config = Config::load(Some(&path))?;
    if let Some(db) = cli_db {
        config.db_path = db.to_string_lossy().into_owned();
    }
    Ok(config)
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config.clone(), cli.db.clone())?;

    match cli.command {
        Commands::Seed {
            task,
            source,
            doc_id_field,
            max_count,
        } => commands::seed::cmd_seed(&config, &task, &source, &doc_id_field, max_count).await,
        Commands::Serve {
            task,
            annotations_per_item,
            queue_size,
            demo_annotators,
        } => {
            commands::serve::cmd_serve(
                &config,
                &task,
                annotations_per_item,
                queue_size,
                demo_annotators,
            )
            .await
        }
        Commands::Stats { task } => commands::stats::cmd_stats(&config, &task).await,
    }
}
