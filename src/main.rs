//! # Filing RAG CLI (`frag`)
//!
//! ## Usage
//!
//! ```bash
//! frag --config ./config/frag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `frag index` | Embed chunks not yet in the index and persist them |
//! | `frag search "<query>"` | Return the nearest chunks for a query |
//! | `frag stats` | Summarise the persisted index |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use filing_rag::config;
use filing_rag::indexer;
use filing_rag::progress::ProgressMode;
use filing_rag::retrieve::{self, RetrievalFilter, SearchOutput};
use filing_rag::stats;

/// Retrieval over SEC filings: incremental chunk embedding and
/// nearest-neighbour search.
#[derive(Parser)]
#[command(name = "frag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/frag.toml")]
    config: PathBuf,

    /// Log progress at info level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed new chunks from the corpus and append them to the index.
    ///
    /// Safe to re-run: chunks already indexed are skipped, and a run with
    /// nothing new leaves the index files untouched.
    Index {
        /// Report what would be embedded without calling the provider.
        #[arg(long)]
        dry_run: bool,

        /// Override `[embedding] batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Progress on stderr. Defaults to human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search the index.
    Search {
        query: String,

        /// Number of hits (defaults to `[retrieval] top_k`).
        #[arg(short)]
        k: Option<usize>,

        #[arg(long)]
        ticker: Option<String>,

        /// Filing year, e.g. 2023.
        #[arg(long)]
        year: Option<i32>,

        /// Filing form, e.g. 10-K.
        #[arg(long)]
        form: Option<String>,

        /// Print hits as JSON.
        #[arg(long, conflicts_with = "context")]
        json: bool,

        /// Print the joined context blob only.
        #[arg(long)]
        context: bool,
    },

    /// Show index statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index {
            dry_run,
            batch_size,
            progress,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            indexer::run_index(&cfg, dry_run, batch_size, progress).await?;
        }
        Commands::Search {
            query,
            k,
            ticker,
            year,
            form,
            json,
            context,
        } => {
            let filter = RetrievalFilter { ticker, year, form };
            let output = if json {
                SearchOutput::Json
            } else if context {
                SearchOutput::Context
            } else {
                SearchOutput::Human
            };
            retrieve::run_search(&cfg, &query, k, filter, output).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg)?;
        }
    }

    Ok(())
}
