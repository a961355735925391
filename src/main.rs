//! # Voltline CLI (`voltline`)
//!
//! The `voltline` binary indexes the shop catalogue and knowledge documents
//! and answers retrieval queries, from the command line or over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! voltline --config ./config/voltline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `voltline init` | Create the SQLite database and run schema migrations |
//! | `voltline sources` | List ingestion sources and whether they are configured |
//! | `voltline ingest <source>` | Sync products, documents, or both into the index |
//! | `voltline embed pending` | Backfill missing embeddings |
//! | `voltline search "<query>"` | Hybrid, vector, or text search |
//! | `voltline terms "<query>"` | Show the technical terms extracted from a query |
//! | `voltline get <external_id>` | Print one indexed item |
//! | `voltline stats` | Index counters |
//! | `voltline purge` | Hard-delete retired items |
//! | `voltline serve` | Start the HTTP retrieval API |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use voltline::{config, db, embed_cmd, get, ingest, migrate, search, server, sources, stats};

/// Voltline: hybrid product and knowledge retrieval for the shop assistant.
#[derive(Parser)]
#[command(name = "voltline", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/voltline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, the items table, the full-text
    /// index and the revision triggers. Safe to run repeatedly.
    Init,

    /// List ingestion sources and whether they are configured.
    Sources,

    /// Sync a source into the index.
    ///
    /// Unchanged items are skipped; items the source no longer produces are
    /// retired (soft-deleted) on full runs.
    Ingest {
        /// `products`, `documents`, or `all`.
        source: String,

        /// Show document and item counts without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of documents to process. Limited runs never retire items.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search the index.
    Search {
        query: String,

        /// `hybrid` (exact title + vector + text), `vector`, or `text`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Restrict results to a content type. Repeatable.
        #[arg(long = "type")]
        types: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// Similarity threshold for `--mode vector`.
        #[arg(long)]
        min_similarity: Option<f32>,
    },

    /// Show the technical terms extracted from a query.
    Terms { query: String },

    /// Print an indexed item by external id.
    Get { external_id: String },

    /// Show index statistics.
    Stats,

    /// Permanently delete retired items.
    Purge,

    /// Start the HTTP retrieval API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed active items that have no embedding yet.
    Pending {
        /// Maximum number of items to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (number of texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Ingest {
            source,
            dry_run,
            limit,
        } => {
            ingest::run_ingest(&cfg, &source, dry_run, limit).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
        },
        Commands::Search {
            query,
            mode,
            types,
            limit,
            min_similarity,
        } => {
            search::run_search(&cfg, &query, &mode, &types, limit, min_similarity).await?;
        }
        Commands::Terms { query } => {
            search::run_terms(&cfg, &query)?;
        }
        Commands::Get { external_id } => {
            get::run_get(&cfg, &external_id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Purge => {
            stats::run_purge(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
