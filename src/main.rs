//! # Annals CLI (`annals`)
//!
//! The `annals` binary drives the engine from the command line: ingest a
//! corpus, rebuild the vector index, search, browse, ask questions with a
//! streamed answer, and start the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! annals --config ./config/annals.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `annals init` | Create the SQLite database and run schema migrations |
//! | `annals ingest <path>` | Import text, markdown and PDF files |
//! | `annals reindex` | Rebuild the vector index from the store |
//! | `annals search "<query>"` | Ranked retrieval over the corpus |
//! | `annals get <id>` | Print one document |
//! | `annals list` | Page through documents |
//! | `annals vocab <field>` | Distinct types, years or authors |
//! | `annals purge <id>` | Delete a document and its vectors |
//! | `annals ask "<question>"` | Stream a grounded answer |
//! | `annals stats` | Corpus and index overview |
//! | `annals serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use annals::engine::Engine;
use annals::ingest::{self, IngestOverrides};
use annals::models::{DocumentFilter, DocumentType, Query, SearchMode};
use annals::store::VocabularyField;
use annals::{config, db, get, migrate, search, server, stats};

/// Annals: document retrieval and streaming answers over a historical corpus.
#[derive(Parser)]
#[command(
    name = "annals",
    about = "Annals — document retrieval and streaming answers for research corpora",
    version,
    long_about = "Annals stores a corpus of books, articles, manuscripts and theses, \
    maintains a vector index over it, answers ranked retrieval queries, and streams \
    grounded answers with source attribution over a CLI and an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/annals.toml`. See `config/annals.example.toml`.
    #[arg(long, global = true, default_value = "./config/annals.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it against an existing database is safe.
    Init,

    /// Import documents from a file or directory.
    ///
    /// Text and markdown files may carry `+++` TOML front matter with
    /// title, author, year, type and tags. PDFs are stored one document
    /// per page. Re-ingesting unchanged files is a no-op.
    Ingest {
        /// File or directory to import.
        path: PathBuf,

        /// Document type for every imported file (book, article, manuscript, thesis).
        #[arg(long = "type")]
        doc_type: Option<DocumentType>,

        /// Author for every imported file.
        #[arg(long)]
        author: Option<String>,

        /// Publication year for every imported file.
        #[arg(long)]
        year: Option<i32>,

        /// Tag to attach; may be repeated.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Rebuild the vector index after importing.
        #[arg(long)]
        reindex: bool,
    },

    /// Rebuild the vector index from the current store contents.
    ///
    /// Vectors of unchanged documents are reused. The live index keeps
    /// serving until the new one is swapped in.
    Reindex,

    /// Search the corpus.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        k: Option<usize>,

        #[arg(long = "type")]
        doc_type: Option<DocumentType>,

        #[arg(long)]
        year: Option<i32>,

        /// `semantic` (vector, lexical fallback), `hybrid`, or `lexical`.
        #[arg(long, default_value = "semantic")]
        mode: SearchMode,
    },

    /// Print a document by id.
    Get { id: i64 },

    /// List documents ordered by id.
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long = "type")]
        doc_type: Option<DocumentType>,

        #[arg(long)]
        year: Option<i32>,
    },

    /// Print the distinct values of `types`, `years`, or `authors`.
    Vocab { field: VocabularyField },

    /// Delete a document and drop its vectors from the index.
    Purge { id: i64 },

    /// Ask a question; the answer streams to stdout followed by its sources.
    Ask {
        question: String,

        /// Answer without consulting the corpus.
        #[arg(long)]
        no_documents: bool,
    },

    /// Show corpus and index statistics.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "annals=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg).await?;
        migrate::run_migrations(&pool).await?;
        pool.close().await;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let engine = Engine::open(&cfg).await?;

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Ingest {
            path,
            doc_type,
            author,
            year,
            tags,
            reindex,
        } => {
            let overrides = IngestOverrides {
                doc_type,
                author,
                year,
                tags,
            };
            let report =
                ingest::ingest_path(engine.store.as_ref(), &cfg.ingest, &path, &overrides).await?;
            println!("Ingest {}", path.display());
            println!("  files:     {}", report.files);
            println!("  inserted:  {}", report.inserted);
            println!("  replaced:  {}", report.replaced);
            println!("  unchanged: {}", report.unchanged);
            println!("  skipped:   {}", report.skipped);
            println!("  failed:    {}", report.failed);
            if reindex {
                print_reindex(&engine).await?;
            }
        }
        Commands::Reindex => print_reindex(&engine).await?,
        Commands::Search {
            query,
            k,
            doc_type,
            year,
            mode,
        } => {
            let mut q = Query::new(query)
                .with_mode(mode)
                .with_filter(DocumentFilter { doc_type, year });
            if let Some(k) = k {
                q = q.with_k(k);
            }
            search::run_search(&engine, q).await?;
        }
        Commands::Get { id } => get::run_get(&engine, id).await?,
        Commands::List {
            limit,
            offset,
            doc_type,
            year,
        } => get::run_list(&engine, limit, offset, DocumentFilter { doc_type, year }).await?,
        Commands::Vocab { field } => get::run_vocab(&engine, field).await?,
        Commands::Purge { id } => get::run_purge(&engine, id).await?,
        Commands::Ask {
            question,
            no_documents,
        } => search::run_ask(&engine, &question, !no_documents).await?,
        Commands::Stats => stats::run_stats(&engine).await?,
        Commands::Serve => server::run_server(std::sync::Arc::new(engine)).await?,
    }

    Ok(())
}

async fn print_reindex(engine: &Engine) -> anyhow::Result<()> {
    let report = engine.reindexer.run().await?;
    println!("Reindex {}", report.run_id);
    println!("  documents: {}", report.documents);
    println!("  embedded:  {}", report.embedded);
    println!("  reused:    {}", report.reused);
    println!("  dropped:   {}", report.dropped);
    println!("  vectors:   {}", report.vectors);
    println!("  elapsed:   {} ms", report.elapsed_ms);
    Ok(())
}
