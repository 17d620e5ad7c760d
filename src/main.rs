//! # docusearch CLI
//!
//! The `docusearch` binary runs the HTTP server and the pipeline stage
//! workers, and offers operator commands over the same services.
//!
//! ## Usage
//!
//! ```bash
//! docusearch --config ./config/docusearch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docusearch init` | Create the SQLite database and run schema migrations |
//! | `docusearch serve` | HTTP server plus extraction and embedding workers |
//! | `docusearch work` | Stage workers only |
//! | `docusearch upload <file>` | Upload a file for an owner |
//! | `docusearch status <id>` | Show a document's pipeline status |
//! | `docusearch search "<query>"` | Keyword search within an owner's documents |
//! | `docusearch ask "<question>"` | Answer a question from a user's documents |
//! | `docusearch reprocess <id>` | Requeue a failed or indexed document |
//! | `docusearch delete <id>` | Delete a document everywhere |
//! | `docusearch dead-letters` | List deliveries that exhausted their retries |
//! | `docusearch prune` | Drop settled event-log rows past the retention window |
//!
//! ## Examples
//!
//! ```bash
//! docusearch init
//! docusearch serve --config ./config/docusearch.toml
//! docusearch upload ./report.pdf --owner 1 --title "Q3 report"
//! docusearch ask "What was Q3 revenue?" --user 1
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use docusearch::config::{self, Config};
use docusearch::ingest::{Coordinator, Upload};
use docusearch::query::QueryEngine;
use docusearch::search::SearchService;
use docusearch::server;
use docusearch::services::Services;
use docusearch::stages::{EmbeddingStage, ExtractionStage};
use docusearch::worker::{retention_sweep, spawn_workers, StageRunner};

const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(3600);

/// docusearch: document ingestion with full-text search and grounded
/// question answering.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docusearch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docusearch",
    about = "Document ingestion pipeline with keyword search and retrieval-augmented answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docusearch.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    Extraction,
    Embedding,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP server and, unless disabled, the stage workers.
    Serve {
        /// Serve HTTP only; run workers elsewhere with `docusearch work`.
        #[arg(long)]
        no_workers: bool,
    },

    /// Run stage workers until interrupted.
    Work {
        /// Only run this stage (default: both).
        #[arg(long, value_enum)]
        stage: Option<StageArg>,
    },

    /// Upload a file.
    Upload {
        file: PathBuf,

        #[arg(long)]
        owner: String,

        /// Defaults to the file name.
        #[arg(long)]
        title: Option<String>,

        /// Defaults to a guess from the file extension.
        #[arg(long)]
        mime: Option<String>,
    },

    /// Show a document's pipeline status.
    Status { id: String },

    /// Keyword search within an owner's documents.
    Search {
        query: String,

        #[arg(long)]
        owner: String,

        #[arg(long, default_value = "1")]
        page: i64,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Answer a question from a user's indexed documents.
    Ask {
        question: String,

        #[arg(long)]
        user: String,
    },

    /// Requeue a failed or indexed document.
    Reprocess { id: String },

    /// Delete a document from indexes, metadata, and blob storage.
    Delete { id: String },

    /// List dead-lettered deliveries.
    DeadLetters {
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Delete acked deliveries and settled events older than the retention window.
    Prune {
        /// Overrides `pipeline.retention_days`.
        #[arg(long)]
        days: Option<u64>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docusearch=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// MIME type from the file extension, for uploads from the command line.
fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

fn runners(svc: &Services, only: Option<StageArg>) -> Vec<Arc<StageRunner>> {
    let mut runners = Vec::new();
    let pipeline = svc.config.pipeline.clone();
    if !matches!(only, Some(StageArg::Embedding)) {
        runners.push(Arc::new(StageRunner::new(
            svc.bus.clone(),
            Arc::new(ExtractionStage::new(svc.clone())),
            pipeline.clone(),
        )));
    }
    if !matches!(only, Some(StageArg::Extraction)) {
        runners.push(Arc::new(StageRunner::new(
            svc.bus.clone(),
            Arc::new(EmbeddingStage::new(svc.clone())),
            pipeline,
        )));
    }
    runners
}

/// Hourly event-log pruning alongside the workers, unless retention is off.
fn spawn_retention_sweep(workers: &mut JoinSet<()>, svc: &Services, shutdown: watch::Receiver<bool>) {
    if let Some(keep) = svc.config.pipeline.retention() {
        workers.spawn(retention_sweep(
            svc.bus.clone(),
            keep,
            RETENTION_SWEEP_EVERY,
            shutdown,
        ));
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg: Config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            docusearch::migrate::init_database(&cfg).await?;
            println!("Database initialized successfully.");
            Ok(())
        }
        command => run(command, Services::from_config(cfg).await?).await,
    }
}

async fn run(command: Commands, svc: Services) -> anyhow::Result<()> {
    match command {
        Commands::Init => {}
        Commands::Serve { no_workers } => {
            let (tx, rx) = watch::channel(false);
            let mut workers = if no_workers {
                JoinSet::new()
            } else {
                let mut workers = spawn_workers(
                    &runners(&svc, None),
                    svc.config.pipeline.workers_per_stage,
                    Duration::from_millis(svc.config.pipeline.poll_interval_ms),
                    rx.clone(),
                );
                spawn_retention_sweep(&mut workers, &svc, rx);
                workers
            };
            server::run_server(svc, shutdown_signal()).await?;
            let _ = tx.send(true);
            while let Some(res) = workers.join_next().await {
                res.context("worker task panicked")?;
            }
        }
        Commands::Work { stage } => {
            let (tx, rx) = watch::channel(false);
            let mut workers = spawn_workers(
                &runners(&svc, stage),
                svc.config.pipeline.workers_per_stage,
                Duration::from_millis(svc.config.pipeline.poll_interval_ms),
                rx.clone(),
            );
            spawn_retention_sweep(&mut workers, &svc, rx);
            tracing::info!(
                workers_per_stage = svc.config.pipeline.workers_per_stage,
                "stage workers running"
            );
            shutdown_signal().await;
            let _ = tx.send(true);
            while let Some(res) = workers.join_next().await {
                res.context("worker task panicked")?;
            }
        }
        Commands::Upload {
            file,
            owner,
            title,
            mime,
        } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .unwrap_or_else(|| "upload".to_string());
            let mime_type = mime.unwrap_or_else(|| guess_mime(&file).to_string());
            let id = Coordinator::new(svc)
                .upload(Upload {
                    owner_id: owner,
                    title,
                    filename,
                    mime_type,
                    content,
                })
                .await?;
            println!("{}", id);
        }
        Commands::Status { id } => {
            let status = Coordinator::new(svc).status(&id).await?;
            println!("document: {}", status.document_id);
            println!("stage:    {}", status.stage);
            println!("progress: {}%", status.progress);
            if let Some(failed) = status.failed_stage {
                println!("failed during: {}", failed);
            }
            if let Some(err) = status.error {
                println!("error:    {}", err);
            }
            println!("updated:  {}", status.updated_at.to_rfc3339());
        }
        Commands::Search {
            query,
            owner,
            page,
            limit,
        } => {
            let results = SearchService::new(svc)
                .search(&owner, &query, Some(page), limit)
                .await?;
            if results.results.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in results.results.iter().enumerate() {
                    let rank = (results.page - 1) * results.limit + i as i64 + 1;
                    println!("{}. [{:.3}] {} ({})", rank, hit.score, hit.title, hit.document_id);
                    println!("    {}", hit.snippet.replace('\n', " "));
                }
                println!(
                    "page {} · {} of {} results",
                    results.page,
                    results.results.len(),
                    results.total
                );
            }
        }
        Commands::Ask { question, user } => {
            let answer = QueryEngine::new(svc).ask(&user, &question).await?;
            println!("{}", answer.answer);
            println!();
            println!("intent: {}", answer.intent.as_str());
            if !answer.entities.is_empty() {
                println!("entities: {}", answer.entities.join(", "));
            }
            if answer.grounded {
                println!("sources:");
                for s in &answer.sources {
                    println!("  [{:.3}] {} ({})", s.score, s.title, s.vector_id);
                }
            } else {
                println!("(no indexed documents matched; answer is not grounded)");
            }
        }
        Commands::Reprocess { id } => {
            Coordinator::new(svc).reprocess(&id).await?;
            println!("requeued {}", id);
        }
        Commands::Delete { id } => {
            Coordinator::new(svc).delete(&id).await?;
            println!("deleted {}", id);
        }
        Commands::DeadLetters { limit } => {
            if limit < 1 {
                bail!("--limit must be >= 1");
            }
            let dead = svc.bus.dead_letters(limit).await?;
            if dead.is_empty() {
                println!("No dead-lettered deliveries.");
            } else {
                println!(
                    "{:<10} {:<20} {:<38} {:<8} ERROR",
                    "GROUP", "EVENT", "DOCUMENT", "ATTEMPTS"
                );
                for d in dead {
                    println!(
                        "{:<10} {:<20} {:<38} {:<8} {}",
                        d.consumer,
                        d.kind,
                        d.document_id,
                        d.attempts,
                        d.last_error.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Prune { days } => {
            let keep = match days {
                Some(days) => Duration::from_secs(days.saturating_mul(86_400)),
                None => match svc.config.pipeline.retention() {
                    Some(keep) => keep,
                    None => {
                        println!("Retention is disabled (pipeline.retention_days = 0).");
                        return Ok(());
                    }
                },
            };
            let pruned = svc.bus.prune(keep).await?;
            println!(
                "pruned {} deliveries, {} events",
                pruned.deliveries, pruned.events
            );
        }
    }

    Ok(())
}
