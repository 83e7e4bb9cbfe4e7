//! tabula: operator tool for tabula document storage.
//!
//! Inspects and maintains a filesystem storage root, and runs an in-process
//! multi-session soak against the sync engine.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tabula_sync::{CancelToken, DocumentId, FsBackend, StorageBackend};

mod soak;

#[derive(Parser, Debug)]
#[command(name = "tabula")]
#[command(about = "Inspect and exercise tabula document storage")]
struct Args {
    /// Root directory of the durable store
    #[arg(short, long, default_value = ".tabula")]
    dir: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List known documents with record and session counts
    Ls,
    /// Print one document's schema and records as JSON
    Dump { document_id: String },
    /// List session snapshots for a document
    Sessions { document_id: String },
    /// Prune old session snapshots for a document
    Prune {
        document_id: String,
        /// Snapshots to keep
        #[arg(long, default_value_t = 10)]
        keep: usize,
    },
    /// Run an in-process multi-session soak and verify convergence
    Soak(soak::SoakArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Ls => ls(&args.dir).await,
        Command::Dump { document_id } => dump(&args.dir, &document_id).await,
        Command::Sessions { document_id } => sessions(&args.dir, &document_id).await,
        Command::Prune { document_id, keep } => prune(&args.dir, &document_id, keep).await,
        Command::Soak(soak_args) => soak::run(soak_args).await,
    }
}

fn parse_document_id(raw: &str) -> Result<DocumentId> {
    raw.parse()
        .with_context(|| format!("invalid document id {raw:?}"))
}

async fn ls(dir: &Path) -> Result<()> {
    let backend = FsBackend::new(dir);
    let cancel = CancelToken::new();
    let documents = backend.list_documents().await?;
    if documents.is_empty() {
        println!("no documents in {}", dir.display());
        return Ok(());
    }
    for id in documents {
        let records = backend
            .load(&id, &cancel)
            .await
            .with_context(|| format!("failed to load {id}"))?
            .map(|snapshot| snapshot.records.len())
            .unwrap_or(0);
        let sessions = backend.list_sessions(&id).await?.len();
        println!("{id}  {records} record(s), {sessions} session snapshot(s)");
    }
    Ok(())
}

async fn dump(dir: &Path, document_id: &str) -> Result<()> {
    let backend = FsBackend::new(dir);
    let id = parse_document_id(document_id)?;
    let snapshot = backend
        .load(&id, &CancelToken::new())
        .await?
        .with_context(|| format!("document {id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn sessions(dir: &Path, document_id: &str) -> Result<()> {
    let backend = FsBackend::new(dir);
    let id = parse_document_id(document_id)?;
    let sessions = backend.list_sessions(&id).await?;
    if sessions.is_empty() {
        println!("no session snapshots for {id}");
        return Ok(());
    }
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    for session in sessions {
        let age_s = now_ms.saturating_sub(session.updated_at_ms) / 1000;
        println!(
            "{}  {} record(s), updated {}s ago",
            session.session_id,
            session.records.len(),
            age_s
        );
    }
    Ok(())
}

async fn prune(dir: &Path, document_id: &str, keep: usize) -> Result<()> {
    let backend = FsBackend::new(dir);
    let id = parse_document_id(document_id)?;
    let before = backend.list_sessions(&id).await?.len();
    backend.prune_sessions(&id, keep, &CancelToken::new()).await?;
    let after = backend.list_sessions(&id).await?.len();
    println!("pruned {} session snapshot(s), {after} kept", before - after);
    Ok(())
}
