//! Command-line surface for the daemon and the one-shot management
//! operations.

pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::daemon::watcher::WatchedRoot;
use crate::daemon::{Daemon, RepoWatcher};
use crate::db::registry::{self, RepoRegistration};
use crate::db::schema;
use crate::jobs::dependencies::priority_for;
use crate::jobs::job::{Job, JobPayload, JobStatus, JobType};
use crate::jobs::processors::{embed, indexer, Processor, ProcessorContext};
use crate::jobs::queue::JobQueue;

#[derive(Debug, Parser)]
#[command(name = "codegraph", about = "Continuous code indexing daemon", version)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Database administration.
    #[command(subcommand)]
    Db(DbCommand),
    /// Register a repository and run a full index inline.
    Index {
        /// Repository root path.
        #[arg(long)]
        repo: PathBuf,
        /// Repository name.
        #[arg(long)]
        name: String,
        /// Drop and reinitialize an existing namespace.
        #[arg(long)]
        force: bool,
    },
    /// Repository registry operations.
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Run embedding generation inline.
    Embed {
        /// Repository name or id.
        #[arg(long)]
        repo_id: String,
        /// Only embed rows without embeddings (default). When absent,
        /// existing embeddings are dropped and regenerated.
        #[arg(long)]
        only_missing: bool,
    },
    /// Run the filesystem watcher standalone for one repository.
    Watch {
        /// Repository root path.
        #[arg(long)]
        repo: PathBuf,
        /// Repository name.
        #[arg(long)]
        name: String,
        /// Override the debounce window.
        #[arg(long)]
        debounce_ms: Option<u64>,
    },
    /// One-shot git-diff based reindex.
    Sync {
        /// Repository root path.
        #[arg(long)]
        repo: PathBuf,
        /// Base git ref to diff from.
        #[arg(long, conflicts_with = "patch_file")]
        base: Option<String>,
        /// Unified diff file to derive changes from.
        #[arg(long)]
        patch_file: Option<PathBuf>,
        /// Head git ref; defaults to the working tree.
        #[arg(long, requires = "base")]
        head: Option<String>,
    },
    /// Print index state and embedding coverage for a repository.
    Status {
        #[arg(long, conflicts_with = "name")]
        repo_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Daemon lifecycle.
    #[command(subcommand)]
    Daemon(DaemonCommand),
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Install the control schema DDL and required extensions.
    Init,
    /// Verify connectivity and extension availability.
    Ping,
}

#[derive(Debug, Subcommand)]
pub enum RepoCommand {
    /// List registered repositories and their counts.
    Ls,
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the supervisor in the foreground.
    Run,
}

impl Cli {
    /// Whether this invocation runs the long-lived supervisor, which owns
    /// its own signal handling.
    pub fn is_daemon(&self) -> bool {
        matches!(self.command, Command::Daemon(DaemonCommand::Run))
    }
}

async fn connect(config: &CoreConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database.pool_size)
        .acquire_timeout(Duration::from_secs(config.database.pool_timeout))
        .connect(&config.database.control_dsn)
        .await
        .context("failed to connect to the store")
}

/// A synthetic claimed job for inline (non-queued) processor runs.
fn inline_job(
    registration: &RepoRegistration,
    job_type: JobType,
    payload: serde_json::Value,
) -> Job {
    Job {
        id: Uuid::new_v4(),
        repo_name: registration.name.clone(),
        schema_name: registration.schema_name.clone(),
        job_type,
        payload,
        priority: priority_for(job_type),
        status: JobStatus::Claimed,
        attempts: 1,
        max_attempts: 1,
        claimed_by: Some("cli".to_string()),
        claimed_at: Some(Utc::now()),
        run_after: Utc::now(),
        created_at: Utc::now(),
        completed_at: None,
        error: None,
        dedup_key: None,
    }
}

async fn resolve_or_suggest(pool: &PgPool, repo_or_id: &str) -> Result<(Uuid, String)> {
    match schema::resolve_with_suggestions(pool, repo_or_id).await? {
        Ok(found) => Ok(found),
        Err(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            bail!("repository '{repo_or_id}' not found");
        }
    }
}

/// Find the registration whose root path matches the given directory.
async fn registration_for_path(pool: &PgPool, path: &PathBuf) -> Result<RepoRegistration> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("path does not exist: {}", path.display()))?;
    let repos = RepoRegistration::list(pool).await?;
    repos
        .into_iter()
        .find(|r| {
            PathBuf::from(&r.root_path)
                .canonicalize()
                .map(|root| root == canonical)
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            anyhow!(
                "no registered repository with root {}; register it with `codegraph index`",
                path.display()
            )
        })
}

/// Execute a parsed command. The caller handles process exit codes.
pub async fn run(cli: Cli, config: CoreConfig) -> Result<()> {
    match cli.command {
        Command::Db(db) => run_db(db, &config).await,
        Command::Index { repo, name, force } => run_index(&config, repo, name, force).await,
        Command::Repo(RepoCommand::Ls) => run_repo_ls(&config).await,
        Command::Embed {
            repo_id,
            only_missing,
        } => run_embed(&config, &repo_id, only_missing).await,
        Command::Watch {
            repo,
            name,
            debounce_ms,
        } => run_watch(config, repo, name, debounce_ms).await,
        Command::Sync {
            repo,
            base,
            patch_file,
            head,
        } => run_sync(&config, repo, base, patch_file, head).await,
        Command::Status { repo_id, name } => run_status(&config, repo_id, name).await,
        Command::Daemon(DaemonCommand::Run) => {
            let daemon = Daemon::startup(config).await?;
            daemon.run().await?;
            Ok(())
        }
    }
}

async fn run_db(command: DbCommand, config: &CoreConfig) -> Result<()> {
    let pool = connect(config).await?;
    match command {
        DbCommand::Init => {
            schema::ensure_control_schema(&pool).await?;
            println!("control schema installed");
        }
        DbCommand::Ping => {
            let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await?;
            let vector_available: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM pg_available_extensions WHERE name = 'vector')",
            )
            .fetch_one(&pool)
            .await?;
            let control_installed: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM information_schema.schemata \
                 WHERE schema_name = $1)",
            )
            .bind(schema::CONTROL_SCHEMA)
            .fetch_one(&pool)
            .await?;

            println!("store: ok ({one})");
            println!("vector extension available: {vector_available}");
            println!("control schema installed: {control_installed}");
            if !vector_available {
                bail!("pgvector extension is not available on this server");
            }
        }
    }
    Ok(())
}

async fn run_index(config: &CoreConfig, repo: PathBuf, name: String, force: bool) -> Result<()> {
    let pool = connect(config).await?;
    schema::ensure_control_schema(&pool).await?;

    let root = repo
        .canonicalize()
        .with_context(|| format!("path does not exist: {}", repo.display()))?;
    let registration = registry::register_repo(
        &pool,
        &name,
        &root.to_string_lossy(),
        config.embeddings.dimension,
        force,
    )
    .await?;
    println!(
        "registered repo '{}' -> schema '{}'",
        registration.name, registration.schema_name
    );

    let ctx = ProcessorContext::new(pool, Arc::new(config.clone()));
    let processor = indexer::FullIndexProcessor::new(Arc::new(ctx));
    let job = inline_job(
        &registration,
        JobType::FullIndex,
        JobPayload::FullIndex { force }.to_value(),
    );
    processor.process(&job).await?;
    println!("full index complete for '{name}'");
    Ok(())
}

async fn run_repo_ls(config: &CoreConfig) -> Result<()> {
    let pool = connect(config).await?;
    let repos = schema::list_repos(&pool).await?;
    if repos.is_empty() {
        println!("no repositories registered");
        return Ok(());
    }

    println!(
        "{:<24} {:<32} {:>7} {:>8} {:>7}  last indexed",
        "NAME", "SCHEMA", "FILES", "SYMBOLS", "CHUNKS"
    );
    for repo in repos {
        println!(
            "{:<24} {:<32} {:>7} {:>8} {:>7}  {}",
            repo.repo_name,
            repo.schema_name,
            repo.file_count,
            repo.symbol_count,
            repo.chunk_count,
            repo.last_indexed_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}

async fn run_embed(config: &CoreConfig, repo_id: &str, only_missing: bool) -> Result<()> {
    let pool = connect(config).await?;
    let (_, schema_name) = resolve_or_suggest(&pool, repo_id).await?;

    let repos = RepoRegistration::list(&pool).await?;
    let registration = repos
        .into_iter()
        .find(|r| r.schema_name == schema_name)
        .ok_or_else(|| anyhow!("repository '{repo_id}' is not registered"))?;

    if !only_missing {
        // Full regeneration: drop coverage first, then backfill.
        let mut conn = pool.acquire().await?;
        schema::with_schema(&mut conn, &schema_name, |conn| {
            Box::pin(async move {
                sqlx::query("DELETE FROM chunk_embedding").execute(&mut *conn).await?;
                sqlx::query("DELETE FROM document_embedding").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .await?;
        info!(repo = %registration.name, "dropped existing embeddings for full regeneration");
    }

    let ctx = ProcessorContext::new(pool, Arc::new(config.clone()));
    let processor = embed::EmbedMissingProcessor::new(Arc::new(ctx));
    let job = inline_job(&registration, JobType::EmbedMissing, json!({}));
    processor.process(&job).await?;
    println!("embedding run complete for '{}'", registration.name);
    Ok(())
}

async fn run_watch(
    mut config: CoreConfig,
    repo: PathBuf,
    name: String,
    debounce_ms: Option<u64>,
) -> Result<()> {
    if let Some(debounce) = debounce_ms {
        config.watcher.debounce_ms = debounce;
    }
    let pool = connect(&config).await?;
    let registration = RepoRegistration::find_by_name(&pool, &name)
        .await?
        .ok_or_else(|| anyhow!("repository '{name}' is not registered; run `codegraph index` first"))?;

    let root = repo
        .canonicalize()
        .with_context(|| format!("path does not exist: {}", repo.display()))?;
    let queue = JobQueue::new(pool, config.jobs.clone());
    let watcher = RepoWatcher::new(config.watcher.clone(), queue);
    let roots = vec![WatchedRoot {
        repo_name: registration.name.clone(),
        schema_name: registration.schema_name.clone(),
        root,
    }];

    println!("watching '{name}' - press Ctrl-C to stop");
    watcher.run_with(roots, CancellationToken::new()).await?;
    Ok(())
}

async fn run_sync(
    config: &CoreConfig,
    repo: PathBuf,
    base: Option<String>,
    patch_file: Option<PathBuf>,
    head: Option<String>,
) -> Result<()> {
    let pool = connect(config).await?;
    let registration = registration_for_path(&pool, &repo).await?;

    let changes = match (&base, &patch_file) {
        (Some(base), None) => sync::changes_from_git(&repo, base, head.as_deref())?,
        (None, Some(patch)) => {
            let text = std::fs::read_to_string(patch)
                .with_context(|| format!("cannot read patch file: {}", patch.display()))?;
            sync::changes_from_patch(&text)?
        }
        _ => bail!("sync requires exactly one of --base or --patch-file"),
    };

    if changes.is_empty() {
        println!("no changes to sync");
        return Ok(());
    }
    println!("syncing {} changed paths", changes.len());

    let ctx = ProcessorContext::new(pool, Arc::new(config.clone()));
    let processor = indexer::ReindexManyProcessor::new(Arc::new(ctx));
    let payload = json!({ "paths": changes, "reason": "sync" });
    let job = inline_job(&registration, JobType::ReindexMany, payload);
    processor.process(&job).await?;
    println!("sync complete for '{}'", registration.name);
    Ok(())
}

async fn run_status(
    config: &CoreConfig,
    repo_id: Option<String>,
    name: Option<String>,
) -> Result<()> {
    let lookup = repo_id
        .or(name)
        .ok_or_else(|| anyhow!("status requires --repo-id or --name"))?;

    let pool = connect(config).await?;
    let (resolved_id, schema_name) = resolve_or_suggest(&pool, &lookup).await?;

    let repos = schema::list_repos(&pool).await?;
    let info = repos
        .into_iter()
        .find(|r| r.repo_id == resolved_id)
        .ok_or_else(|| anyhow!("repository state not found for '{lookup}'"))?;

    let coverage = crate::daemon::health::embedding_coverage(&pool, &schema_name).await?;
    let queue = JobQueue::new(pool.clone(), config.jobs.clone());
    let stats = queue.stats(Some(&info.repo_name)).await?;

    println!("repo:       {} ({})", info.repo_name, info.repo_id);
    println!("schema:     {}", info.schema_name);
    println!("root:       {}", info.root_path);
    println!(
        "indexed:    {}",
        info.last_indexed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "counts:     files={} symbols={} chunks={}",
        info.file_count, info.symbol_count, info.chunk_count
    );
    println!(
        "embeddings: chunks {:.1}% ({}/{}), docs {:.1}% ({}/{})",
        coverage.chunk_pct(),
        coverage.embedded_chunks,
        coverage.total_chunks,
        coverage.doc_pct(),
        coverage.embedded_docs,
        coverage.total_docs
    );
    println!(
        "queue:      pending={} claimed={} done={} failed={}",
        stats.pending, stats.claimed, stats.done, stats.failed
    );
    Ok(())
}
