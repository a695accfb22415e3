//! Summary processors: SUMMARIZE_FILES, SUMMARIZE_SYMBOLS and the
//! comprehensive-review REGENERATE_SUMMARY.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnection;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Processor, ProcessorContext};
use crate::clients::{LlmClient, ModelTier};
use crate::db::schema::with_schema;
use crate::error::{CoreError, CoreResult};
use crate::jobs::job::Job;

/// Targets summarized per job run; the periodic scheduler re-enqueues until
/// coverage is complete.
const FILES_PER_RUN: i64 = 25;
const SYMBOLS_PER_RUN: i64 = 50;

/// Content prefix handed to the model per target.
const PROMPT_CONTENT_CHARS: usize = 4000;

fn clip(content: &str) -> &str {
    match content.char_indices().nth(PROMPT_CONTENT_CHARS) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

fn build_client(ctx: &ProcessorContext) -> CoreResult<Option<Arc<LlmClient>>> {
    match &ctx.config.llm {
        Some(llm) if llm.enabled => Ok(Some(Arc::new(
            LlmClient::new(llm).map_err(CoreError::Processor)?,
        ))),
        _ => Ok(None),
    }
}

async fn upsert_summary(
    conn: &mut PgConnection,
    repo_id: Uuid,
    target_kind: &str,
    target_id: Uuid,
    content: &str,
    model: &str,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO summary (repo_id, target_kind, target_id, content, model) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (target_kind, target_id) DO UPDATE \
             SET content = EXCLUDED.content, model = EXCLUDED.model, created_at = now()",
    )
    .bind(repo_id)
    .bind(target_kind)
    .bind(target_id)
    .bind(content)
    .bind(model)
    .execute(conn)
    .await?;
    Ok(())
}

async fn repo_id_for(conn: &mut PgConnection, repo_name: &str) -> CoreResult<Uuid> {
    let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM repo WHERE name = $1")
        .bind(repo_name)
        .fetch_optional(conn)
        .await?;
    id.ok_or_else(|| CoreError::NamespaceMissing(repo_name.to_string()))
}

/// Generate summaries for files that don't have one yet.
pub struct SummarizeFilesProcessor {
    ctx: Arc<ProcessorContext>,
}

impl SummarizeFilesProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for SummarizeFilesProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        let Some(client) = build_client(&self.ctx)? else {
            warn!(repo = %job.repo_name, "llm disabled; skipping file summaries");
            return Ok(());
        };
        let registration = self.ctx.registration(&job.repo_name).await?;
        let repo_name = job.repo_name.clone();

        let mut conn = self.ctx.pool.acquire().await?;
        let written = with_schema(&mut conn, &registration.schema_name, move |conn| {
            Box::pin(async move {
                let repo_id = repo_id_for(conn, &repo_name).await?;
                let rows = sqlx::query(
                    "SELECT f.id, f.path, \
                            (SELECT string_agg(c.content, E'\\n') \
                             FROM chunk c WHERE c.file_id = f.id) AS content \
                     FROM file f \
                     LEFT JOIN summary s ON s.target_kind = 'file' AND s.target_id = f.id \
                     WHERE s.id IS NULL \
                     ORDER BY f.path \
                     LIMIT $1",
                )
                .bind(FILES_PER_RUN)
                .fetch_all(&mut *conn)
                .await?;

                let mut written = 0usize;
                for row in rows {
                    let file_id: Uuid = row.get("id");
                    let path: String = row.get("path");
                    let content: Option<String> = row.get("content");
                    let prompt = format!(
                        "Summarize the purpose of the source file `{path}` in 2-3 sentences.\n\n{}",
                        clip(content.as_deref().unwrap_or_default())
                    );
                    let summary = client
                        .generate(ModelTier::Small, &prompt)
                        .await
                        .map_err(CoreError::Processor)?;
                    upsert_summary(
                        conn,
                        repo_id,
                        "file",
                        file_id,
                        summary.trim(),
                        client.model_name(ModelTier::Small),
                    )
                    .await?;
                    written += 1;
                }
                Ok(written)
            })
        })
        .await?;

        info!(repo = %job.repo_name, written, "file summaries generated");
        Ok(())
    }
}

/// Generate summaries for symbols that don't have one yet.
pub struct SummarizeSymbolsProcessor {
    ctx: Arc<ProcessorContext>,
}

impl SummarizeSymbolsProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for SummarizeSymbolsProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        let Some(client) = build_client(&self.ctx)? else {
            warn!(repo = %job.repo_name, "llm disabled; skipping symbol summaries");
            return Ok(());
        };
        let registration = self.ctx.registration(&job.repo_name).await?;
        let repo_name = job.repo_name.clone();

        let mut conn = self.ctx.pool.acquire().await?;
        let written = with_schema(&mut conn, &registration.schema_name, move |conn| {
            Box::pin(async move {
                let repo_id = repo_id_for(conn, &repo_name).await?;
                let rows = sqlx::query(
                    "SELECT sym.id, sym.name, sym.kind, f.path, \
                            (SELECT string_agg(c.content, E'\\n') \
                             FROM chunk c WHERE c.file_id = f.id \
                               AND c.start_line <= sym.end_line \
                               AND c.end_line >= sym.start_line) AS context \
                     FROM symbol sym \
                     JOIN file f ON f.id = sym.file_id \
                     LEFT JOIN summary s ON s.target_kind = 'symbol' AND s.target_id = sym.id \
                     WHERE s.id IS NULL \
                     ORDER BY f.path, sym.start_line \
                     LIMIT $1",
                )
                .bind(SYMBOLS_PER_RUN)
                .fetch_all(&mut *conn)
                .await?;

                let mut written = 0usize;
                for row in rows {
                    let symbol_id: Uuid = row.get("id");
                    let name: String = row.get("name");
                    let kind: String = row.get("kind");
                    let path: String = row.get("path");
                    let context: Option<String> = row.get("context");
                    let prompt = format!(
                        "Summarize what the {kind} `{name}` in `{path}` does, in one sentence.\n\n{}",
                        clip(context.as_deref().unwrap_or_default())
                    );
                    let summary = client
                        .generate(ModelTier::Small, &prompt)
                        .await
                        .map_err(CoreError::Processor)?;
                    upsert_summary(
                        conn,
                        repo_id,
                        "symbol",
                        symbol_id,
                        summary.trim(),
                        client.model_name(ModelTier::Small),
                    )
                    .await?;
                    written += 1;
                }
                Ok(written)
            })
        })
        .await?;

        info!(repo = %job.repo_name, written, "symbol summaries generated");
        Ok(())
    }
}

/// Regenerate the comprehensive repo review document.
pub struct RegenerateSummaryProcessor {
    ctx: Arc<ProcessorContext>,
}

impl RegenerateSummaryProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for RegenerateSummaryProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        let Some(client) = build_client(&self.ctx)? else {
            warn!(repo = %job.repo_name, "llm disabled; skipping summary regeneration");
            return Ok(());
        };
        let registration = self.ctx.registration(&job.repo_name).await?;
        let repo_name = job.repo_name.clone();

        let mut conn = self.ctx.pool.acquire().await?;
        with_schema(&mut conn, &registration.schema_name, move |conn| {
            Box::pin(async move {
                let repo_id = repo_id_for(conn, &repo_name).await?;

                let stats = sqlx::query(
                    "SELECT COALESCE(file_count, 0) AS files, \
                            COALESCE(symbol_count, 0) AS symbols, \
                            COALESCE(chunk_count, 0) AS chunks \
                     FROM repo_index_state WHERE repo_id = $1",
                )
                .bind(repo_id)
                .fetch_optional(&mut *conn)
                .await?;
                let (files, symbols): (i32, i32) = stats
                    .map(|r| (r.get("files"), r.get("symbols")))
                    .unwrap_or((0, 0));

                let paths: Vec<String> = sqlx::query_scalar(
                    "SELECT path FROM file WHERE repo_id = $1 ORDER BY size_bytes DESC LIMIT 40",
                )
                .bind(repo_id)
                .fetch_all(&mut *conn)
                .await?;

                let prompt = format!(
                    "Write a comprehensive architecture review of the repository `{repo_name}` \
                     ({files} files, {symbols} symbols). Its largest files are:\n{}",
                    paths.join("\n")
                );
                let review = client
                    .generate(ModelTier::Deep, &prompt)
                    .await
                    .map_err(CoreError::Processor)?;

                let mut hasher = Sha256::new();
                hasher.update(review.as_bytes());
                let hash = format!("{:x}", hasher.finalize());

                // One review document per repo; replace the previous run.
                sqlx::query(
                    "DELETE FROM document WHERE repo_id = $1 AND type = 'comprehensive_review'",
                )
                .bind(repo_id)
                .execute(&mut *conn)
                .await?;
                sqlx::query(
                    "INSERT INTO document (repo_id, path, type, title, content, content_hash) \
                     VALUES ($1, NULL, 'comprehensive_review', $2, $3, $4)",
                )
                .bind(repo_id)
                .bind(format!("Architecture review: {repo_name}"))
                .bind(review.trim())
                .bind(&hash)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await?;

        info!(repo = %job.repo_name, "comprehensive review regenerated");
        Ok(())
    }
}
