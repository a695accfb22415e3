//! Embedding processors: EMBED_MISSING and EMBED_SUMMARIES.
//!
//! Both walk rows lacking embeddings in provider-sized batches and write
//! `pgvector` vectors. Re-running against already-covered rows is a no-op,
//! so replays are safe.

use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::PgConnection;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Processor, ProcessorContext};
use crate::clients::EmbeddingClient;
use crate::config::VectorIndexType;
use crate::db::schema::with_schema;
use crate::error::{CoreError, CoreResult};
use crate::jobs::job::Job;

/// Rows fetched per round; batching toward the provider happens inside the
/// client.
const FETCH_LIMIT: i64 = 256;

struct EmbedTarget {
    /// Table holding the source text.
    table: &'static str,
    /// Embedding table keyed by the source id.
    embedding_table: &'static str,
    id_column: &'static str,
    text_column: &'static str,
}

static CHUNKS: EmbedTarget = EmbedTarget {
    table: "chunk",
    embedding_table: "chunk_embedding",
    id_column: "chunk_id",
    text_column: "content",
};

static DOCUMENTS: EmbedTarget = EmbedTarget {
    table: "document",
    embedding_table: "document_embedding",
    id_column: "document_id",
    text_column: "content",
};

static SUMMARIES: EmbedTarget = EmbedTarget {
    table: "summary",
    embedding_table: "summary_embedding",
    id_column: "summary_id",
    text_column: "content",
};

async fn embed_target(
    conn: &mut PgConnection,
    client: &EmbeddingClient,
    target: &EmbedTarget,
) -> CoreResult<u64> {
    let mut written = 0u64;
    loop {
        let rows = sqlx::query(&format!(
            "SELECT s.id, s.{text} AS content \
             FROM {table} s \
             LEFT JOIN {etable} e ON e.{id_col} = s.id \
             WHERE e.{id_col} IS NULL \
             ORDER BY s.id \
             LIMIT $1",
            text = target.text_column,
            table = target.table,
            etable = target.embedding_table,
            id_col = target.id_column,
        ))
        .bind(FETCH_LIMIT)
        .fetch_all(&mut *conn)
        .await?;

        if rows.is_empty() {
            break;
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        let texts: Vec<String> = rows.iter().map(|r| r.get("content")).collect();
        let vectors = client
            .embed(&texts)
            .await
            .map_err(CoreError::Processor)?;

        for (id, vector) in ids.iter().zip(vectors) {
            sqlx::query(&format!(
                "INSERT INTO {etable} ({id_col}, embedding, model) VALUES ($1, $2, $3) \
                 ON CONFLICT ({id_col}) DO UPDATE \
                     SET embedding = EXCLUDED.embedding, model = EXCLUDED.model",
                etable = target.embedding_table,
                id_col = target.id_column,
            ))
            .bind(id)
            .bind(Vector::from(vector))
            .bind(client.model())
            .execute(&mut *conn)
            .await?;
            written += 1;
        }
    }
    Ok(written)
}

/// Recreate the approximate-nearest-neighbor index for one embedding table.
async fn rebuild_vector_index(
    conn: &mut PgConnection,
    target: &EmbedTarget,
    index_type: VectorIndexType,
) -> CoreResult<()> {
    let index_name = format!("idx_{}_vec", target.embedding_table);
    sqlx::query(&format!("DROP INDEX IF EXISTS {index_name}"))
        .execute(&mut *conn)
        .await?;
    let create = match index_type {
        VectorIndexType::Hnsw => format!(
            "CREATE INDEX {index_name} ON {} USING hnsw (embedding vector_cosine_ops)",
            target.embedding_table
        ),
        VectorIndexType::Ivfflat => format!(
            "CREATE INDEX {index_name} ON {} USING ivfflat (embedding vector_cosine_ops) \
             WITH (lists = 100)",
            target.embedding_table
        ),
    };
    sqlx::query(&create).execute(&mut *conn).await?;
    Ok(())
}

async fn maybe_rebuild_index(
    conn: &mut PgConnection,
    target: &EmbedTarget,
    written: u64,
    threshold: f64,
    index_type: VectorIndexType,
) -> CoreResult<()> {
    let total: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {}",
        target.embedding_table
    ))
    .fetch_one(&mut *conn)
    .await?;
    if total > 0 && written as f64 / total as f64 >= threshold {
        info!(
            table = target.embedding_table,
            written, total, "rebuilding vector index"
        );
        rebuild_vector_index(conn, target, index_type).await?;
    }
    Ok(())
}

async fn run_embed(
    ctx: &ProcessorContext,
    job: &Job,
    targets: &'static [&'static EmbedTarget],
) -> CoreResult<()> {
    let embeddings = &ctx.config.embeddings;
    if !embeddings.enabled {
        warn!(repo = %job.repo_name, "embeddings disabled; skipping");
        return Ok(());
    }
    let client = Arc::new(EmbeddingClient::new(embeddings).map_err(CoreError::Processor)?);
    let registration = ctx.registration(&job.repo_name).await?;
    let auto_rebuild = embeddings.auto_rebuild_indexes;
    let threshold = embeddings.rebuild_change_threshold;
    let index_type = embeddings.rebuild_index_type;

    let mut conn = ctx.pool.acquire().await?;
    for target in targets {
        let client = client.clone();
        let written = with_schema(&mut conn, &registration.schema_name, move |conn| {
            Box::pin(async move {
                let written = embed_target(conn, &client, target).await?;
                if auto_rebuild && written > 0 {
                    maybe_rebuild_index(conn, target, written, threshold, index_type).await?;
                }
                Ok(written)
            })
        })
        .await?;

        if written > 0 {
            info!(repo = %job.repo_name, table = target.table, written, "embedded rows");
        }
    }
    Ok(())
}

/// Embed chunks and documents lacking embeddings.
pub struct EmbedMissingProcessor {
    ctx: Arc<ProcessorContext>,
}

impl EmbedMissingProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

static MISSING_TARGETS: [&EmbedTarget; 2] = [&CHUNKS, &DOCUMENTS];

#[async_trait]
impl Processor for EmbedMissingProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        run_embed(&self.ctx, job, &MISSING_TARGETS).await
    }
}

/// Embed file/symbol/module summaries lacking embeddings.
pub struct EmbedSummariesProcessor {
    ctx: Arc<ProcessorContext>,
}

impl EmbedSummariesProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

static SUMMARY_TARGETS: [&EmbedTarget; 1] = [&SUMMARIES];

#[async_trait]
impl Processor for EmbedSummariesProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        run_embed(&self.ctx, job, &SUMMARY_TARGETS).await
    }
}
