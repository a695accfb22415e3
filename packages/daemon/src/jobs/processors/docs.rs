//! DOCS_SCAN processor: ingest documentation files into document rows.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;
use walkdir::WalkDir;

use super::{indexer, Processor, ProcessorContext};
use crate::db::schema::with_schema;
use crate::error::{CoreError, CoreResult};
use crate::jobs::job::Job;

const DOC_EXTENSIONS: &[&str] = &["md", "rst", "txt"];

#[derive(Debug, Clone)]
struct ScannedDoc {
    rel_path: String,
    title: Option<String>,
    content: String,
    content_hash: String,
}

fn title_of(content: &str) -> Option<String> {
    content
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn scan_docs(root: PathBuf, ignore_patterns: Vec<String>) -> CoreResult<Vec<ScannedDoc>> {
    let docs = tokio::task::spawn_blocking(move || {
        let mut docs = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let supported = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| DOC_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if !supported {
                continue;
            }
            let rel_path = match entry.path().strip_prefix(&root) {
                Ok(rel) => rel.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if indexer::is_ignored(&rel_path, &ignore_patterns) {
                continue;
            }
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(_) => continue,
            };
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            docs.push(ScannedDoc {
                title: title_of(&content),
                content_hash: format!("{:x}", hasher.finalize()),
                rel_path,
                content,
            });
        }
        docs.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        docs
    })
    .await
    .map_err(|e| CoreError::Processor(anyhow::anyhow!("doc scan task failed: {e}")))?;

    Ok(docs)
}

pub struct DocsScanProcessor {
    ctx: Arc<ProcessorContext>,
}

impl DocsScanProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for DocsScanProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        let registration = self.ctx.registration(&job.repo_name).await?;
        let docs = scan_docs(
            PathBuf::from(&registration.root_path),
            self.ctx.config.watcher.ignore_patterns.clone(),
        )
        .await?;

        let repo_name = job.repo_name.clone();
        let mut conn = self.ctx.pool.acquire().await?;
        let ingested = with_schema(&mut conn, &registration.schema_name, |conn| {
            Box::pin(async move {
                let repo_id: Option<Uuid> =
                    sqlx::query_scalar("SELECT id FROM repo WHERE name = $1")
                        .bind(&repo_name)
                        .fetch_optional(&mut *conn)
                        .await?;
                let repo_id = repo_id.ok_or(CoreError::NamespaceMissing(repo_name))?;

                let mut ingested = 0usize;
                for doc in &docs {
                    let result = sqlx::query(
                        "INSERT INTO document (repo_id, path, type, title, content, content_hash) \
                         VALUES ($1, $2, 'doc', $3, $4, $5) \
                         ON CONFLICT (repo_id, type, path) WHERE path IS NOT NULL \
                         DO UPDATE SET \
                             title = EXCLUDED.title, \
                             content = EXCLUDED.content, \
                             content_hash = EXCLUDED.content_hash \
                         WHERE document.content_hash <> EXCLUDED.content_hash",
                    )
                    .bind(repo_id)
                    .bind(&doc.rel_path)
                    .bind(&doc.title)
                    .bind(&doc.content)
                    .bind(&doc.content_hash)
                    .execute(&mut *conn)
                    .await?;
                    ingested += result.rows_affected() as usize;
                }

                // Drop documents whose source files are gone.
                let seen: Vec<String> = docs.iter().map(|d| d.rel_path.clone()).collect();
                sqlx::query(
                    "DELETE FROM document \
                     WHERE repo_id = $1 AND type = 'doc' AND path IS NOT NULL \
                       AND path <> ALL($2)",
                )
                .bind(repo_id)
                .bind(&seen)
                .execute(&mut *conn)
                .await?;

                Ok(ingested)
            })
        })
        .await?;

        info!(repo = %job.repo_name, ingested, "docs scan complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_first_non_empty_line_without_hashes() {
        assert_eq!(
            title_of("# Getting Started\n\nbody"),
            Some("Getting Started".to_string())
        );
        assert_eq!(title_of("\n\nplain title\n"), Some("plain title".to_string()));
        assert_eq!(title_of(""), None);
    }
}
