//! Health monitor: periodic self-healing.
//!
//! The store is the source of truth, so coverage gaps and stuck claims can
//! both be detected and repaired by enqueueing jobs or rewriting rows.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::json;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::registry::RepoRegistration;
use crate::db::schema::with_schema;
use crate::error::CoreResult;
use crate::jobs::job::JobType;
use crate::jobs::queue::JobQueue;

/// Coverage below this fraction triggers a repair job.
const COVERAGE_THRESHOLD: f64 = 95.0;

/// CLAIMED rows older than this are considered stuck.
const STUCK_THRESHOLD_MINUTES: i64 = 30;

/// Default time between health ticks.
const CHECK_INTERVAL: Duration = Duration::from_secs(900);

/// Sleep after a failed tick before retrying.
const ERROR_RETRY: Duration = Duration::from_secs(60);

const HEALTH_DEDUP_SUFFIX: &str = "embed_missing:health_check";

/// Embedding coverage for one repo.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingCoverage {
    pub total_chunks: i64,
    pub embedded_chunks: i64,
    pub total_docs: i64,
    pub embedded_docs: i64,
}

impl EmbeddingCoverage {
    /// Percent of chunks embedded; an empty table counts as full coverage.
    pub fn chunk_pct(&self) -> f64 {
        if self.total_chunks == 0 {
            100.0
        } else {
            self.embedded_chunks as f64 / self.total_chunks as f64 * 100.0
        }
    }

    pub fn doc_pct(&self) -> f64 {
        if self.total_docs == 0 {
            100.0
        } else {
            self.embedded_docs as f64 / self.total_docs as f64 * 100.0
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.chunk_pct() < COVERAGE_THRESHOLD || self.doc_pct() < COVERAGE_THRESHOLD
    }
}

/// Read embedding coverage for a repo schema. Shared with the status CLI.
pub async fn embedding_coverage(pool: &PgPool, schema_name: &str) -> CoreResult<EmbeddingCoverage> {
    let mut conn = pool.acquire().await?;
    with_schema(&mut conn, schema_name, |conn| {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT \
                     (SELECT COUNT(*) FROM chunk) AS total_chunks, \
                     (SELECT COUNT(*) FROM chunk_embedding) AS embedded_chunks, \
                     (SELECT COUNT(*) FROM document) AS total_docs, \
                     (SELECT COUNT(*) FROM document_embedding) AS embedded_docs",
            )
            .fetch_one(conn)
            .await?;
            Ok(EmbeddingCoverage {
                total_chunks: row.get("total_chunks"),
                embedded_chunks: row.get("embedded_chunks"),
                total_docs: row.get("total_docs"),
                embedded_docs: row.get("embedded_docs"),
            })
        })
    })
    .await
}

/// Write an entry into the control-schema system log.
pub async fn log_to_system(
    pool: &PgPool,
    level: &str,
    component: &str,
    repo_name: Option<&str>,
    message: &str,
    details: serde_json::Value,
) {
    let result = sqlx::query(
        "INSERT INTO codegraph_control.system_log (level, component, repo_name, message, details) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(level)
    .bind(component)
    .bind(repo_name)
    .bind(message)
    .bind(details)
    .execute(pool)
    .await;
    if let Err(e) = result {
        error!(error = %e, "failed to write to system_log");
    }
}

/// Monitors system health and auto-remediates issues.
pub struct HealthMonitor {
    pool: PgPool,
    queue: JobQueue,
    check_interval: Duration,
}

impl HealthMonitor {
    pub fn new(pool: PgPool, queue: JobQueue) -> Self {
        Self {
            pool,
            queue,
            check_interval: CHECK_INTERVAL,
        }
    }

    /// Run one full health tick.
    pub async fn run_health_checks(&self) -> CoreResult<()> {
        self.check_embedding_health().await?;
        self.check_stuck_jobs().await?;
        Ok(())
    }

    /// For each registered repo, enqueue a repair EMBED_MISSING when
    /// coverage dropped below the threshold and no repair is in flight.
    pub async fn check_embedding_health(&self) -> CoreResult<()> {
        let repos = RepoRegistration::list(&self.pool).await?;
        for repo in repos {
            let coverage = match embedding_coverage(&self.pool, &repo.schema_name).await {
                Ok(coverage) => coverage,
                Err(e) => {
                    error!(repo = %repo.name, error = %e, "embedding coverage check failed");
                    continue;
                }
            };

            if !coverage.is_degraded() {
                continue;
            }

            let missing_chunks = coverage.total_chunks - coverage.embedded_chunks;
            let missing_docs = coverage.total_docs - coverage.embedded_docs;
            warn!(
                repo = %repo.name,
                chunk_pct = format!("{:.1}", coverage.chunk_pct()),
                doc_pct = format!("{:.1}", coverage.doc_pct()),
                "repo has missing embeddings"
            );

            let dedup_key = format!("{}:{HEALTH_DEDUP_SUFFIX}", repo.name);
            if self
                .queue
                .has_pending(&repo.name, JobType::EmbedMissing, &dedup_key)
                .await?
            {
                info!(repo = %repo.name, "embedding repair already in flight");
                continue;
            }

            self.queue
                .enqueue(
                    &repo.name,
                    &repo.schema_name,
                    JobType::EmbedMissing,
                    json!({}),
                    4,
                    Some(&dedup_key),
                )
                .await?;

            log_to_system(
                &self.pool,
                "WARNING",
                "health_monitor",
                Some(&repo.name),
                "Auto-scheduled EMBED_MISSING job due to coverage gap",
                json!({
                    "chunk_coverage": (coverage.chunk_pct() * 10.0).round() / 10.0,
                    "doc_coverage": (coverage.doc_pct() * 10.0).round() / 10.0,
                    "missing_chunks": missing_chunks,
                    "missing_docs": missing_docs,
                    "action": "enqueued_embed_job",
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Release CLAIMED rows whose owner went away. Attempts are not
    /// incremented; claim already counted them.
    pub async fn check_stuck_jobs(&self) -> CoreResult<()> {
        let released = self
            .queue
            .release_stuck(ChronoDuration::minutes(STUCK_THRESHOLD_MINUTES))
            .await?;

        for job in released {
            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                repo = %job.repo_name,
                was_claimed_by = job.claimed_by.as_deref().unwrap_or("unknown"),
                "auto-released stuck job"
            );
            log_to_system(
                &self.pool,
                "WARNING",
                "health_monitor",
                Some(&job.repo_name),
                &format!("Auto-released stuck job: {}", job.job_type),
                json!({
                    "job_id": job.id,
                    "job_type": job.job_type,
                    "claimed_by": job.claimed_by,
                    "action": "auto_released",
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Main monitoring loop; failures are logged and the loop sleeps
    /// briefly before the next attempt.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_sec = self.check_interval.as_secs(), "health monitor started");

        loop {
            let delay = match self.run_health_checks().await {
                Ok(()) => self.check_interval,
                Err(e) => {
                    error!(error = %e, "health check failed");
                    ERROR_RETRY
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tables_count_as_full_coverage() {
        let coverage = EmbeddingCoverage::default();
        assert_eq!(coverage.chunk_pct(), 100.0);
        assert_eq!(coverage.doc_pct(), 100.0);
        assert!(!coverage.is_degraded());
    }

    #[test]
    fn degraded_below_ninety_five_percent() {
        let coverage = EmbeddingCoverage {
            total_chunks: 100,
            embedded_chunks: 94,
            total_docs: 10,
            embedded_docs: 10,
        };
        assert!(coverage.is_degraded());

        let healthy = EmbeddingCoverage {
            total_chunks: 100,
            embedded_chunks: 95,
            total_docs: 10,
            embedded_docs: 10,
        };
        assert!(!healthy.is_degraded());
    }
}
