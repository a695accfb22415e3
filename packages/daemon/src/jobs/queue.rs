//! PostgreSQL-backed durable job queue.
//!
//! Multi-writer/multi-reader with priority ordering, deduplication, atomic
//! claiming via `FOR UPDATE SKIP LOCKED`, and retry with exponential
//! backoff. The queue exclusively owns transitions of
//! `status/attempts/claimed_*/completed_at/error`; processors never touch
//! job rows directly.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{Job, JobType};
use crate::config::JobsConfig;
use crate::error::CoreResult;

/// Longest a retried job can be pushed out, regardless of attempt count.
const MAX_BACKOFF_SECS: i64 = 3600;

const JOB_COLUMNS: &str = "id, repo_name, schema_name, job_type, payload, priority, status, \
     attempts, max_attempts, claimed_by, claimed_at, run_after, created_at, \
     completed_at, error, dedup_key";

/// Result of an enqueue that handles deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new row was inserted.
    Created(Uuid),
    /// A non-terminal row with the same dedup key already exists.
    Deduplicated,
}

impl EnqueueResult {
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Counts by status for the RPC/status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub claimed: i64,
    pub done: i64,
    pub failed: i64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Condensed job row for listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobSummary {
    pub id: Uuid,
    pub repo_name: String,
    pub job_type: JobType,
    pub status: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A job released by the stuck-job sweep, for logging.
#[derive(Debug, Clone)]
pub struct ReleasedJob {
    pub id: Uuid,
    pub repo_name: String,
    pub job_type: JobType,
    pub claimed_by: Option<String>,
}

/// Manages job queue operations against the control namespace.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    config: JobsConfig,
}

impl JobQueue {
    pub fn new(pool: PgPool, config: JobsConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a new job.
    ///
    /// When `dedup_key` is set and a non-terminal row with the same
    /// `(repo_name, job_type, dedup_key)` exists, nothing is inserted. The
    /// lookup is advisory; the partial unique index absorbs concurrent
    /// races, which surface here as `Deduplicated` too.
    pub async fn enqueue(
        &self,
        repo_name: &str,
        schema_name: &str,
        job_type: JobType,
        payload: Value,
        priority: i32,
        dedup_key: Option<&str>,
    ) -> CoreResult<EnqueueResult> {
        if let Some(key) = dedup_key {
            let existing: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM codegraph_control.job_queue \
                 WHERE repo_name = $1 AND job_type = $2 AND dedup_key = $3 \
                   AND status IN ('PENDING', 'CLAIMED')",
            )
            .bind(repo_name)
            .bind(job_type)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if existing.is_some() {
                debug!(%job_type, repo = repo_name, dedup_key = key, "job deduplicated");
                return Ok(EnqueueResult::Deduplicated);
            }
        }

        let inserted: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO codegraph_control.job_queue \
                 (repo_name, schema_name, job_type, payload, priority, max_attempts, dedup_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (repo_name, job_type, dedup_key) \
                 WHERE dedup_key IS NOT NULL AND status IN ('PENDING', 'CLAIMED') \
                 DO NOTHING \
             RETURNING id",
        )
        .bind(repo_name)
        .bind(schema_name)
        .bind(job_type)
        .bind(&payload)
        .bind(priority)
        .bind(self.config.max_retries)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(id) => {
                info!(job_id = %id, %job_type, repo = repo_name, priority, "enqueued job");
                Ok(EnqueueResult::Created(id))
            }
            None => {
                debug!(%job_type, repo = repo_name, "job deduplicated under race");
                Ok(EnqueueResult::Deduplicated)
            }
        }
    }

    /// Atomically claim up to `limit` ready jobs for `worker_id`.
    ///
    /// Locked rows are skipped so concurrent claimers never serialize on
    /// each other and always receive disjoint sets. Claiming increments
    /// `attempts`.
    pub async fn claim(
        &self,
        worker_id: &str,
        allowed_types: Option<&[JobType]>,
        limit: i64,
        for_repo: Option<&str>,
    ) -> CoreResult<Vec<Job>> {
        let type_names: Option<Vec<String>> =
            allowed_types.map(|ts| ts.iter().map(|t| t.as_str().to_string()).collect());

        let jobs = sqlx::query_as::<_, Job>(&format!(
            "WITH next_jobs AS ( \
                 SELECT id FROM codegraph_control.job_queue \
                 WHERE status = 'PENDING' \
                   AND run_after <= now() \
                   AND ($2::text[] IS NULL OR job_type = ANY($2)) \
                   AND ($3::text IS NULL OR repo_name = $3) \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT $4 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE codegraph_control.job_queue q \
             SET status = 'CLAIMED', \
                 claimed_by = $1, \
                 claimed_at = now(), \
                 attempts = attempts + 1, \
                 updated_at = now() \
             WHERE q.id IN (SELECT id FROM next_jobs) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id)
        .bind(&type_names)
        .bind(for_repo)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if !jobs.is_empty() {
            debug!(worker = worker_id, count = jobs.len(), "claimed jobs");
        }
        Ok(jobs)
    }

    /// Transition `CLAIMED -> DONE`, only while still owned by `worker_id`.
    /// Returns false on ownership loss (e.g. the row was released as stuck
    /// and reclaimed elsewhere).
    pub async fn complete(&self, job_id: Uuid, worker_id: &str) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE codegraph_control.job_queue \
             SET status = 'DONE', completed_at = now(), updated_at = now() \
             WHERE id = $1 AND claimed_by = $2 AND status = 'CLAIMED'",
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        let owned = result.rows_affected() > 0;
        if owned {
            info!(job_id = %job_id, "completed job");
        } else {
            warn!(job_id = %job_id, worker = worker_id, "ownership lost on complete");
        }
        Ok(owned)
    }

    /// Record a failure. With attempts remaining the row returns to PENDING
    /// with `run_after` pushed out by exponential backoff (base doubles per
    /// subsequent attempt, capped); otherwise it becomes terminally FAILED.
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        error_detail: Option<Value>,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE codegraph_control.job_queue \
             SET status = CASE WHEN attempts < max_attempts THEN 'PENDING' ELSE 'FAILED' END, \
                 run_after = CASE WHEN attempts < max_attempts \
                     THEN now() + make_interval(secs => LEAST($3 * power(2, attempts - 1), $4)) \
                     ELSE run_after END, \
                 completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE now() END, \
                 claimed_by = NULL, \
                 claimed_at = NULL, \
                 error = $5, \
                 error_detail = $6, \
                 updated_at = now() \
             WHERE id = $1 AND claimed_by = $2 AND status = 'CLAIMED'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(self.config.retry_backoff_base_sec as f64)
        .bind(MAX_BACKOFF_SECS as f64)
        .bind(error)
        .bind(&error_detail)
        .execute(&self.pool)
        .await?;

        let owned = result.rows_affected() > 0;
        if owned {
            warn!(job_id = %job_id, error, "failed job");
        } else {
            warn!(job_id = %job_id, worker = worker_id, "ownership lost on fail");
        }
        Ok(owned)
    }

    /// Fail a job terminally, burning its remaining attempts. Used for
    /// validation-class errors that can never succeed on retry.
    pub async fn fail_terminal(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        error_detail: Option<Value>,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE codegraph_control.job_queue \
             SET status = 'FAILED', \
                 attempts = max_attempts, \
                 completed_at = now(), \
                 claimed_by = NULL, \
                 claimed_at = NULL, \
                 error = $3, \
                 error_detail = $4, \
                 updated_at = now() \
             WHERE id = $1 AND claimed_by = $2 AND status = 'CLAIMED'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .bind(&error_detail)
        .execute(&self.pool)
        .await?;

        let owned = result.rows_affected() > 0;
        if owned {
            warn!(job_id = %job_id, error, "failed job terminally");
        }
        Ok(owned)
    }

    /// Rewrite CLAIMED rows older than `threshold` back to PENDING without
    /// touching `attempts` (claim already incremented them). This is the
    /// only path by which a claimed job is released without its owner.
    pub async fn release_stuck(&self, threshold: Duration) -> CoreResult<Vec<ReleasedJob>> {
        let cutoff = Utc::now() - threshold;
        let rows = sqlx::query(
            "WITH stuck AS ( \
                 SELECT id, repo_name, job_type, claimed_by \
                 FROM codegraph_control.job_queue \
                 WHERE status = 'CLAIMED' AND claimed_at < $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE codegraph_control.job_queue q \
             SET status = 'PENDING', claimed_by = NULL, claimed_at = NULL, updated_at = now() \
             FROM stuck \
             WHERE q.id = stuck.id \
             RETURNING stuck.id, stuck.repo_name, stuck.job_type, stuck.claimed_by",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let released: Vec<ReleasedJob> = rows
            .into_iter()
            .map(|row| ReleasedJob {
                id: row.get("id"),
                repo_name: row.get("repo_name"),
                job_type: row.get("job_type"),
                claimed_by: row.get("claimed_by"),
            })
            .collect();

        if !released.is_empty() {
            warn!(count = released.len(), "released stuck jobs");
        }
        Ok(released)
    }

    /// Delete DONE rows older than the retention window.
    pub async fn cleanup_old_jobs(&self) -> CoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(self.config.cleanup_retention_days);
        let result = sqlx::query(
            "DELETE FROM codegraph_control.job_queue \
             WHERE status = 'DONE' AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "cleaned up old jobs");
        }
        Ok(deleted)
    }

    /// Counts by status, optionally scoped to one repo.
    pub async fn stats(&self, repo_name: Option<&str>) -> CoreResult<QueueStats> {
        let row = sqlx::query(
            "SELECT \
                 COUNT(*) FILTER (WHERE status = 'PENDING') AS pending, \
                 COUNT(*) FILTER (WHERE status = 'CLAIMED') AS claimed, \
                 COUNT(*) FILTER (WHERE status = 'DONE') AS done, \
                 COUNT(*) FILTER (WHERE status = 'FAILED') AS failed, \
                 MAX(completed_at) AS last_completed_at \
             FROM codegraph_control.job_queue \
             WHERE ($1::text IS NULL OR repo_name = $1)",
        )
        .bind(repo_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.get("pending"),
            claimed: row.get("claimed"),
            done: row.get("done"),
            failed: row.get("failed"),
            last_completed_at: row.get("last_completed_at"),
        })
    }

    /// Most recent jobs, optionally scoped to one repo.
    pub async fn recent_jobs(
        &self,
        repo_name: Option<&str>,
        limit: i64,
    ) -> CoreResult<Vec<JobSummary>> {
        let rows = sqlx::query_as::<_, JobSummary>(
            "SELECT id, repo_name, job_type, status, attempts, created_at, completed_at, error \
             FROM codegraph_control.job_queue \
             WHERE ($1::text IS NULL OR repo_name = $1) \
             ORDER BY created_at DESC \
             LIMIT $2",
        )
        .bind(repo_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Whether a non-terminal job with the given dedup key exists.
    pub async fn has_pending(
        &self,
        repo_name: &str,
        job_type: JobType,
        dedup_key: &str,
    ) -> CoreResult<bool> {
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM codegraph_control.job_queue \
             WHERE repo_name = $1 AND job_type = $2 AND dedup_key = $3 \
               AND status IN ('PENDING', 'CLAIMED') LIMIT 1",
        )
        .bind(repo_name)
        .bind(job_type)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(existing.is_some())
    }

    /// Repos with claimable work, oldest-starved first. Drives the
    /// per-repo coordinator's deterministic worker selection.
    pub async fn repos_with_pending_work(&self) -> CoreResult<Vec<String>> {
        let repos = sqlx::query_scalar::<_, String>(
            "SELECT repo_name FROM codegraph_control.job_queue \
             WHERE status = 'PENDING' AND run_after <= now() \
             GROUP BY repo_name \
             ORDER BY MIN(created_at) ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(repos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_result_reports_creation() {
        assert!(EnqueueResult::Created(Uuid::new_v4()).is_created());
        assert!(!EnqueueResult::Deduplicated.is_created());
    }
}
