//! Periodic summary scheduler.
//!
//! A side-channel scheduler: on an interval it looks for repos whose
//! summary coverage lags the index and enqueues summarize jobs into the
//! same queue the workers drain. Gated by `enable_summaries`.

use std::time::Duration;

use serde_json::json;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db::registry::RepoRegistration;
use crate::db::schema::with_schema;
use crate::error::CoreResult;
use crate::jobs::dependencies::priority_for;
use crate::jobs::job::JobType;
use crate::jobs::queue::JobQueue;

pub struct SummaryScheduler {
    pool: PgPool,
    queue: JobQueue,
    interval: Duration,
}

impl SummaryScheduler {
    pub fn new(pool: PgPool, queue: JobQueue, check_interval_minutes: u64) -> Self {
        Self {
            pool,
            queue,
            interval: Duration::from_secs(check_interval_minutes * 60),
        }
    }

    async fn tick(&self) -> CoreResult<()> {
        let repos = RepoRegistration::list(&self.pool).await?;
        for repo in repos {
            if !repo.enabled || !repo.auto_summaries {
                continue;
            }

            let mut conn = self.pool.acquire().await?;
            let (files_missing, symbols_missing) =
                with_schema(&mut conn, &repo.schema_name, |conn| {
                    Box::pin(async move {
                        let row = sqlx::query(
                            "SELECT \
                                 (SELECT COUNT(*) FROM file f \
                                  LEFT JOIN summary s ON s.target_kind = 'file' \
                                    AND s.target_id = f.id \
                                  WHERE s.id IS NULL) AS files_missing, \
                                 (SELECT COUNT(*) FROM symbol sym \
                                  LEFT JOIN summary s ON s.target_kind = 'symbol' \
                                    AND s.target_id = sym.id \
                                  WHERE s.id IS NULL) AS symbols_missing",
                        )
                        .fetch_one(conn)
                        .await?;
                        let files: i64 = row.get("files_missing");
                        let symbols: i64 = row.get("symbols_missing");
                        Ok((files, symbols))
                    })
                })
                .await?;

            if files_missing > 0 {
                info!(repo = %repo.name, files_missing, "scheduling file summaries");
                self.queue
                    .enqueue(
                        &repo.name,
                        &repo.schema_name,
                        JobType::SummarizeFiles,
                        json!({}),
                        priority_for(JobType::SummarizeFiles),
                        Some(&format!("{}:summarize_files", repo.name)),
                    )
                    .await?;
            }
            if symbols_missing > 0 {
                info!(repo = %repo.name, symbols_missing, "scheduling symbol summaries");
                self.queue
                    .enqueue(
                        &repo.name,
                        &repo.schema_name,
                        JobType::SummarizeSymbols,
                        json!({}),
                        priority_for(JobType::SummarizeSymbols),
                        Some(&format!("{}:summarize_symbols", repo.name)),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_sec = self.interval.as_secs(), "summary scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "summary scheduler tick failed");
                    }
                }
            }
        }
        info!("summary scheduler stopped");
    }
}
