//! Daemon supervisor: process lifecycle.
//!
//! Startup installs the control DDL, registers this instance, and launches
//! the background activities; shutdown sets one gate, waits (with a
//! ceiling) for in-flight processors, marks the instance STOPPED and
//! closes the pool. The store holds no other ephemeral state: CLAIMED rows
//! owned by a dead instance are reclaimed by any other instance's
//! stuck-job sweep.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::health::HealthMonitor;
use super::periodic::SummaryScheduler;
use super::watcher::RepoWatcher;
use super::workers::WorkerPool;
use crate::config::CoreConfig;
use crate::db::registry::RepoRegistration;
use crate::db::schema;
use crate::error::CoreResult;
use crate::jobs::dependencies::priority_for;
use crate::jobs::job::JobType;
use crate::jobs::processors::{ProcessorContext, ProcessorRegistry};
use crate::jobs::queue::JobQueue;

/// How long shutdown waits for in-flight work before giving up.
const DRAIN_CEILING: Duration = Duration::from_secs(30);

pub struct Daemon {
    config: Arc<CoreConfig>,
    pool: PgPool,
    queue: JobQueue,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Connect to the store, install the control DDL, and register this
    /// instance as RUNNING. Fatal when the store is unreachable.
    pub async fn startup(config: CoreConfig) -> CoreResult<Self> {
        let config = Arc::new(config);
        info!(daemon_id = %config.daemon_id, "starting daemon");
        info!(config = %config.redacted(), "effective configuration");

        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(config.database.pool_size)
            .acquire_timeout(Duration::from_secs(config.database.pool_timeout))
            .connect(&config.database.control_dsn)
            .await?;

        schema::ensure_control_schema(&pool).await?;

        sqlx::query(
            "INSERT INTO codegraph_control.daemon_instance (instance_id, config) \
             VALUES ($1, $2) \
             ON CONFLICT (instance_id) DO UPDATE \
                 SET started_at = now(), last_heartbeat = now(), \
                     status = 'RUNNING', config = $2",
        )
        .bind(&config.daemon_id)
        .bind(config.redacted())
        .execute(&pool)
        .await?;
        info!(daemon_id = %config.daemon_id, "registered daemon instance");

        let queue = JobQueue::new(pool.clone(), config.jobs.clone());

        Ok(Self {
            config,
            pool,
            queue,
            shutdown: CancellationToken::new(),
        })
    }

    /// Handle for external shutdown (tests, embedding in other binaries).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn heartbeat_loop(pool: PgPool, daemon_id: String, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let result = sqlx::query(
                        "UPDATE codegraph_control.daemon_instance \
                         SET last_heartbeat = now() WHERE instance_id = $1",
                    )
                    .bind(&daemon_id)
                    .execute(&pool)
                    .await;
                    if let Err(e) = result {
                        error!(error = %e, "heartbeat update failed");
                    }
                }
            }
        }
    }

    /// Enqueue startup jobs: an embedding backfill per auto_embed repo when
    /// configured, and a tag-rules sync per enabled repo.
    async fn enqueue_startup_jobs(&self) -> CoreResult<()> {
        let repos = RepoRegistration::list(&self.pool).await?;
        for repo in &repos {
            if !repo.enabled {
                continue;
            }
            if self.config.embeddings.backfill_on_startup && repo.auto_embed {
                self.queue
                    .enqueue(
                        &repo.name,
                        &repo.schema_name,
                        JobType::EmbedMissing,
                        json!({}),
                        priority_for(JobType::EmbedMissing),
                        Some(&format!("{}:embed_missing", repo.name)),
                    )
                    .await?;
            }
            if self.config.enable_tag_rules_sync {
                self.queue
                    .enqueue(
                        &repo.name,
                        &repo.schema_name,
                        JobType::TagRulesSync,
                        json!({}),
                        priority_for(JobType::TagRulesSync),
                        Some(&format!("{}:tag_rules_sync", repo.name)),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Run until an interrupt/termination signal or external cancellation.
    pub async fn run(self) -> CoreResult<()> {
        let registry = Arc::new(ProcessorRegistry::build(ProcessorContext::new(
            self.pool.clone(),
            self.config.clone(),
        )));

        if let Err(e) = self.enqueue_startup_jobs().await {
            error!(error = %e, "failed to enqueue startup jobs");
        }

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // Heartbeat
        tasks.push((
            "heartbeat",
            tokio::spawn(Self::heartbeat_loop(
                self.pool.clone(),
                self.config.daemon_id.clone(),
                Duration::from_secs(self.config.workers.heartbeat_interval_sec),
                self.shutdown.clone(),
            )),
        ));

        // Worker pool
        let worker_pool = Arc::new(WorkerPool::new(
            self.config.clone(),
            self.pool.clone(),
            self.queue.clone(),
            registry,
        ));
        tasks.push((
            "worker-pool",
            tokio::spawn(worker_pool.run(self.shutdown.clone())),
        ));

        // Watcher
        if self.config.watcher.enabled {
            let watcher = RepoWatcher::new(self.config.watcher.clone(), self.queue.clone());
            let token = self.shutdown.clone();
            tasks.push((
                "watcher",
                tokio::spawn(async move {
                    if let Err(e) = watcher.run(token).await {
                        error!(error = %e, "watcher failed");
                    }
                }),
            ));
        }

        // Health monitor
        let health = HealthMonitor::new(self.pool.clone(), self.queue.clone());
        tasks.push(("health", tokio::spawn(health.run(self.shutdown.clone()))));

        // Periodic summary scheduler
        if self.config.enable_summaries {
            let scheduler = SummaryScheduler::new(
                self.pool.clone(),
                self.queue.clone(),
                self.config.summaries.check_interval_minutes,
            );
            tasks.push((
                "summary-scheduler",
                tokio::spawn(scheduler.run(self.shutdown.clone())),
            ));
        }

        info!("daemon running - waiting for jobs");

        // Wait for a signal or external cancellation.
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = wait_for_signal() => {
                info!("shutdown signal received - stopping daemon");
                self.shutdown.cancel();
            }
        }

        // Drain background tasks with a ceiling; in-flight processors get
        // their chance to finish, then we move on.
        let drain = async {
            for (name, task) in tasks {
                if let Err(e) = task.await {
                    warn!(task = name, error = %e, "background task join failed");
                }
            }
        };
        if tokio::time::timeout(DRAIN_CEILING, drain).await.is_err() {
            warn!(ceiling_sec = DRAIN_CEILING.as_secs(), "drain ceiling reached");
        }

        sqlx::query(
            "UPDATE codegraph_control.daemon_instance \
             SET status = 'STOPPED', last_heartbeat = now() \
             WHERE instance_id = $1",
        )
        .bind(&self.config.daemon_id)
        .execute(&self.pool)
        .await?;

        self.pool.close().await;
        info!("daemon shutdown complete");
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
