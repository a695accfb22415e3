//! Worker pool: claims jobs and drives processors under three orthogonal
//! concurrency limits.
//!
//! Processing modes:
//! - `single`: one worker processes everything sequentially, no global
//!   semaphore.
//! - `per_repo`: a coordinator spawns one worker per repo with pending
//!   work, up to `max_workers`; quiescent repo workers exit and release
//!   their slot.
//! - `pool` (default): a fixed population of generic workers competes for
//!   any job, additionally bounded by per-job-type ceilings.
//!
//! Regardless of mode the limits compose in order: global, per-repo,
//! per-job-type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CoreConfig, WorkerMode};
use crate::db::registry;
use crate::error::{CoreError, CoreResult};
use crate::jobs::dependencies::follow_ups;
use crate::jobs::job::{Job, JobType};
use crate::jobs::processors::ProcessorRegistry;
use crate::jobs::queue::JobQueue;

/// Consecutive empty polls before a repo-bound worker exits.
const MAX_IDLE_POLLS: u32 = 5;

pub struct WorkerPool {
    config: Arc<CoreConfig>,
    pool: PgPool,
    queue: JobQueue,
    registry: Arc<ProcessorRegistry>,
    global_semaphore: Arc<Semaphore>,
    repo_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    job_type_semaphores: HashMap<JobType, Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(
        config: Arc<CoreConfig>,
        pool: PgPool,
        queue: JobQueue,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        let mut job_type_semaphores = HashMap::new();
        for (name, limit) in &config.workers.job_type_limits {
            match JobType::parse(name) {
                Some(job_type) if *limit > 0 => {
                    job_type_semaphores.insert(job_type, Arc::new(Semaphore::new(*limit)));
                }
                _ => warn!(job_type = %name, "ignoring unknown job_type_limits entry"),
            }
        }

        Self {
            global_semaphore: Arc::new(Semaphore::new(config.workers.max_workers)),
            config,
            pool,
            queue,
            registry,
            repo_semaphores: Mutex::new(HashMap::new()),
            job_type_semaphores,
        }
    }

    async fn repo_semaphore(&self, repo_name: &str) -> Arc<Semaphore> {
        let mut map = self.repo_semaphores.lock().await;
        map.entry(repo_name.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.workers.max_concurrent_per_repo))
            })
            .clone()
    }

    /// Run the pool until the shutdown gate is set.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mode = self.config.workers.mode;
        let max_workers = self.config.workers.max_workers;
        info!(?mode, max_workers, "starting worker pool");

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        match mode {
            WorkerMode::Single => {
                let pool = self.clone();
                let token = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    let limit = pool.config.jobs.claim_batch_size;
                    pool.worker_loop("single-0", None, limit, false, token).await;
                }));
            }
            WorkerMode::PerRepo => {
                let pool = self.clone();
                let token = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    pool.per_repo_coordinator(token).await;
                }));
            }
            WorkerMode::Pool => {
                for i in 0..max_workers {
                    let pool = self.clone();
                    let token = shutdown.clone();
                    let worker_id = format!("pool-{i}");
                    tasks.push(tokio::spawn(async move {
                        pool.worker_loop(&worker_id, None, 1, true, token).await;
                    }));
                }
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        info!("worker pool stopped");
    }

    /// Generic worker loop: claim and process jobs until shutdown.
    async fn worker_loop(
        &self,
        worker_id: &str,
        for_repo: Option<&str>,
        claim_limit: i64,
        use_global: bool,
        shutdown: CancellationToken,
    ) {
        let poll_interval = Duration::from_secs(self.config.workers.poll_interval_sec);
        let worker_id = format!("{}:{}", self.config.daemon_id, worker_id);
        debug!(worker = %worker_id, repo = ?for_repo, "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self.queue.claim(&worker_id, None, claim_limit, for_repo).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }

            for job in jobs {
                self.process_job(&worker_id, job, use_global).await;
            }
        }

        debug!(worker = %worker_id, "worker stopped");
    }

    /// Repo-bound worker for per_repo mode; exits after enough empty polls
    /// so a quiescent repo releases its slot.
    async fn repo_worker_loop(&self, repo_name: String, shutdown: CancellationToken) {
        let poll_interval = Duration::from_secs(self.config.workers.poll_interval_sec);
        let worker_id = format!("{}:repo-{repo_name}", self.config.daemon_id);
        debug!(worker = %worker_id, "repo worker started");

        let mut idle = 0u32;
        while !shutdown.is_cancelled() && idle < MAX_IDLE_POLLS {
            let jobs = match self
                .queue
                .claim(&worker_id, None, 1, Some(&repo_name))
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            if jobs.is_empty() {
                idle += 1;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }

            idle = 0;
            for job in jobs {
                self.process_job(&worker_id, job, false).await;
            }
        }

        debug!(worker = %worker_id, idle, "repo worker stopped");
    }

    /// Coordinator for per_repo mode. Candidate repos are ordered
    /// oldest-starved first so selection under a full pool is deterministic.
    async fn per_repo_coordinator(self: &Arc<Self>, shutdown: CancellationToken) {
        let poll_interval = Duration::from_secs(self.config.workers.poll_interval_sec);
        let active: Arc<Mutex<HashMap<String, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        info!("per-repo coordinator started");

        while !shutdown.is_cancelled() {
            match self.queue.repos_with_pending_work().await {
                Ok(repos) => {
                    let mut workers = active.lock().await;
                    workers.retain(|_, handle| !handle.is_finished());

                    for repo_name in repos {
                        if workers.contains_key(&repo_name) {
                            continue;
                        }
                        if workers.len() >= self.config.workers.max_workers {
                            debug!(active = workers.len(), "max repo workers reached");
                            break;
                        }

                        info!(repo = %repo_name, "spawning repo worker");
                        let pool = self.clone();
                        let token = shutdown.clone();
                        let name = repo_name.clone();
                        let handle = tokio::spawn(async move {
                            pool.repo_worker_loop(name, token).await;
                        });
                        workers.insert(repo_name, handle);
                    }
                }
                Err(e) => error!(error = %e, "per-repo coordinator poll failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        // Drain remaining repo workers.
        let mut workers = active.lock().await;
        for (_, handle) in workers.drain() {
            let _ = handle.await;
        }
        info!("per-repo coordinator stopped");
    }

    /// Claim and process at most one job, returning how many ran. Gives
    /// callers a deterministic single step of the scheduler.
    pub async fn run_once(&self, worker_id: &str, for_repo: Option<&str>) -> CoreResult<usize> {
        let jobs = self.queue.claim(worker_id, None, 1, for_repo).await?;
        let count = jobs.len();
        for job in jobs {
            self.process_job(worker_id, job, false).await;
        }
        Ok(count)
    }

    /// Process one claimed job under the composed concurrency limits.
    async fn process_job(&self, worker_id: &str, job: Job, use_global: bool) {
        let _global = if use_global {
            Some(
                self.global_semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("global semaphore never closed"),
            )
        } else {
            None
        };

        let repo_semaphore = self.repo_semaphore(&job.repo_name).await;
        let _repo = repo_semaphore
            .acquire_owned()
            .await
            .expect("repo semaphore never closed");

        let _job_type = if self.config.workers.mode == WorkerMode::Pool {
            match self.job_type_semaphores.get(&job.job_type) {
                Some(semaphore) => Some(
                    semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("job-type semaphore never closed"),
                ),
                None => None,
            }
        } else {
            None
        };

        self.execute_job(worker_id, job).await;
    }

    /// Run the processor under the per-job timeout and settle the row.
    async fn execute_job(&self, worker_id: &str, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type;
        info!(job_id = %job_id, %job_type, repo = %job.repo_name, "processing job");

        let Some(processor) = self.registry.get(job_type) else {
            let _ = self
                .queue
                .fail_terminal(
                    job_id,
                    worker_id,
                    &format!("unknown job type: {job_type}"),
                    Some(json!({"error_type": "validation"})),
                )
                .await;
            return;
        };

        let timeout = Duration::from_secs(self.config.workers.job_timeout_sec);
        let task_job = job.clone();
        // Spawned so a panicking processor is contained and surfaces as a
        // JoinError instead of tearing down the worker.
        let mut handle = tokio::spawn(async move { processor.process(&task_job).await });
        let outcome = tokio::time::timeout(timeout, &mut handle).await;

        match outcome {
            Ok(Ok(Ok(()))) => {
                let owned = match self.queue.complete(job_id, worker_id).await {
                    Ok(owned) => owned,
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to mark job complete");
                        return;
                    }
                };
                if owned {
                    self.enqueue_follow_ups(&job).await;
                }
            }
            Ok(Ok(Err(core_err))) => {
                let detail = json!({
                    "error_type": core_err.kind(),
                    "error_message": core_err.to_string(),
                });
                let result = if core_err.is_retryable() {
                    self.queue
                        .fail(job_id, worker_id, &core_err.to_string(), Some(detail))
                        .await
                } else {
                    self.queue
                        .fail_terminal(job_id, worker_id, &core_err.to_string(), Some(detail))
                        .await
                };
                if let Err(e) = result {
                    error!(job_id = %job_id, error = %e, "failed to mark job failed");
                }
            }
            Ok(Err(join_err)) => {
                // Processor panicked.
                let message = if join_err.is_panic() {
                    match join_err.into_panic().downcast::<String>() {
                        Ok(s) => *s,
                        Err(payload) => match payload.downcast::<&'static str>() {
                            Ok(s) => s.to_string(),
                            Err(_) => "unknown panic".to_string(),
                        },
                    }
                } else {
                    "processor task cancelled".to_string()
                };
                error!(job_id = %job_id, %job_type, panic = %message, "processor panicked");
                let detail = json!({"error_type": "panic", "error_message": message});
                let _ = self
                    .queue
                    .fail(job_id, worker_id, "processor panicked", Some(detail))
                    .await;
            }
            Err(_elapsed) => {
                // Best-effort in-process kill; the row is failed either way
                // so the queue is never left with a permanently CLAIMED row.
                handle.abort();
                warn!(job_id = %job_id, %job_type, timeout_sec = timeout.as_secs(), "job timed out");
                let err = CoreError::Timeout(timeout.as_secs());
                let detail = json!({
                    "error_type": err.kind(),
                    "error_message": err.to_string(),
                });
                let _ = self
                    .queue
                    .fail(job_id, worker_id, &err.to_string(), Some(detail))
                    .await;
            }
        }
    }

    /// Enqueue the deterministic follow-ups for a completed job.
    async fn enqueue_follow_ups(&self, job: &Job) {
        if let Err(e) = self.try_enqueue_follow_ups(job).await {
            error!(job_id = %job.id, error = %e, "failed to enqueue follow-ups");
        }
    }

    async fn try_enqueue_follow_ups(&self, job: &Job) -> CoreResult<()> {
        let Some(flags) = registry::flags_for(&self.pool, &job.repo_name).await? else {
            // Repo was removed while the job ran; nothing to fan out.
            return Ok(());
        };
        let total_files = registry::total_files(&self.pool, &job.schema_name)
            .await
            .unwrap_or(0);

        for follow_up in follow_ups(job.job_type, &job.payload, &flags, total_files) {
            let dedup_key = follow_up.dedup_key(&job.repo_name);
            debug!(
                parent = %job.job_type,
                child = %follow_up.job_type,
                repo = %job.repo_name,
                "enqueuing follow-up"
            );
            self.queue
                .enqueue(
                    &job.repo_name,
                    &job.schema_name,
                    follow_up.job_type,
                    json!({}),
                    follow_up.priority,
                    Some(&dedup_key),
                )
                .await?;
        }
        Ok(())
    }
}
