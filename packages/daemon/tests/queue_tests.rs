//! Integration tests for the durable job queue: claim exclusivity, dedup,
//! retry backoff, stuck release, and retention cleanup.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use codegraph_core::jobs::job::{JobStatus, JobType};
use codegraph_core::jobs::queue::{EnqueueResult, JobQueue};

use common::{test_jobs_config, test_pool, unique_repo_name};

fn schema_for(repo: &str) -> String {
    codegraph_core::db::schema::schema_name_for(repo)
}

async fn enqueue_n(queue: &JobQueue, repo: &str, n: usize) -> Vec<Uuid> {
    let schema = schema_for(repo);
    let mut ids = Vec::new();
    for i in 0..n {
        let result = queue
            .enqueue(
                repo,
                &schema,
                JobType::ReindexFile,
                json!({"path": format!("f{i}.py"), "op": "UPSERT"}),
                10,
                None,
            )
            .await
            .expect("enqueue");
        match result {
            EnqueueResult::Created(id) => ids.push(id),
            EnqueueResult::Deduplicated => panic!("unexpected dedup"),
        }
    }
    ids
}

#[tokio::test]
async fn concurrent_claimers_get_disjoint_jobs() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool, test_jobs_config());
    let repo = unique_repo_name("claim-excl");

    let created = enqueue_n(&queue, &repo, 20).await;

    let (first, second) = tokio::join!(
        queue.claim("worker-a", None, 10, Some(&repo)),
        queue.claim("worker-b", None, 10, Some(&repo)),
    );
    let first = first.expect("claim a");
    let second = second.expect("claim b");

    let mut union: Vec<Uuid> = first.iter().chain(second.iter()).map(|j| j.id).collect();
    union.sort();
    let mut expected = created.clone();
    expected.sort();

    // Union covers every row, intersection is empty.
    assert_eq!(union.len(), 20);
    assert_eq!(union, expected);
    for job in &first {
        assert!(!second.iter().any(|other| other.id == job.id));
        assert_eq!(job.status, JobStatus::Claimed);
        assert_eq!(job.attempts, 1);
    }
}

#[tokio::test]
async fn dedup_burst_collapses_to_single_pending_row() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool.clone(), test_jobs_config());
    let repo = unique_repo_name("dedup-burst");
    let schema = schema_for(&repo);
    let dedup_key = format!("{repo}:embed_missing");

    // 8 concurrent producers, 100 enqueues total.
    let mut producers = Vec::new();
    for p in 0..8 {
        let queue = queue.clone();
        let repo = repo.clone();
        let schema = schema.clone();
        let dedup_key = dedup_key.clone();
        producers.push(tokio::spawn(async move {
            let mut created = 0usize;
            let count = if p == 0 { 16 } else { 12 };
            for _ in 0..count {
                let result = queue
                    .enqueue(
                        &repo,
                        &schema,
                        JobType::EmbedMissing,
                        json!({}),
                        5,
                        Some(&dedup_key),
                    )
                    .await
                    .expect("enqueue");
                if result.is_created() {
                    created += 1;
                }
            }
            created
        }));
    }

    let mut created_total = 0usize;
    for producer in producers {
        created_total += producer.await.expect("producer");
    }
    assert_eq!(created_total, 1, "exactly one enqueue may create a row");

    let non_terminal: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM codegraph_control.job_queue \
         WHERE repo_name = $1 AND job_type = 'EMBED_MISSING' AND dedup_key = $2 \
           AND status IN ('PENDING', 'CLAIMED')",
    )
    .bind(&repo)
    .bind(&dedup_key)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(non_terminal, 1);

    // Exactly one worker receives it.
    let (a, b) = tokio::join!(
        queue.claim("worker-a", None, 10, Some(&repo)),
        queue.claim("worker-b", None, 10, Some(&repo)),
    );
    assert_eq!(a.expect("claim").len() + b.expect("claim").len(), 1);
}

#[tokio::test]
async fn failed_job_retries_with_backoff() {
    let pool = test_pool().await;
    // backoff(first failure) = 10s * 2^0
    let queue = JobQueue::new(pool.clone(), test_jobs_config());
    let repo = unique_repo_name("retry");
    let schema = schema_for(&repo);

    queue
        .enqueue(&repo, &schema, JobType::ReindexFile, json!({"path": "a.py"}), 10, None)
        .await
        .expect("enqueue");

    let claimed = queue
        .claim("worker-a", None, 1, Some(&repo))
        .await
        .expect("claim");
    let job = &claimed[0];
    assert_eq!(job.attempts, 1);

    let before = Utc::now();
    let owned = queue
        .fail(job.id, "worker-a", "flaky parser", Some(json!({"error_type": "processor_error"})))
        .await
        .expect("fail");
    assert!(owned);

    let (status, attempts, run_after): (String, i32, chrono::DateTime<Utc>) =
        sqlx::query_as("SELECT status, attempts, run_after FROM codegraph_control.job_queue WHERE id = $1")
            .bind(job.id)
            .fetch_one(&pool)
            .await
            .expect("row");
    assert_eq!(status, "PENDING");
    assert_eq!(attempts, 1);
    let delay = (run_after - before).num_seconds();
    assert!((8..=12).contains(&delay), "expected ~10s backoff, got {delay}s");

    // Not claimable before run_after.
    let early = queue
        .claim("worker-b", None, 1, Some(&repo))
        .await
        .expect("claim");
    assert!(early.is_empty());

    // Fast-forward the clock and the second attempt succeeds.
    sqlx::query("UPDATE codegraph_control.job_queue SET run_after = now() WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .expect("fast-forward");

    let retried = queue
        .claim("worker-b", None, 1, Some(&repo))
        .await
        .expect("claim");
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attempts, 2);

    assert!(queue.complete(retried[0].id, "worker-b").await.expect("complete"));
    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status, attempts FROM codegraph_control.job_queue WHERE id = $1")
            .bind(job.id)
            .fetch_one(&pool)
            .await
            .expect("row");
    assert_eq!(status, "DONE");
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn exhausted_attempts_become_terminal_failed() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool.clone(), test_jobs_config());
    let repo = unique_repo_name("exhaust");
    let schema = schema_for(&repo);

    queue
        .enqueue(&repo, &schema, JobType::DocsScan, json!({}), 9, None)
        .await
        .expect("enqueue");

    // max_retries = 3: three claim/fail cycles exhaust the budget.
    for round in 1..=3 {
        sqlx::query(
            "UPDATE codegraph_control.job_queue SET run_after = now() WHERE repo_name = $1",
        )
        .bind(&repo)
        .execute(&pool)
        .await
        .expect("fast-forward");

        let claimed = queue
            .claim("worker-a", None, 1, Some(&repo))
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 1, "round {round}");
        assert_eq!(claimed[0].attempts, round);
        queue
            .fail(claimed[0].id, "worker-a", "still broken", None)
            .await
            .expect("fail");
    }

    let status: String =
        sqlx::query_scalar("SELECT status FROM codegraph_control.job_queue WHERE repo_name = $1")
            .bind(&repo)
            .fetch_one(&pool)
            .await
            .expect("status");
    assert_eq!(status, "FAILED");

    // Terminal rows are never reclaimed.
    sqlx::query("UPDATE codegraph_control.job_queue SET run_after = now() WHERE repo_name = $1")
        .bind(&repo)
        .execute(&pool)
        .await
        .expect("fast-forward");
    let claimed = queue
        .claim("worker-a", None, 1, Some(&repo))
        .await
        .expect("claim");
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn stuck_jobs_are_released_without_touching_attempts() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool.clone(), test_jobs_config());
    let repo = unique_repo_name("stuck");
    let schema = schema_for(&repo);

    queue
        .enqueue(&repo, &schema, JobType::FullIndex, json!({}), 10, None)
        .await
        .expect("enqueue");
    let claimed = queue
        .claim("dead-worker", None, 1, Some(&repo))
        .await
        .expect("claim");
    let job_id = claimed[0].id;

    // The worker dies. Age the claim past the threshold.
    sqlx::query(
        "UPDATE codegraph_control.job_queue SET claimed_at = now() - interval '40 minutes' \
         WHERE id = $1",
    )
    .bind(job_id)
    .execute(&pool)
    .await
    .expect("age claim");

    let released = queue
        .release_stuck(Duration::minutes(30))
        .await
        .expect("release");
    let ours: Vec<_> = released.iter().filter(|j| j.repo_name == repo).collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].claimed_by.as_deref(), Some("dead-worker"));

    let (status, attempts, claimed_by): (String, i32, Option<String>) = sqlx::query_as(
        "SELECT status, attempts, claimed_by FROM codegraph_control.job_queue WHERE id = $1",
    )
    .bind(job_id)
    .fetch_one(&pool)
    .await
    .expect("row");
    assert_eq!(status, "PENDING");
    assert_eq!(attempts, 1, "release must not increment attempts");
    assert_eq!(claimed_by, None);

    // The dead worker's completion attempt reports ownership loss.
    assert!(!queue.complete(job_id, "dead-worker").await.expect("complete"));

    // A second worker reclaims and processes it.
    let reclaimed = queue
        .claim("worker-b", None, 1, Some(&repo))
        .await
        .expect("claim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);
    assert!(queue.complete(job_id, "worker-b").await.expect("complete"));
}

#[tokio::test]
async fn claims_follow_priority_then_age() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool, test_jobs_config());
    let repo = unique_repo_name("priority");
    let schema = schema_for(&repo);

    queue
        .enqueue(&repo, &schema, JobType::RegenerateSummary, json!({}), 2, None)
        .await
        .expect("enqueue");
    queue
        .enqueue(&repo, &schema, JobType::FullIndex, json!({}), 10, None)
        .await
        .expect("enqueue");
    queue
        .enqueue(&repo, &schema, JobType::DocsScan, json!({}), 9, None)
        .await
        .expect("enqueue");

    let first = queue
        .claim("worker-a", None, 1, Some(&repo))
        .await
        .expect("claim");
    assert_eq!(first[0].job_type, JobType::FullIndex);

    let second = queue
        .claim("worker-a", None, 1, Some(&repo))
        .await
        .expect("claim");
    assert_eq!(second[0].job_type, JobType::DocsScan);
}

#[tokio::test]
async fn type_filter_restricts_claims() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool, test_jobs_config());
    let repo = unique_repo_name("type-filter");
    let schema = schema_for(&repo);

    queue
        .enqueue(&repo, &schema, JobType::FullIndex, json!({}), 10, None)
        .await
        .expect("enqueue");
    queue
        .enqueue(&repo, &schema, JobType::EmbedMissing, json!({}), 5, None)
        .await
        .expect("enqueue");

    let embeds = queue
        .claim("worker-a", Some(&[JobType::EmbedMissing]), 10, Some(&repo))
        .await
        .expect("claim");
    assert_eq!(embeds.len(), 1);
    assert_eq!(embeds[0].job_type, JobType::EmbedMissing);
}

#[tokio::test]
async fn cleanup_removes_only_old_done_rows() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool.clone(), test_jobs_config());
    let repo = unique_repo_name("cleanup");
    let schema = schema_for(&repo);

    queue
        .enqueue(&repo, &schema, JobType::DocsScan, json!({}), 9, None)
        .await
        .expect("enqueue");
    let claimed = queue
        .claim("worker-a", None, 1, Some(&repo))
        .await
        .expect("claim");
    queue.complete(claimed[0].id, "worker-a").await.expect("complete");

    // Fresh DONE rows survive.
    queue.cleanup_old_jobs().await.expect("cleanup");
    let stats = queue.stats(Some(&repo)).await.expect("stats");
    assert_eq!(stats.done, 1);

    // Aged past retention, they are removed.
    sqlx::query(
        "UPDATE codegraph_control.job_queue \
         SET completed_at = now() - interval '8 days' WHERE repo_name = $1",
    )
    .bind(&repo)
    .execute(&pool)
    .await
    .expect("age row");
    queue.cleanup_old_jobs().await.expect("cleanup");
    let stats = queue.stats(Some(&repo)).await.expect("stats");
    assert_eq!(stats.done, 0);
}

#[tokio::test]
async fn queue_stats_and_recent_jobs_are_scoped() {
    let pool = test_pool().await;
    let queue = JobQueue::new(pool, test_jobs_config());
    let repo = unique_repo_name("stats");
    let schema = schema_for(&repo);

    queue
        .enqueue(&repo, &schema, JobType::FullIndex, json!({}), 10, None)
        .await
        .expect("enqueue");
    queue
        .enqueue(&repo, &schema, JobType::DocsScan, json!({}), 9, None)
        .await
        .expect("enqueue");

    let stats = queue.stats(Some(&repo)).await.expect("stats");
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.claimed, 0);

    let recent = queue.recent_jobs(Some(&repo), 10).await.expect("recent");
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|j| j.repo_name == repo));
}
