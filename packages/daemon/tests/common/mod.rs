//! Shared test infrastructure.
//!
//! One pgvector Postgres container is started on first use and reused by
//! every test; tests isolate themselves with unique repo names.

// Not every test binary uses every helper.
#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;
use uuid::Uuid;

use codegraph_core::config::{CoreConfig, JobsConfig};
use codegraph_core::db::schema;

struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run.
    _postgres: ContainerAsync<GenericImage>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        // pgvector/pgvector ships the vector extension the repo DDL needs.
        let postgres = GenericImage::new("pgvector/pgvector", "pg16")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("failed to connect for control DDL")?;
        schema::ensure_control_schema(&pool)
            .await
            .context("failed to install control schema")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// A pool onto the shared test database.
pub async fn test_pool() -> PgPool {
    let infra = SharedTestInfra::get().await;
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&infra.db_url)
        .await
        .expect("failed to connect test pool")
}

/// Jobs config with fast retries for queue tests.
pub fn test_jobs_config() -> JobsConfig {
    JobsConfig {
        claim_batch_size: 10,
        max_retries: 3,
        retry_backoff_base_sec: 10,
        cleanup_retention_days: 7,
    }
}

/// A full daemon config pointed at the shared database. The embedding
/// provider is intentionally unreachable; tests never call it.
pub async fn test_config() -> CoreConfig {
    let infra = SharedTestInfra::get().await;
    let mut config: CoreConfig = serde_yaml::from_str(&format!(
        r#"
daemon_id: test-daemon
database:
  control_dsn: {}
embeddings:
  provider: ollama
  model: nomic-embed-text
  dimension: 8
  ollama:
    base_url: http://127.0.0.1:1
"#,
        infra.db_url
    ))
    .expect("test config parses");
    config.jobs = test_jobs_config();
    config.workers.poll_interval_sec = 1;
    config
}

/// Unique repo name so tests sharing the database never collide.
pub fn unique_repo_name(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}
