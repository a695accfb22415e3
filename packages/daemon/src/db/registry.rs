//! Repository registrations in the control namespace.
//!
//! A registration binds a repo name to its namespace and root path and
//! carries the per-repo feature flags consulted by the watcher, the health
//! monitor, and follow-up derivation.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::schema;
use crate::error::{CoreError, CoreResult};
use crate::jobs::dependencies::RepoFlags;

/// A row from `codegraph_control.repo_registry`.
#[derive(Debug, Clone, FromRow)]
pub struct RepoRegistration {
    pub id: Uuid,
    pub name: String,
    pub schema_name: String,
    pub root_path: String,
    pub enabled: bool,
    pub auto_index: bool,
    pub auto_embed: bool,
    pub auto_watch: bool,
    pub auto_summaries: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RepoRegistration {
    pub fn flags(&self) -> RepoFlags {
        RepoFlags {
            enabled: self.enabled,
            auto_index: self.auto_index,
            auto_embed: self.auto_embed,
            auto_watch: self.auto_watch,
            auto_summaries: self.auto_summaries,
        }
    }

    pub async fn find_by_name(pool: &PgPool, name: &str) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT id, name, schema_name, root_path, enabled, auto_index, auto_embed, \
                    auto_watch, auto_summaries, created_at, updated_at \
             FROM codegraph_control.repo_registry WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn list(pool: &PgPool) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT id, name, schema_name, root_path, enabled, auto_index, auto_embed, \
                    auto_watch, auto_summaries, created_at, updated_at \
             FROM codegraph_control.repo_registry ORDER BY name",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Repos the filesystem watcher should cover.
    pub async fn watched(pool: &PgPool) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT id, name, schema_name, root_path, enabled, auto_index, auto_embed, \
                    auto_watch, auto_summaries, created_at, updated_at \
             FROM codegraph_control.repo_registry \
             WHERE enabled = true AND auto_watch = true ORDER BY name",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Current feature flags for a repo, or None if unregistered.
pub async fn flags_for(pool: &PgPool, repo_name: &str) -> CoreResult<Option<RepoFlags>> {
    Ok(RepoRegistration::find_by_name(pool, repo_name)
        .await?
        .map(|r| r.flags()))
}

/// Register a repository: initialize its namespace, upsert the control row,
/// and seed the in-schema `repo` and `repo_index_state` rows.
pub async fn register_repo(
    pool: &PgPool,
    name: &str,
    root_path: &str,
    embedding_dimension: u32,
    force: bool,
) -> CoreResult<RepoRegistration> {
    let schema_name = schema::ensure_initialized(pool, name, embedding_dimension, force).await?;

    let registration = sqlx::query_as::<_, RepoRegistration>(
        "INSERT INTO codegraph_control.repo_registry (name, schema_name, root_path) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (name) DO UPDATE \
             SET schema_name = EXCLUDED.schema_name, \
                 root_path = EXCLUDED.root_path, \
                 updated_at = now() \
         RETURNING id, name, schema_name, root_path, enabled, auto_index, auto_embed, \
                   auto_watch, auto_summaries, created_at, updated_at",
    )
    .bind(name)
    .bind(&schema_name)
    .bind(root_path)
    .fetch_one(pool)
    .await?;

    let mut conn = pool.acquire().await?;
    let repo_name = name.to_string();
    let path = root_path.to_string();
    schema::with_schema(&mut conn, &schema_name, move |conn| {
        Box::pin(async move {
            let repo_id: Uuid = sqlx::query_scalar(
                "INSERT INTO repo (name, root_path) VALUES ($1, $2) \
                 ON CONFLICT (name) DO UPDATE SET root_path = EXCLUDED.root_path \
                 RETURNING id",
            )
            .bind(&repo_name)
            .bind(&path)
            .fetch_one(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO repo_index_state (repo_id) VALUES ($1) \
                 ON CONFLICT (repo_id) DO NOTHING",
            )
            .bind(repo_id)
            .execute(&mut *conn)
            .await?;
            Ok(())
        })
    })
    .await?;

    Ok(registration)
}

/// Remove a repository: drop its namespace and delete the registration.
pub async fn remove_repo(pool: &PgPool, name: &str) -> CoreResult<()> {
    let registration = RepoRegistration::find_by_name(pool, name)
        .await?
        .ok_or_else(|| CoreError::NamespaceMissing(name.to_string()))?;

    schema::drop_repo_schema(pool, &registration.schema_name).await?;
    sqlx::query("DELETE FROM codegraph_control.repo_registry WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Total files currently indexed for a repo, for the batch-reindex
/// change-ratio rule. Zero when the index state is missing.
pub async fn total_files(pool: &PgPool, schema_name: &str) -> CoreResult<i64> {
    let mut conn = pool.acquire().await?;
    let count = schema::with_schema(&mut conn, schema_name, |conn| {
        Box::pin(async move {
            let count: Option<i32> = sqlx::query_scalar(
                "SELECT file_count FROM repo_index_state LIMIT 1",
            )
            .fetch_optional(conn)
            .await?;
            Ok(count.unwrap_or(0) as i64)
        })
    })
    .await?;
    Ok(count)
}
