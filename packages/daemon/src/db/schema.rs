//! Schema management for multi-repo isolation.
//!
//! Each repository gets its own PostgreSQL schema so per-repo tables never
//! cross-contaminate. The control schema is always addressed with fully
//! qualified names; the scoped search-path mechanism here is reserved for
//! repo-scoped work.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::PgConnection;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult, ErrorEnvelope, RepoSuggestion};

/// Fixed name of the control namespace.
pub const CONTROL_SCHEMA: &str = "codegraph_control";

/// Prefix for per-repo namespaces.
pub const SCHEMA_PREFIX: &str = "codegraph_";

const CONTROL_DDL: &str = include_str!("../../ddl/control_schema.sql");
const REPO_DDL: &str = include_str!("../../ddl/repo_schema.sql");

/// Derive the namespace name for a repository: prefix plus the lowercased
/// name with every non-alphanumeric character collapsed to `_`.
pub fn schema_name_for(repo_name: &str) -> String {
    let sanitized: String = repo_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{SCHEMA_PREFIX}{sanitized}")
}

fn quote_ident(name: &str) -> CoreResult<String> {
    if name.contains('"') || name.contains('\0') {
        return Err(CoreError::Validation(format!(
            "invalid schema identifier: {name}"
        )));
    }
    Ok(format!("\"{name}\""))
}

/// Install the control namespace DDL. Idempotent.
pub async fn ensure_control_schema(pool: &PgPool) -> CoreResult<()> {
    sqlx::raw_sql(CONTROL_DDL).execute(pool).await?;
    Ok(())
}

/// Run `f` with the connection's search path scoped to `schema_name` (public
/// kept as fallback for extension types). The previous search path is
/// restored on every exit path, so nested scopes restore to the immediately
/// enclosing value.
pub async fn with_schema<'c, T, F>(
    conn: &'c mut PgConnection,
    schema_name: &str,
    f: F,
) -> CoreResult<T>
where
    F: for<'a> FnOnce(&'a mut PgConnection) -> BoxFuture<'a, CoreResult<T>>,
{
    let quoted = quote_ident(schema_name)?;
    let previous: String = sqlx::query_scalar("SHOW search_path")
        .fetch_one(&mut *conn)
        .await?;

    sqlx::query(&format!("SET search_path TO {quoted}, public"))
        .execute(&mut *conn)
        .await?;

    let result = f(&mut *conn).await;

    let restored = sqlx::query(&format!("SET search_path TO {previous}"))
        .execute(&mut *conn)
        .await;

    match (result, restored) {
        (Ok(value), Ok(_)) => Ok(value),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e.into()),
    }
}

async fn schema_exists(conn: &mut PgConnection, schema_name: &str) -> CoreResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(schema_name)
    .fetch_one(conn)
    .await?;
    Ok(exists)
}

async fn repo_table_exists(conn: &mut PgConnection, schema_name: &str) -> CoreResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
         WHERE table_schema = $1 AND table_name = 'repo')",
    )
    .bind(schema_name)
    .fetch_one(conn)
    .await?;
    Ok(exists)
}

async fn apply_repo_ddl(
    conn: &mut PgConnection,
    schema_name: &str,
    embedding_dimension: u32,
) -> CoreResult<()> {
    // Extensions are database-wide; create them outside the schema scope.
    sqlx::query("CREATE EXTENSION IF NOT EXISTS pgcrypto")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(&mut *conn)
        .await?;

    // Vector columns must match the active embedding model.
    let ddl: String = REPO_DDL
        .replace("vector(1536)", &format!("vector({embedding_dimension})"))
        .lines()
        .filter(|line| !line.trim_start().to_uppercase().starts_with("CREATE EXTENSION"))
        .collect::<Vec<_>>()
        .join("\n");

    // `with_schema`'s generic `for<'a> FnOnce(...) -> BoxFuture<'a, _>` bound
    // can't be satisfied by a `sqlx::raw_sql(..).execute(..)` call (known
    // sqlx/rustc HRTB limitation: "implementation of `Executor` is not
    // general enough"), so the scoping dance is inlined here with concrete
    // lifetimes instead of going through the shared helper.
    let quoted = quote_ident(schema_name)?;
    let previous: String = sqlx::query_scalar("SHOW search_path")
        .fetch_one(&mut *conn)
        .await?;

    sqlx::query(&format!("SET search_path TO {quoted}, public"))
        .execute(&mut *conn)
        .await?;

    let result = sqlx::raw_sql(&ddl).execute(&mut *conn).await.map(|_| ());

    let restored = sqlx::query(&format!("SET search_path TO {previous}"))
        .execute(&mut *conn)
        .await;

    match (result, restored) {
        (Ok(value), Ok(_)) => Ok(value),
        (Err(e), _) => Err(e.into()),
        (Ok(_), Err(e)) => Err(e.into()),
    }
}

/// Ensure a namespace exists and is initialized for a repository.
///
/// A well-formed existing namespace is reused. A partially initialized one
/// is an error unless `force`, in which case the namespace is dropped
/// cascadingly and rebuilt.
pub async fn ensure_initialized(
    pool: &PgPool,
    repo_name: &str,
    embedding_dimension: u32,
    force: bool,
) -> CoreResult<String> {
    let schema_name = schema_name_for(repo_name);
    let mut conn = pool.acquire().await?;

    if schema_exists(&mut conn, &schema_name).await? {
        if repo_table_exists(&mut conn, &schema_name).await? {
            let name = repo_name.to_string();
            let existing: Option<Uuid> = with_schema(&mut conn, &schema_name, move |conn| {
                Box::pin(async move {
                    let id = sqlx::query_scalar("SELECT id FROM repo WHERE name = $1")
                        .bind(&name)
                        .fetch_optional(conn)
                        .await?;
                    Ok(id)
                })
            })
            .await?;

            if existing.is_some() && !force {
                return Ok(schema_name);
            }
        }

        if !force {
            return Err(CoreError::SchemaExists(schema_name));
        }

        let quoted = quote_ident(&schema_name)?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {quoted} CASCADE"))
            .execute(&mut *conn)
            .await?;
    }

    let quoted = quote_ident(&schema_name)?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {quoted}"))
        .execute(&mut *conn)
        .await?;
    apply_repo_ddl(&mut conn, &schema_name, embedding_dimension).await?;

    Ok(schema_name)
}

/// Drop a repo namespace and everything in it.
pub async fn drop_repo_schema(pool: &PgPool, schema_name: &str) -> CoreResult<()> {
    let quoted = quote_ident(schema_name)?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {quoted} CASCADE"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Metadata for one repository namespace.
#[derive(Debug, Clone)]
pub struct RepoSchemaInfo {
    pub schema_name: String,
    pub repo_name: String,
    pub repo_id: Uuid,
    pub root_path: String,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub file_count: i32,
    pub symbol_count: i32,
    pub chunk_count: i32,
}

async fn prefixed_schemas(conn: &mut PgConnection) -> CoreResult<Vec<String>> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT schema_name FROM information_schema.schemata \
         WHERE schema_name LIKE $1 ORDER BY schema_name",
    )
    .bind(format!("{SCHEMA_PREFIX}%"))
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Enumerate all repository namespaces with their index state. Namespaces
/// that are not well-formed (e.g. the control schema itself) are skipped.
pub async fn list_repos(pool: &PgPool) -> CoreResult<Vec<RepoSchemaInfo>> {
    let mut conn = pool.acquire().await?;
    let schemas = prefixed_schemas(&mut conn).await?;

    let mut results = Vec::new();
    for schema_name in schemas {
        let schema = schema_name.clone();
        let rows = with_schema(&mut conn, &schema_name, |conn| {
            Box::pin(async move {
                let rows = sqlx::query(
                    "SELECT r.id AS repo_id, r.name AS repo_name, r.root_path, \
                            ris.last_indexed_at, \
                            COALESCE(ris.file_count, 0) AS file_count, \
                            COALESCE(ris.symbol_count, 0) AS symbol_count, \
                            COALESCE(ris.chunk_count, 0) AS chunk_count \
                     FROM repo r \
                     LEFT JOIN repo_index_state ris ON r.id = ris.repo_id \
                     ORDER BY r.created_at DESC",
                )
                .fetch_all(conn)
                .await?;
                Ok(rows)
            })
        })
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            // Schema matched the prefix but has no repo table; not ours.
            Err(_) => continue,
        };

        for row in rows {
            results.push(RepoSchemaInfo {
                schema_name: schema.clone(),
                repo_name: row.get("repo_name"),
                repo_id: row.get("repo_id"),
                root_path: row.get("root_path"),
                last_indexed_at: row.get("last_indexed_at"),
                file_count: row.get("file_count"),
                symbol_count: row.get("symbol_count"),
                chunk_count: row.get("chunk_count"),
            });
        }
    }

    Ok(results)
}

/// Resolve a repo name or opaque id to `(repo_id, schema_name)`.
///
/// Tries the namespace derived from the name first, then scans all prefixed
/// namespaces.
pub async fn resolve(pool: &PgPool, repo_or_id: &str) -> CoreResult<(Uuid, String)> {
    let mut conn = pool.acquire().await?;

    let mut candidates = Vec::new();
    if Uuid::parse_str(repo_or_id).is_err() {
        candidates.push(schema_name_for(repo_or_id));
    }
    for schema in prefixed_schemas(&mut conn).await? {
        if !candidates.contains(&schema) {
            candidates.push(schema);
        }
    }

    for schema_name in candidates {
        let lookup = repo_or_id.to_string();
        let found = with_schema(&mut conn, &schema_name, |conn| {
            Box::pin(async move {
                let id: Option<Uuid> = sqlx::query_scalar(
                    "SELECT id FROM repo WHERE name = $1 OR id::text = $1 LIMIT 1",
                )
                .bind(&lookup)
                .fetch_optional(conn)
                .await?;
                Ok(id)
            })
        })
        .await;

        match found {
            Ok(Some(id)) => return Ok((id, schema_name)),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }

    Err(CoreError::NamespaceMissing(repo_or_id.to_string()))
}

/// Normalized longest-common-subsequence ratio over lowercased names,
/// in `[0, 1]`.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()] as f64;
    2.0 * lcs / (a.len() + b.len()) as f64
}

/// Rank registered repo names by similarity to an unknown query.
pub async fn suggest_similar(
    pool: &PgPool,
    query: &str,
    threshold: f64,
    max_suggestions: usize,
) -> CoreResult<Vec<RepoSuggestion>> {
    let repos = list_repos(pool).await?;

    let mut scored: Vec<RepoSuggestion> = repos
        .into_iter()
        .map(|repo| {
            let similarity = name_similarity(query, &repo.repo_name);
            RepoSuggestion {
                name: repo.repo_name,
                schema: repo.schema_name,
                similarity: (similarity * 100.0).round() / 100.0,
            }
        })
        .filter(|s| s.similarity >= threshold)
        .collect();

    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    scored.truncate(max_suggestions);
    Ok(scored)
}

/// Resolve a repo, or build the actionable error envelope with fuzzy
/// suggestions for callers that can react automatically.
pub async fn resolve_with_suggestions(
    pool: &PgPool,
    repo_or_id: &str,
) -> CoreResult<Result<(Uuid, String), ErrorEnvelope>> {
    match resolve(pool, repo_or_id).await {
        Ok(found) => Ok(Ok(found)),
        Err(CoreError::NamespaceMissing(_)) => {
            let suggestions = suggest_similar(pool, repo_or_id, 0.6, 3).await?;
            let available_repos = if suggestions.is_empty() {
                list_repos(pool)
                    .await?
                    .into_iter()
                    .map(|r| r.repo_name)
                    .collect()
            } else {
                Vec::new()
            };
            Ok(Err(ErrorEnvelope {
                error: format!("Repository '{repo_or_id}' not found"),
                query: repo_or_id.to_string(),
                suggestions,
                available_repos,
                why: "Repository not found in any schema".to_string(),
                recovery_hint: "Did you mean one of the suggested repositories? \
                                Use `repo ls` to see all available repositories."
                    .to_string(),
            }))
        }
        Err(e) => Err(e),
    }
}
