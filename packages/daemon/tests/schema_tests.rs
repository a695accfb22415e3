//! Integration tests for schema management: idempotent initialization,
//! namespace isolation, resolution, and fuzzy suggestions.

mod common;

use sqlx::Row;
use uuid::Uuid;

use codegraph_core::db::registry;
use codegraph_core::db::schema::{self, with_schema};
use codegraph_core::error::CoreError;

use common::{test_pool, unique_repo_name};

const DIMENSION: u32 = 8;

async fn seed_file(pool: &sqlx::PgPool, schema_name: &str, repo_name: &str, path: &str) {
    let mut conn = pool.acquire().await.expect("acquire");
    let repo_name = repo_name.to_string();
    let path = path.to_string();
    with_schema(&mut conn, schema_name, move |conn| {
        Box::pin(async move {
            let repo_id: Uuid = sqlx::query_scalar("SELECT id FROM repo WHERE name = $1")
                .bind(&repo_name)
                .fetch_one(&mut *conn)
                .await?;
            sqlx::query(
                "INSERT INTO file (repo_id, path, content_hash, size_bytes) \
                 VALUES ($1, $2, 'deadbeef', 1) \
                 ON CONFLICT (repo_id, path) DO NOTHING",
            )
            .bind(repo_id)
            .bind(&path)
            .execute(&mut *conn)
            .await?;
            Ok(())
        })
    })
    .await
    .expect("seed file");
}

async fn file_paths_in(pool: &sqlx::PgPool, schema_name: &str) -> Vec<String> {
    let mut conn = pool.acquire().await.expect("acquire");
    with_schema(&mut conn, schema_name, |conn| {
        Box::pin(async move {
            let paths: Vec<String> =
                sqlx::query_scalar("SELECT path FROM file ORDER BY path")
                    .fetch_all(conn)
                    .await?;
            Ok(paths)
        })
    })
    .await
    .expect("list files")
}

#[tokio::test]
async fn ensure_initialized_is_idempotent() {
    let pool = test_pool().await;
    let repo = unique_repo_name("idempotent");

    let registration = registry::register_repo(&pool, &repo, "/tmp/nowhere", DIMENSION, false)
        .await
        .expect("register");
    seed_file(&pool, &registration.schema_name, &repo, "src/a.py").await;

    // A second initialization returns the same namespace and leaves the
    // data alone.
    let again = schema::ensure_initialized(&pool, &repo, DIMENSION, false)
        .await
        .expect("reinitialize");
    assert_eq!(again, registration.schema_name);
    assert_eq!(
        file_paths_in(&pool, &registration.schema_name).await,
        vec!["src/a.py".to_string()]
    );
}

#[tokio::test]
async fn force_reinitialize_drops_existing_rows() {
    let pool = test_pool().await;
    let repo = unique_repo_name("force");

    let registration = registry::register_repo(&pool, &repo, "/tmp/nowhere", DIMENSION, false)
        .await
        .expect("register");
    seed_file(&pool, &registration.schema_name, &repo, "src/a.py").await;

    registry::register_repo(&pool, &repo, "/tmp/nowhere", DIMENSION, true)
        .await
        .expect("force register");
    assert!(file_paths_in(&pool, &registration.schema_name).await.is_empty());
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let pool = test_pool().await;
    let repo_a = unique_repo_name("iso-a");
    let repo_b = unique_repo_name("iso-b");

    let reg_a = registry::register_repo(&pool, &repo_a, "/tmp/a", DIMENSION, false)
        .await
        .expect("register a");
    let reg_b = registry::register_repo(&pool, &repo_b, "/tmp/b", DIMENSION, false)
        .await
        .expect("register b");

    seed_file(&pool, &reg_a.schema_name, &repo_a, "only_in_a.py").await;
    seed_file(&pool, &reg_b.schema_name, &repo_b, "only_in_b.py").await;

    // Each scope sees exactly its own rows.
    assert_eq!(
        file_paths_in(&pool, &reg_a.schema_name).await,
        vec!["only_in_a.py".to_string()]
    );
    assert_eq!(
        file_paths_in(&pool, &reg_b.schema_name).await,
        vec!["only_in_b.py".to_string()]
    );
}

#[tokio::test]
async fn nested_scopes_restore_to_enclosing_schema() {
    let pool = test_pool().await;
    let repo_outer = unique_repo_name("nest-outer");
    let repo_inner = unique_repo_name("nest-inner");

    let outer = registry::register_repo(&pool, &repo_outer, "/tmp/outer", DIMENSION, false)
        .await
        .expect("register outer");
    let inner = registry::register_repo(&pool, &repo_inner, "/tmp/inner", DIMENSION, false)
        .await
        .expect("register inner");
    seed_file(&pool, &outer.schema_name, &repo_outer, "outer.py").await;
    seed_file(&pool, &inner.schema_name, &repo_inner, "inner.py").await;

    let mut conn = pool.acquire().await.expect("acquire");
    let inner_schema = inner.schema_name.clone();
    let paths = with_schema(&mut conn, &outer.schema_name, move |conn| {
        Box::pin(async move {
            let inner_paths: Vec<String> = with_schema(conn, &inner_schema, |conn| {
                Box::pin(async move {
                    let paths = sqlx::query_scalar("SELECT path FROM file").fetch_all(conn).await?;
                    Ok(paths)
                })
            })
            .await?;

            // Back in the outer scope after the nested call returns.
            let outer_paths: Vec<String> =
                sqlx::query_scalar("SELECT path FROM file").fetch_all(&mut *conn).await?;
            Ok((inner_paths, outer_paths))
        })
    })
    .await
    .expect("nested scopes");

    assert_eq!(paths.0, vec!["inner.py".to_string()]);
    assert_eq!(paths.1, vec!["outer.py".to_string()]);
}

#[tokio::test]
async fn search_path_is_restored_after_errors() {
    let pool = test_pool().await;
    let repo = unique_repo_name("restore-err");
    let registration = registry::register_repo(&pool, &repo, "/tmp/x", DIMENSION, false)
        .await
        .expect("register");

    let mut conn = pool.acquire().await.expect("acquire");
    let before: String = sqlx::query_scalar("SHOW search_path")
        .fetch_one(&mut *conn)
        .await
        .expect("show");

    let result: Result<(), CoreError> = with_schema(&mut conn, &registration.schema_name, |conn| {
        Box::pin(async move {
            // A failing statement inside the scope.
            sqlx::query("SELECT * FROM table_that_does_not_exist")
                .execute(conn)
                .await?;
            Ok(())
        })
    })
    .await;
    assert!(result.is_err());

    let after: String = sqlx::query_scalar("SHOW search_path")
        .fetch_one(&mut *conn)
        .await
        .expect("show");
    assert_eq!(before, after);
}

#[tokio::test]
async fn resolve_finds_repo_by_name_and_id() {
    let pool = test_pool().await;
    let repo = unique_repo_name("resolve");
    let registration = registry::register_repo(&pool, &repo, "/tmp/x", DIMENSION, false)
        .await
        .expect("register");

    let (by_name_id, by_name_schema) = schema::resolve(&pool, &repo).await.expect("resolve name");
    assert_eq!(by_name_schema, registration.schema_name);

    let (by_id_id, by_id_schema) = schema::resolve(&pool, &by_name_id.to_string())
        .await
        .expect("resolve id");
    assert_eq!(by_id_id, by_name_id);
    assert_eq!(by_id_schema, registration.schema_name);
}

#[tokio::test]
async fn unknown_repo_yields_envelope_with_similar_suggestion() {
    let pool = test_pool().await;
    // The canonical lookup-miss: a prefixed variant of a registered name.
    let repo = format!("wrestling-game-{}", &Uuid::new_v4().simple().to_string()[..6]);
    registry::register_repo(&pool, &repo, "/tmp/x", DIMENSION, false)
        .await
        .expect("register");

    let query = format!("yonk-redo-{repo}");
    let outcome = schema::resolve_with_suggestions(&pool, &query)
        .await
        .expect("resolve with suggestions");

    let envelope = outcome.expect_err("lookup must miss");
    assert_eq!(envelope.query, query);
    let suggested = envelope
        .suggestions
        .iter()
        .find(|s| s.name == repo)
        .expect("registered repo is suggested");
    assert!(suggested.similarity > 0.7, "similarity {}", suggested.similarity);
    assert!(!envelope.recovery_hint.is_empty());
}

#[tokio::test]
async fn list_repos_skips_malformed_namespaces() {
    let pool = test_pool().await;
    let repo = unique_repo_name("wellformed");
    registry::register_repo(&pool, &repo, "/tmp/x", DIMENSION, false)
        .await
        .expect("register");

    // A prefixed schema without a repo table (the control schema itself
    // also matches the prefix) must not break enumeration.
    sqlx::query("CREATE SCHEMA IF NOT EXISTS codegraph_not_a_repo")
        .execute(&pool)
        .await
        .expect("create stray schema");

    let repos = schema::list_repos(&pool).await.expect("list");
    assert!(repos.iter().any(|r| r.repo_name == repo));
    assert!(repos.iter().all(|r| r.schema_name != "codegraph_not_a_repo"));

    let row = sqlx::query("SELECT COUNT(*) AS n FROM codegraph_control.repo_registry")
        .fetch_one(&pool)
        .await
        .expect("control stays queryable");
    let _: i64 = row.get("n");
}
