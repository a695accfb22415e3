//! Indexing processors: FULL_INDEX, REINDEX_FILE, REINDEX_MANY.
//!
//! The scanner here is deliberately plain. It walks the tree, hashes file
//! contents, window-chunks them, and pulls out top-level definitions with a
//! single regex; anything smarter belongs to the parsing collaborators and
//! is out of scope for the coordination core.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnection;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{Processor, ProcessorContext};
use crate::db::schema::with_schema;
use crate::error::{CoreError, CoreResult};
use crate::jobs::job::{FileOp, Job, JobPayload};

/// Source extensions the indexer and the watcher consider.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "py", "js", "jsx", "ts", "tsx", "go", "java", "rs", "rb", "c", "h", "cpp", "hpp",
];

/// Lines per content chunk.
const CHUNK_LINES: usize = 80;

/// Whether a path has a supported source extension.
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Whether a relative path matches any ignore pattern (substring match).
pub fn is_ignored(rel_path: &str, ignore_patterns: &[String]) -> bool {
    ignore_patterns.iter().any(|p| rel_path.contains(p.as_str()))
}

fn language_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str())? {
        "py" => Some("python"),
        "js" | "jsx" => Some("javascript"),
        "ts" | "tsx" => Some("typescript"),
        "go" => Some("go"),
        "java" => Some("java"),
        "rs" => Some("rust"),
        "rb" => Some("ruby"),
        "c" | "h" => Some("c"),
        "cpp" | "hpp" => Some("cpp"),
        _ => None,
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// One scanned source file, ready for upsert.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub language: Option<&'static str>,
    pub content: String,
    pub content_hash: String,
    pub size_bytes: i64,
}

/// A top-level definition extracted from a scanned file.
#[derive(Debug, Clone)]
struct ExtractedSymbol {
    name: String,
    kind: String,
    start_line: i32,
    end_line: i32,
}

fn definition_regex() -> Regex {
    // One pattern across the supported languages; good enough to populate
    // the symbol table the summarizers read.
    Regex::new(
        r"^\s*(?:pub(?:\([a-z]+\))?\s+)?(?:export\s+)?(?:async\s+)?(fn|def|class|func|function|struct|enum|trait|interface|type)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("definition regex is valid")
}

fn extract_symbols(content: &str) -> Vec<ExtractedSymbol> {
    let re = definition_regex();
    let lines: Vec<&str> = content.lines().collect();
    let mut symbols = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = re.captures(line) {
            symbols.push(ExtractedSymbol {
                kind: caps[1].to_string(),
                name: caps[2].to_string(),
                start_line: (i + 1) as i32,
                end_line: (i + 1) as i32,
            });
        }
    }
    // Close each symbol at the line before the next one starts.
    let total = lines.len() as i32;
    for i in 0..symbols.len() {
        symbols[i].end_line = symbols
            .get(i + 1)
            .map(|next| (next.start_line - 1).max(symbols[i].start_line))
            .unwrap_or(total.max(symbols[i].start_line));
    }
    symbols
}

fn chunk_content(content: &str) -> Vec<(i32, i32, String)> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    lines
        .chunks(CHUNK_LINES)
        .enumerate()
        .map(|(i, window)| {
            let start = (i * CHUNK_LINES + 1) as i32;
            let end = (i * CHUNK_LINES + window.len()) as i32;
            (start, end, window.join("\n"))
        })
        .collect()
}

/// Walk a repo root and scan every supported, non-ignored file. Runs on the
/// blocking pool; repos can be large.
pub async fn scan_repository(
    root: PathBuf,
    ignore_patterns: Vec<String>,
) -> CoreResult<Vec<ScannedFile>> {
    let scanned = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_supported(entry.path()) {
                continue;
            }
            let rel_path = match entry.path().strip_prefix(&root) {
                Ok(rel) => rel.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if is_ignored(&rel_path, &ignore_patterns) {
                continue;
            }
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                // Binary or unreadable; not indexable.
                Err(_) => continue,
            };
            files.push(ScannedFile {
                language: language_for(entry.path()),
                content_hash: sha256_hex(content.as_bytes()),
                size_bytes: content.len() as i64,
                rel_path,
                content,
            });
        }
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        files
    })
    .await
    .map_err(|e| CoreError::Processor(anyhow::anyhow!("scan task failed: {e}")))?;

    Ok(scanned)
}

/// Scan a single file under the repo root. None when the file is gone,
/// unsupported, or ignored.
pub async fn scan_file(
    root: &Path,
    rel_path: &str,
    ignore_patterns: &[String],
) -> CoreResult<Option<ScannedFile>> {
    if is_ignored(rel_path, ignore_patterns) {
        return Ok(None);
    }
    let abs = root.join(rel_path);
    if !is_supported(&abs) {
        return Ok(None);
    }
    let content = match tokio::fs::read_to_string(&abs).await {
        Ok(content) => content,
        Err(_) => return Ok(None),
    };
    Ok(Some(ScannedFile {
        language: language_for(&abs),
        content_hash: sha256_hex(content.as_bytes()),
        size_bytes: content.len() as i64,
        rel_path: rel_path.to_string(),
        content,
    }))
}

/// Strip the repo root from an absolute watcher path; pass relative paths
/// through untouched.
pub fn relative_to_root(root: &Path, path: &str) -> String {
    let p = Path::new(path);
    p.strip_prefix(root)
        .map(|rel| rel.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string())
}

async fn repo_id_in_schema(conn: &mut PgConnection, repo_name: &str) -> CoreResult<Uuid> {
    let repo_name = repo_name.to_string();
    let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM repo WHERE name = $1")
        .bind(&repo_name)
        .fetch_optional(conn)
        .await?;
    id.ok_or(CoreError::NamespaceMissing(repo_name))
}

/// Upsert one scanned file and its chunks/symbols. Unchanged files (same
/// content hash) are left alone so replays are cheap and idempotent.
async fn upsert_scanned_file(
    conn: &mut PgConnection,
    repo_id: Uuid,
    file: &ScannedFile,
) -> CoreResult<bool> {
    let unchanged: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM file WHERE repo_id = $1 AND path = $2 AND content_hash = $3",
    )
    .bind(repo_id)
    .bind(&file.rel_path)
    .bind(&file.content_hash)
    .fetch_optional(&mut *conn)
    .await?;
    if unchanged.is_some() {
        return Ok(false);
    }

    let file_id: Uuid = sqlx::query_scalar(
        "INSERT INTO file (repo_id, path, language, content_hash, size_bytes, indexed_at) \
         VALUES ($1, $2, $3, $4, $5, now()) \
         ON CONFLICT (repo_id, path) DO UPDATE \
             SET language = EXCLUDED.language, \
                 content_hash = EXCLUDED.content_hash, \
                 size_bytes = EXCLUDED.size_bytes, \
                 indexed_at = now() \
         RETURNING id",
    )
    .bind(repo_id)
    .bind(&file.rel_path)
    .bind(file.language)
    .bind(&file.content_hash)
    .bind(file.size_bytes)
    .fetch_one(&mut *conn)
    .await?;

    // Replace derived rows wholesale; embeddings for dropped chunks cascade.
    sqlx::query("DELETE FROM chunk WHERE file_id = $1")
        .bind(file_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM symbol WHERE file_id = $1")
        .bind(file_id)
        .execute(&mut *conn)
        .await?;

    for (start, end, content) in chunk_content(&file.content) {
        let hash = sha256_hex(content.as_bytes());
        sqlx::query(
            "INSERT INTO chunk (file_id, start_line, end_line, content, content_hash) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(file_id)
        .bind(start)
        .bind(end)
        .bind(&content)
        .bind(&hash)
        .execute(&mut *conn)
        .await?;
    }

    for symbol in extract_symbols(&file.content) {
        sqlx::query(
            "INSERT INTO symbol (file_id, name, kind, start_line, end_line) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(file_id)
        .bind(&symbol.name)
        .bind(&symbol.kind)
        .bind(symbol.start_line)
        .bind(symbol.end_line)
        .execute(&mut *conn)
        .await?;
    }

    Ok(true)
}

async fn delete_file_row(conn: &mut PgConnection, repo_id: Uuid, rel_path: &str) -> CoreResult<()> {
    sqlx::query("DELETE FROM file WHERE repo_id = $1 AND path = $2")
        .bind(repo_id)
        .bind(rel_path)
        .execute(conn)
        .await?;
    Ok(())
}

/// Refresh the repo_index_state counters after any index mutation.
async fn refresh_index_state(
    conn: &mut PgConnection,
    repo_id: Uuid,
    scan_hash: Option<String>,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE repo_index_state SET \
             last_indexed_at = now(), \
             last_scan_hash = COALESCE($2, last_scan_hash), \
             file_count = (SELECT COUNT(*) FROM file WHERE repo_id = $1), \
             symbol_count = (SELECT COUNT(*) FROM symbol s \
                             JOIN file f ON f.id = s.file_id WHERE f.repo_id = $1), \
             chunk_count = (SELECT COUNT(*) FROM chunk c \
                            JOIN file f ON f.id = c.file_id WHERE f.repo_id = $1), \
             edge_count = (SELECT COUNT(*) FROM edge e \
                           JOIN symbol s ON s.id = e.src_symbol_id \
                           JOIN file f ON f.id = s.file_id WHERE f.repo_id = $1), \
             last_error = NULL \
         WHERE repo_id = $1",
    )
    .bind(repo_id)
    .bind(scan_hash)
    .execute(conn)
    .await?;
    Ok(())
}

/// Full repository reindex.
pub struct FullIndexProcessor {
    ctx: Arc<ProcessorContext>,
}

impl FullIndexProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for FullIndexProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        job.typed_payload()?;
        let registration = self.ctx.registration(&job.repo_name).await?;
        let ignore = self.ctx.config.watcher.ignore_patterns.clone();

        let scanned =
            scan_repository(PathBuf::from(&registration.root_path), ignore).await?;
        let scan_hash = sha256_hex(
            scanned
                .iter()
                .map(|f| f.content_hash.as_str())
                .collect::<Vec<_>>()
                .join("\n")
                .as_bytes(),
        );

        let repo_name = job.repo_name.clone();
        let mut conn = self.ctx.pool.acquire().await?;
        let (indexed, removed) = with_schema(&mut conn, &registration.schema_name, |conn| {
            Box::pin(async move {
                let repo_id = repo_id_in_schema(conn, &repo_name).await?;

                let mut indexed = 0usize;
                for file in &scanned {
                    if upsert_scanned_file(conn, repo_id, file).await? {
                        indexed += 1;
                    }
                }

                // Drop rows for files no longer on disk.
                let seen: Vec<String> = scanned.iter().map(|f| f.rel_path.clone()).collect();
                let removed = sqlx::query(
                    "DELETE FROM file WHERE repo_id = $1 AND path <> ALL($2)",
                )
                .bind(repo_id)
                .bind(&seen)
                .execute(&mut *conn)
                .await?
                .rows_affected();

                refresh_index_state(conn, repo_id, Some(scan_hash)).await?;
                Ok((indexed, removed))
            })
        })
        .await?;

        info!(repo = %job.repo_name, indexed, removed, "full index complete");
        Ok(())
    }
}

/// Single-file incremental reindex.
pub struct ReindexFileProcessor {
    ctx: Arc<ProcessorContext>,
}

impl ReindexFileProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn apply_op(
        &self,
        job: &Job,
        registration: &crate::db::registry::RepoRegistration,
        path: &str,
        op: FileOp,
    ) -> CoreResult<()> {
        let root = PathBuf::from(&registration.root_path);
        let rel_path = relative_to_root(&root, path);

        let scanned = match op {
            FileOp::Upsert => {
                scan_file(&root, &rel_path, &self.ctx.config.watcher.ignore_patterns).await?
            }
            FileOp::Delete => None,
        };
        // A missing or unsupported upsert target degrades to a delete so
        // the index never keeps rows for files it cannot re-read.
        let mut conn = self.ctx.pool.acquire().await?;
        let repo_name = job.repo_name.clone();
        with_schema(&mut conn, &registration.schema_name, |conn| {
            Box::pin(async move {
                let repo_id = repo_id_in_schema(conn, &repo_name).await?;
                match &scanned {
                    Some(file) => {
                        upsert_scanned_file(conn, repo_id, file).await?;
                    }
                    None => {
                        delete_file_row(conn, repo_id, &rel_path).await?;
                    }
                }
                refresh_index_state(conn, repo_id, None).await?;
                Ok(())
            })
        })
        .await
    }
}

#[async_trait]
impl Processor for ReindexFileProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        let (path, op) = match job.typed_payload()? {
            JobPayload::ReindexFile { path, op, .. } => (path, op),
            _ => return Err(CoreError::Validation("unexpected payload".to_string())),
        };
        let registration = self.ctx.registration(&job.repo_name).await?;
        self.apply_op(job, &registration, &path, op).await?;
        debug!(repo = %job.repo_name, path, ?op, "reindexed file");
        Ok(())
    }
}

/// Batch incremental reindex.
pub struct ReindexManyProcessor {
    ctx: Arc<ProcessorContext>,
}

impl ReindexManyProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for ReindexManyProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        let entries = match job.typed_payload()? {
            JobPayload::ReindexMany { entries, .. } => entries,
            _ => return Err(CoreError::Validation("unexpected payload".to_string())),
        };
        let registration = self.ctx.registration(&job.repo_name).await?;

        let single = ReindexFileProcessor::new(self.ctx.clone());
        for entry in &entries {
            single.apply_op(job, &registration, &entry.path, entry.op).await?;
        }
        info!(repo = %job.repo_name, count = entries.len(), "batch reindex complete");
        Ok(())
    }
}
