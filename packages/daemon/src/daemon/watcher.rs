//! Filesystem watcher: translates file events for enabled, auto-watch
//! repos into queued reindex jobs with burst coalescing.
//!
//! The watcher is single-threaded cooperative: raw notify events are
//! bridged onto a channel, and one debounce loop suspends until either the
//! next event arrives or the debounce window elapses. It never claims jobs
//! itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::jobs::processors::indexer;
use crate::db::registry::RepoRegistration;
use crate::error::CoreResult;
use crate::jobs::job::{FileOp, JobType, PathOp};
use crate::jobs::queue::JobQueue;

/// Watch events run above scheduled reindexes, below interactive ones.
pub const WATCH_PRIORITY: i32 = 6;

/// A projected filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub repo_name: String,
    pub schema_name: String,
    /// Repo-relative path.
    pub path: String,
    pub op: FileOp,
    pub reason: &'static str,
}

/// One job to enqueue after a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushJob {
    Single(WatchEvent),
    Batch {
        repo_name: String,
        schema_name: String,
        entries: Vec<PathOp>,
    },
}

/// Pending-event map with latest-wins semantics per `(repo, path)`.
#[derive(Debug, Default)]
pub struct Coalescer {
    pending: HashMap<(String, String), WatchEvent>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Record an event; a later event for the same path wins.
    pub fn add(&mut self, event: WatchEvent) {
        self.pending
            .insert((event.repo_name.clone(), event.path.clone()), event);
    }

    /// Drain pending events into per-repo jobs: one REINDEX_FILE for a
    /// lone event, one REINDEX_MANY for a burst.
    pub fn drain(&mut self) -> Vec<FlushJob> {
        let mut by_repo: HashMap<String, Vec<WatchEvent>> = HashMap::new();
        for (_, event) in self.pending.drain() {
            by_repo.entry(event.repo_name.clone()).or_default().push(event);
        }

        let mut repos: Vec<String> = by_repo.keys().cloned().collect();
        repos.sort();

        let mut jobs = Vec::new();
        for repo in repos {
            let mut events = by_repo.remove(&repo).unwrap_or_default();
            events.sort_by(|a, b| a.path.cmp(&b.path));
            if events.len() == 1 {
                jobs.push(FlushJob::Single(events.remove(0)));
            } else {
                let schema_name = events[0].schema_name.clone();
                jobs.push(FlushJob::Batch {
                    repo_name: repo,
                    schema_name,
                    entries: events
                        .into_iter()
                        .map(|e| PathOp {
                            path: e.path,
                            op: e.op,
                        })
                        .collect(),
                });
            }
        }
        jobs
    }
}

/// One watched root with its repo attribution.
#[derive(Debug, Clone)]
pub struct WatchedRoot {
    pub repo_name: String,
    pub schema_name: String,
    pub root: PathBuf,
}

impl From<&RepoRegistration> for WatchedRoot {
    fn from(registration: &RepoRegistration) -> Self {
        Self {
            repo_name: registration.name.clone(),
            schema_name: registration.schema_name.clone(),
            root: PathBuf::from(&registration.root_path),
        }
    }
}

fn project_notify_event(
    event: &notify::Event,
    roots: &[WatchedRoot],
    ignore_patterns: &[String],
) -> Vec<WatchEvent> {
    // Moves surface as rename pairs; everything else is an upsert or a
    // delete on each affected path.
    let ops: Vec<(usize, FileOp, &'static str)> = match event.kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            (0..event.paths.len())
                .map(|i| (i, FileOp::Upsert, "file_created"))
                .collect()
        }
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
            (0..event.paths.len())
                .map(|i| (i, FileOp::Delete, "file_deleted"))
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => (0..event.paths.len())
            .map(|i| (i, FileOp::Delete, "file_moved_from"))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => (0..event.paths.len())
            .map(|i| (i, FileOp::Upsert, "file_moved_to"))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut ops = Vec::new();
            if !event.paths.is_empty() {
                ops.push((0, FileOp::Delete, "file_moved_from"));
            }
            if event.paths.len() > 1 {
                ops.push((1, FileOp::Upsert, "file_moved_to"));
            }
            ops
        }
        EventKind::Modify(_) => (0..event.paths.len())
            .map(|i| (i, FileOp::Upsert, "file_modified"))
            .collect(),
        _ => Vec::new(),
    };

    let mut projected = Vec::new();
    for (idx, op, reason) in ops {
        let Some(path) = event.paths.get(idx) else {
            continue;
        };
        if !indexer::is_supported(path) {
            continue;
        }
        let Some((root, rel_path)) = attribute_path(path, roots) else {
            continue;
        };
        if indexer::is_ignored(&rel_path, ignore_patterns) {
            continue;
        }
        projected.push(WatchEvent {
            repo_name: root.repo_name.clone(),
            schema_name: root.schema_name.clone(),
            path: rel_path,
            op,
            reason,
        });
    }
    projected
}

fn attribute_path<'r>(path: &Path, roots: &'r [WatchedRoot]) -> Option<(&'r WatchedRoot, String)> {
    roots.iter().find_map(|root| {
        path.strip_prefix(&root.root)
            .ok()
            .map(|rel| (root, rel.to_string_lossy().to_string()))
    })
}

/// Watches registered repositories and enqueues reindex jobs.
pub struct RepoWatcher {
    config: WatcherConfig,
    queue: JobQueue,
}

impl RepoWatcher {
    pub fn new(config: WatcherConfig, queue: JobQueue) -> Self {
        Self { config, queue }
    }

    /// Run until the shutdown gate is set. Repos are loaded once at start;
    /// a restart picks up registry changes.
    pub async fn run(self, shutdown: CancellationToken) -> CoreResult<()> {
        let repos = RepoRegistration::watched(self.queue.pool()).await?;
        let roots: Vec<WatchedRoot> = repos
            .iter()
            .filter(|r| {
                let exists = Path::new(&r.root_path).exists();
                if !exists {
                    warn!(repo = %r.name, path = %r.root_path, "watched path does not exist");
                }
                exists
            })
            .map(WatchedRoot::from)
            .collect();

        self.run_with(roots, shutdown).await
    }

    /// Run against an explicit root set; the standalone `watch` command
    /// uses this to cover a single repo.
    pub async fn run_with(
        self,
        roots: Vec<WatchedRoot>,
        shutdown: CancellationToken,
    ) -> CoreResult<()> {
        if roots.is_empty() {
            warn!("no repos configured for watching");
            shutdown.cancelled().await;
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(e) => error!(error = %e, "watch error"),
                }
            })
            .map_err(|e| crate::error::CoreError::Processor(anyhow::anyhow!(e)))?;

        for root in &roots {
            watcher
                .watch(&root.root, RecursiveMode::Recursive)
                .map_err(|e| crate::error::CoreError::Processor(anyhow::anyhow!(e)))?;
            info!(repo = %root.repo_name, path = %root.root.display(), "watching repo");
        }

        self.debounce_loop(rx, roots, shutdown).await;
        Ok(())
    }

    async fn debounce_loop(
        &self,
        mut rx: mpsc::UnboundedReceiver<notify::Event>,
        roots: Vec<WatchedRoot>,
        shutdown: CancellationToken,
    ) {
        let debounce = Duration::from_millis(self.config.debounce_ms);
        let mut coalescer = Coalescer::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = tokio::time::timeout(debounce, rx.recv()) => match received {
                    Ok(Some(event)) => {
                        for projected in
                            project_notify_event(&event, &roots, &self.config.ignore_patterns)
                        {
                            debug!(repo = %projected.repo_name, path = %projected.path,
                                   op = ?projected.op, "file event");
                            coalescer.add(projected);
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        if !coalescer.is_empty() {
                            self.flush(&mut coalescer).await;
                        }
                    }
                }
            }
        }

        // Drain whatever arrived before shutdown.
        if !coalescer.is_empty() {
            self.flush(&mut coalescer).await;
        }
        info!("file system watcher stopped");
    }

    async fn flush(&self, coalescer: &mut Coalescer) {
        let jobs = coalescer.drain();
        info!(count = jobs.len(), "flushing pending file events");

        for job in jobs {
            let result = match &job {
                FlushJob::Single(event) => {
                    let payload = serde_json::json!({
                        "path": event.path,
                        "op": event.op,
                        "reason": event.reason,
                    });
                    let dedup_key = format!(
                        "{}:{}:{}",
                        event.repo_name,
                        event.path,
                        match event.op {
                            FileOp::Upsert => "UPSERT",
                            FileOp::Delete => "DELETE",
                        }
                    );
                    self.queue
                        .enqueue(
                            &event.repo_name,
                            &event.schema_name,
                            JobType::ReindexFile,
                            payload,
                            WATCH_PRIORITY,
                            Some(&dedup_key),
                        )
                        .await
                }
                FlushJob::Batch {
                    repo_name,
                    schema_name,
                    entries,
                } => {
                    let payload = serde_json::json!({
                        "paths": entries,
                        "reason": "watch_batch",
                    });
                    self.queue
                        .enqueue(
                            repo_name,
                            schema_name,
                            JobType::ReindexMany,
                            payload,
                            WATCH_PRIORITY,
                            None,
                        )
                        .await
                }
            };

            if let Err(e) = result {
                error!(error = %e, "failed to enqueue watch job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(repo: &str, path: &str, op: FileOp) -> WatchEvent {
        WatchEvent {
            repo_name: repo.to_string(),
            schema_name: format!("codegraph_{repo}"),
            path: path.to_string(),
            op,
            reason: "test",
        }
    }

    #[test]
    fn single_event_flushes_as_reindex_file() {
        let mut coalescer = Coalescer::new();
        coalescer.add(event("r", "a.py", FileOp::Upsert));

        let jobs = coalescer.drain();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(&jobs[0], FlushJob::Single(e) if e.path == "a.py"));
        assert!(coalescer.is_empty());
    }

    #[test]
    fn burst_coalesces_to_one_job_per_repo_with_last_op_winning() {
        // create a.py, modify a.py, delete a.py, modify b.py within one
        // debounce window.
        let mut coalescer = Coalescer::new();
        coalescer.add(event("r", "a.py", FileOp::Upsert));
        coalescer.add(event("r", "a.py", FileOp::Upsert));
        coalescer.add(event("r", "a.py", FileOp::Delete));
        coalescer.add(event("r", "b.py", FileOp::Upsert));

        let jobs = coalescer.drain();
        assert_eq!(jobs.len(), 1);
        match &jobs[0] {
            FlushJob::Batch { entries, .. } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0], PathOp { path: "a.py".to_string(), op: FileOp::Delete });
                assert_eq!(entries[1], PathOp { path: "b.py".to_string(), op: FileOp::Upsert });
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn repos_flush_independently() {
        let mut coalescer = Coalescer::new();
        coalescer.add(event("alpha", "a.py", FileOp::Upsert));
        coalescer.add(event("beta", "b.py", FileOp::Upsert));
        coalescer.add(event("beta", "c.py", FileOp::Delete));

        let jobs = coalescer.drain();
        assert_eq!(jobs.len(), 2);
        assert!(matches!(&jobs[0], FlushJob::Single(e) if e.repo_name == "alpha"));
        assert!(matches!(&jobs[1], FlushJob::Batch { repo_name, .. } if repo_name == "beta"));
    }

    #[test]
    fn same_path_in_different_repos_does_not_collide() {
        let mut coalescer = Coalescer::new();
        coalescer.add(event("alpha", "main.py", FileOp::Upsert));
        coalescer.add(event("beta", "main.py", FileOp::Delete));
        assert_eq!(coalescer.len(), 2);
    }

    #[test]
    fn unsupported_and_ignored_paths_are_dropped() {
        let roots = vec![WatchedRoot {
            repo_name: "r".to_string(),
            schema_name: "codegraph_r".to_string(),
            root: PathBuf::from("/repos/r"),
        }];
        let ignore = vec!["node_modules".to_string()];

        let modify = notify::Event {
            kind: EventKind::Modify(ModifyKind::Any),
            paths: vec![
                PathBuf::from("/repos/r/README.md"),
                PathBuf::from("/repos/r/node_modules/x.js"),
                PathBuf::from("/repos/r/src/app.py"),
                PathBuf::from("/elsewhere/other.py"),
            ],
            attrs: Default::default(),
        };
        let projected = project_notify_event(&modify, &roots, &ignore);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].path, "src/app.py");
        assert_eq!(projected[0].op, FileOp::Upsert);
    }

    #[test]
    fn rename_projects_to_delete_plus_upsert() {
        let roots = vec![WatchedRoot {
            repo_name: "r".to_string(),
            schema_name: "codegraph_r".to_string(),
            root: PathBuf::from("/repos/r"),
        }];
        let rename = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![
                PathBuf::from("/repos/r/old.py"),
                PathBuf::from("/repos/r/new.py"),
            ],
            attrs: Default::default(),
        };
        let projected = project_notify_event(&rename, &roots, &[]);
        assert_eq!(projected.len(), 2);
        assert_eq!((projected[0].path.as_str(), projected[0].op), ("old.py", FileOp::Delete));
        assert_eq!((projected[1].path.as_str(), projected[1].op), ("new.py", FileOp::Upsert));
    }
}
