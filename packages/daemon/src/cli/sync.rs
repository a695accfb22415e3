//! Change-set extraction for the one-shot `sync` command.
//!
//! Two sources: a git ref range (base..head, or base..workdir when no head
//! is given) and a unified-diff patch file.

use std::path::Path;

use anyhow::{Context, Result};
use git2::{Delta, Repository};
use regex::Regex;

use crate::jobs::job::{FileOp, PathOp};

fn delta_op(status: Delta) -> Option<FileOp> {
    match status {
        Delta::Added | Delta::Modified | Delta::Copied | Delta::Typechange => Some(FileOp::Upsert),
        Delta::Deleted => Some(FileOp::Delete),
        // Renames arrive with both sides; handled explicitly below.
        Delta::Renamed => None,
        _ => None,
    }
}

/// Diff `base` against `head` (or the working tree) and project the deltas
/// into reindex path operations.
pub fn changes_from_git(repo_path: &Path, base: &str, head: Option<&str>) -> Result<Vec<PathOp>> {
    let repo = Repository::discover(repo_path)
        .with_context(|| format!("not a git repository: {}", repo_path.display()))?;

    let base_tree = repo
        .revparse_single(base)
        .with_context(|| format!("unknown base ref: {base}"))?
        .peel_to_tree()
        .context("base ref does not point at a tree")?;

    let diff = match head {
        Some(head) => {
            let head_tree = repo
                .revparse_single(head)
                .with_context(|| format!("unknown head ref: {head}"))?
                .peel_to_tree()
                .context("head ref does not point at a tree")?;
            repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?
        }
        None => repo.diff_tree_to_workdir_with_index(Some(&base_tree), None)?,
    };

    let mut ops = Vec::new();
    for delta in diff.deltas() {
        match delta.status() {
            Delta::Renamed => {
                if let Some(path) = delta.old_file().path() {
                    ops.push(PathOp {
                        path: path.to_string_lossy().to_string(),
                        op: FileOp::Delete,
                    });
                }
                if let Some(path) = delta.new_file().path() {
                    ops.push(PathOp {
                        path: path.to_string_lossy().to_string(),
                        op: FileOp::Upsert,
                    });
                }
            }
            status => {
                let Some(op) = delta_op(status) else { continue };
                let file = match op {
                    FileOp::Delete => delta.old_file(),
                    FileOp::Upsert => delta.new_file(),
                };
                if let Some(path) = file.path() {
                    ops.push(PathOp {
                        path: path.to_string_lossy().to_string(),
                        op,
                    });
                }
            }
        }
    }
    Ok(ops)
}

/// Extract path operations from a unified diff. `+++ /dev/null` marks a
/// deletion; everything else is an upsert of the new side.
pub fn changes_from_patch(patch: &str) -> Result<Vec<PathOp>> {
    let old_re = Regex::new(r"(?m)^--- (?:a/)?(.+)$").expect("old-side regex is valid");
    let new_re = Regex::new(r"(?m)^\+\+\+ (?:b/)?(.+)$").expect("new-side regex is valid");

    let old_paths: Vec<&str> = old_re.captures_iter(patch).map(|c| c.get(1).map(|m| m.as_str()).unwrap_or("")).collect();
    let new_paths: Vec<&str> = new_re.captures_iter(patch).map(|c| c.get(1).map(|m| m.as_str()).unwrap_or("")).collect();

    let mut ops = Vec::new();
    for (old, new) in old_paths.iter().zip(new_paths.iter()) {
        let old = old.trim();
        let new = new.trim();
        if new == "/dev/null" {
            if old != "/dev/null" {
                ops.push(PathOp {
                    path: old.to_string(),
                    op: FileOp::Delete,
                });
            }
        } else {
            ops.push(PathOp {
                path: new.to_string(),
                op: FileOp::Upsert,
            });
        }
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_paths_project_to_ops() {
        let patch = "\
--- a/src/app.py
+++ b/src/app.py
@@ -1 +1 @@
-old
+new
--- a/src/gone.py
+++ /dev/null
@@ -1 +0,0 @@
-bye
--- /dev/null
+++ b/src/fresh.py
@@ -0,0 +1 @@
+hello
";
        let ops = changes_from_patch(patch).unwrap();
        assert_eq!(
            ops,
            vec![
                PathOp { path: "src/app.py".to_string(), op: FileOp::Upsert },
                PathOp { path: "src/gone.py".to_string(), op: FileOp::Delete },
                PathOp { path: "src/fresh.py".to_string(), op: FileOp::Upsert },
            ]
        );
    }

    #[test]
    fn empty_patch_yields_no_ops() {
        assert!(changes_from_patch("").unwrap().is_empty());
    }
}
