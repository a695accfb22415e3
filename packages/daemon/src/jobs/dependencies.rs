//! Canonical priorities and the follow-up dependency map.
//!
//! Indexing pipeline flow:
//!
//! ```text
//!   FULL_INDEX
//!        |
//!        +---> DOCS_SCAN
//!        |          |
//!        |          +---> SUMMARIZE_FILES    [if auto_summaries]
//!        |          |          +---> EMBED_SUMMARIES  [if auto_embed]
//!        |          +---> SUMMARIZE_SYMBOLS  [if auto_summaries]
//!        |                     +---> EMBED_SUMMARIES  [if auto_embed]
//!        +---> EMBED_MISSING                 [if auto_embed]
//!        +---> REGENERATE_SUMMARY
//!
//!   REINDEX_FILE  ---> EMBED_MISSING         [if auto_embed]
//!   REINDEX_MANY  ---> EMBED_MISSING         [if auto_embed]
//!                 ---> REGENERATE_SUMMARY    [if >5% of files changed]
//! ```
//!
//! Follow-up derivation is a pure function of the completed job's type and
//! payload plus the repo's feature flags; the worker pool only supplies
//! inputs and enqueues the outputs.

use serde_json::Value;

use super::job::{JobPayload, JobType};

/// Threshold above which a batch reindex triggers a comprehensive review.
const SUMMARY_REGEN_CHANGE_RATIO: f64 = 0.05;

/// Per-repo feature flags read from the registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoFlags {
    pub enabled: bool,
    pub auto_index: bool,
    pub auto_embed: bool,
    pub auto_watch: bool,
    pub auto_summaries: bool,
}

impl Default for RepoFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_index: true,
            auto_embed: true,
            auto_watch: true,
            auto_summaries: false,
        }
    }
}

/// A follow-up job to enqueue after a parent completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    pub job_type: JobType,
    pub priority: i32,
    /// Activity slug; the enqueuer derives `"<repo>:<activity>"` from it so
    /// a burst of parents collapses to one follow-up per activity.
    pub dedup_activity: &'static str,
}

impl FollowUp {
    fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            priority: priority_for(job_type),
            dedup_activity: job_type.activity(),
        }
    }

    pub fn dedup_key(&self, repo_name: &str) -> String {
        format!("{repo_name}:{}", self.dedup_activity)
    }
}

/// Canonical queue priority for each job type (higher runs earlier).
pub fn priority_for(job_type: JobType) -> i32 {
    match job_type {
        JobType::FullIndex | JobType::ReindexFile | JobType::ReindexMany => 10,
        JobType::DocsScan => 9,
        JobType::TagRulesSync => 7,
        JobType::EmbedMissing => 5,
        JobType::SummarizeFiles | JobType::SummarizeSymbols => 4,
        JobType::EmbedSummaries => 3,
        JobType::RegenerateSummary => 2,
    }
}

/// Compute the follow-ups for a successfully completed job.
///
/// `total_files` is the repo's current file count, used only for the
/// REINDEX_MANY change-ratio rule; everything else depends solely on the
/// parent type, its payload, and the flags.
pub fn follow_ups(
    parent: JobType,
    payload: &Value,
    flags: &RepoFlags,
    total_files: i64,
) -> Vec<FollowUp> {
    if !flags.enabled {
        return Vec::new();
    }

    let mut out = Vec::new();
    match parent {
        JobType::FullIndex => {
            out.push(FollowUp::new(JobType::DocsScan));
            if flags.auto_embed {
                out.push(FollowUp::new(JobType::EmbedMissing));
            }
            out.push(FollowUp::new(JobType::RegenerateSummary));
        }
        JobType::ReindexFile => {
            if flags.auto_embed {
                out.push(FollowUp::new(JobType::EmbedMissing));
            }
        }
        JobType::ReindexMany => {
            if flags.auto_embed {
                out.push(FollowUp::new(JobType::EmbedMissing));
            }
            if significant_change(parent, payload, total_files) {
                out.push(FollowUp::new(JobType::RegenerateSummary));
            }
        }
        JobType::DocsScan => {
            if flags.auto_summaries {
                out.push(FollowUp::new(JobType::SummarizeFiles));
                out.push(FollowUp::new(JobType::SummarizeSymbols));
            }
        }
        JobType::SummarizeFiles | JobType::SummarizeSymbols => {
            if flags.auto_embed {
                out.push(FollowUp::new(JobType::EmbedSummaries));
            }
        }
        JobType::EmbedMissing
        | JobType::EmbedSummaries
        | JobType::TagRulesSync
        | JobType::RegenerateSummary => {}
    }
    out
}

fn significant_change(parent: JobType, payload: &Value, total_files: i64) -> bool {
    if total_files <= 0 {
        return false;
    }
    let changed = match JobPayload::from_value(parent, payload) {
        Ok(JobPayload::ReindexMany { entries, .. }) => entries.len() as f64,
        _ => return false,
    };
    changed / total_files as f64 > SUMMARY_REGEN_CHANGE_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_flags() -> RepoFlags {
        RepoFlags {
            enabled: true,
            auto_index: true,
            auto_embed: true,
            auto_watch: true,
            auto_summaries: true,
        }
    }

    fn types(follow_ups: &[FollowUp]) -> Vec<JobType> {
        follow_ups.iter().map(|f| f.job_type).collect()
    }

    #[test]
    fn full_index_fans_out_to_docs_embed_and_summary() {
        let out = follow_ups(JobType::FullIndex, &json!({}), &all_flags(), 100);
        assert_eq!(
            types(&out),
            vec![
                JobType::DocsScan,
                JobType::EmbedMissing,
                JobType::RegenerateSummary
            ]
        );
    }

    #[test]
    fn full_index_without_auto_embed_skips_embeddings() {
        let flags = RepoFlags {
            auto_embed: false,
            ..all_flags()
        };
        let out = follow_ups(JobType::FullIndex, &json!({}), &flags, 100);
        assert_eq!(
            types(&out),
            vec![JobType::DocsScan, JobType::RegenerateSummary]
        );
    }

    #[test]
    fn disabled_repo_produces_no_follow_ups() {
        let flags = RepoFlags {
            enabled: false,
            ..all_flags()
        };
        assert!(follow_ups(JobType::FullIndex, &json!({}), &flags, 100).is_empty());
    }

    #[test]
    fn reindex_file_only_embeds() {
        let payload = json!({"path": "a.py", "op": "UPSERT"});
        let out = follow_ups(JobType::ReindexFile, &payload, &all_flags(), 100);
        assert_eq!(types(&out), vec![JobType::EmbedMissing]);
    }

    #[test]
    fn reindex_many_regenerates_summary_above_five_percent() {
        let entries: Vec<_> = (0..6)
            .map(|i| json!({"path": format!("f{i}.py"), "op": "UPSERT"}))
            .collect();
        let payload = json!({ "paths": entries });
        let out = follow_ups(JobType::ReindexMany, &payload, &all_flags(), 100);
        assert_eq!(
            types(&out),
            vec![JobType::EmbedMissing, JobType::RegenerateSummary]
        );
    }

    #[test]
    fn reindex_many_small_batch_skips_summary() {
        let payload = json!({"paths": [{"path": "a.py", "op": "UPSERT"}]});
        let out = follow_ups(JobType::ReindexMany, &payload, &all_flags(), 100);
        assert_eq!(types(&out), vec![JobType::EmbedMissing]);
    }

    #[test]
    fn docs_scan_gated_on_auto_summaries() {
        let out = follow_ups(JobType::DocsScan, &json!({}), &all_flags(), 100);
        assert_eq!(
            types(&out),
            vec![JobType::SummarizeFiles, JobType::SummarizeSymbols]
        );

        let flags = RepoFlags {
            auto_summaries: false,
            ..all_flags()
        };
        assert!(follow_ups(JobType::DocsScan, &json!({}), &flags, 100).is_empty());
    }

    #[test]
    fn terminal_types_have_no_follow_ups() {
        for jt in [
            JobType::EmbedMissing,
            JobType::EmbedSummaries,
            JobType::TagRulesSync,
            JobType::RegenerateSummary,
        ] {
            assert!(follow_ups(jt, &json!({}), &all_flags(), 100).is_empty());
        }
    }

    #[test]
    fn follow_ups_carry_canonical_priorities_and_dedup_keys() {
        let out = follow_ups(JobType::FullIndex, &json!({}), &all_flags(), 100);
        let docs = &out[0];
        assert_eq!(docs.priority, 9);
        assert_eq!(docs.dedup_key("myrepo"), "myrepo:docs_scan");
        let embed = &out[1];
        assert_eq!(embed.priority, 5);
        assert_eq!(embed.dedup_key("myrepo"), "myrepo:embed_missing");
    }

    #[test]
    fn derivation_is_pure() {
        // Same inputs, same outputs, independent of call count or ordering.
        let payload = json!({"paths": [{"path": "a.py", "op": "DELETE"}]});
        let first = follow_ups(JobType::ReindexMany, &payload, &all_flags(), 10);
        let second = follow_ups(JobType::ReindexMany, &payload, &all_flags(), 10);
        assert_eq!(first, second);
    }
}
