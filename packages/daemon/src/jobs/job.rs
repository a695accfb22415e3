//! Job row model for the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Queue lifecycle states. PENDING rows are claimable; CLAIMED rows are
/// owned by exactly one worker; DONE and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Claimed => "CLAIMED",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }
}

/// All supported job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    FullIndex,
    ReindexFile,
    ReindexMany,
    DocsScan,
    TagRulesSync,
    EmbedMissing,
    EmbedSummaries,
    SummarizeFiles,
    SummarizeSymbols,
    RegenerateSummary,
}

impl JobType {
    pub const ALL: [JobType; 10] = [
        JobType::FullIndex,
        JobType::ReindexFile,
        JobType::ReindexMany,
        JobType::DocsScan,
        JobType::TagRulesSync,
        JobType::EmbedMissing,
        JobType::EmbedSummaries,
        JobType::SummarizeFiles,
        JobType::SummarizeSymbols,
        JobType::RegenerateSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullIndex => "FULL_INDEX",
            JobType::ReindexFile => "REINDEX_FILE",
            JobType::ReindexMany => "REINDEX_MANY",
            JobType::DocsScan => "DOCS_SCAN",
            JobType::TagRulesSync => "TAG_RULES_SYNC",
            JobType::EmbedMissing => "EMBED_MISSING",
            JobType::EmbedSummaries => "EMBED_SUMMARIES",
            JobType::SummarizeFiles => "SUMMARIZE_FILES",
            JobType::SummarizeSymbols => "SUMMARIZE_SYMBOLS",
            JobType::RegenerateSummary => "REGENERATE_SUMMARY",
        }
    }

    pub fn parse(s: &str) -> Option<JobType> {
        JobType::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Activity slug used in dedup keys (`"<repo>:<activity>"`).
    pub fn activity(&self) -> &'static str {
        match self {
            JobType::FullIndex => "full_index",
            JobType::ReindexFile => "reindex_file",
            JobType::ReindexMany => "reindex_many",
            JobType::DocsScan => "docs_scan",
            JobType::TagRulesSync => "tag_rules_sync",
            JobType::EmbedMissing => "embed_missing",
            JobType::EmbedSummaries => "embed_summaries",
            JobType::SummarizeFiles => "summarize_files",
            JobType::SummarizeSymbols => "summarize_symbols",
            JobType::RegenerateSummary => "regenerate_summary",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File-level operation carried by reindex payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileOp {
    Upsert,
    Delete,
}

/// One path entry in a REINDEX_MANY batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOp {
    pub path: String,
    pub op: FileOp,
}

/// Typed view over the opaque JSON payload stored on the job row.
///
/// External producers write plain JSON; decoding happens at the processor
/// boundary keyed by the row's job_type, so extra keys are tolerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobPayload {
    FullIndex {
        force: bool,
    },
    ReindexFile {
        path: String,
        op: FileOp,
        reason: Option<String>,
    },
    ReindexMany {
        entries: Vec<PathOp>,
        reason: Option<String>,
    },
    EmbedMissing {
        overrides: Option<Value>,
    },
    DocsScan,
    TagRulesSync,
    SummarizeFiles,
    SummarizeSymbols,
    EmbedSummaries,
    RegenerateSummary,
}

impl JobPayload {
    /// Wire representation stored in the `payload` JSONB column.
    pub fn to_value(&self) -> Value {
        match self {
            JobPayload::FullIndex { force } => serde_json::json!({ "force": force }),
            JobPayload::ReindexFile { path, op, reason } => {
                serde_json::json!({ "path": path, "op": op, "reason": reason })
            }
            JobPayload::ReindexMany { entries, reason } => {
                serde_json::json!({ "paths": entries, "reason": reason })
            }
            JobPayload::EmbedMissing { overrides } => match overrides {
                Some(v) => serde_json::json!({ "overrides": v }),
                None => serde_json::json!({}),
            },
            _ => serde_json::json!({}),
        }
    }

    /// Decode the payload for a given job type, validating required keys.
    pub fn from_value(job_type: JobType, value: &Value) -> CoreResult<JobPayload> {
        let get_str = |key: &str| -> Option<String> {
            value.get(key).and_then(|v| v.as_str()).map(str::to_string)
        };
        match job_type {
            JobType::FullIndex => Ok(JobPayload::FullIndex {
                force: value.get("force").and_then(|v| v.as_bool()).unwrap_or(false),
            }),
            JobType::ReindexFile => {
                let path = get_str("path").ok_or_else(|| {
                    CoreError::Validation("REINDEX_FILE payload missing 'path'".to_string())
                })?;
                let op = value
                    .get("op")
                    .map(|v| {
                        serde_json::from_value(v.clone()).map_err(|e| {
                            CoreError::Validation(format!("REINDEX_FILE invalid 'op': {e}"))
                        })
                    })
                    .transpose()?
                    .unwrap_or(FileOp::Upsert);
                Ok(JobPayload::ReindexFile {
                    path,
                    op,
                    reason: get_str("reason"),
                })
            }
            JobType::ReindexMany => {
                let entries = value
                    .get("paths")
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::Validation("REINDEX_MANY payload missing 'paths'".to_string())
                    })
                    .and_then(|v| {
                        serde_json::from_value::<Vec<PathOp>>(v).map_err(|e| {
                            CoreError::Validation(format!("REINDEX_MANY invalid 'paths': {e}"))
                        })
                    })?;
                Ok(JobPayload::ReindexMany {
                    entries,
                    reason: get_str("reason"),
                })
            }
            JobType::EmbedMissing => Ok(JobPayload::EmbedMissing {
                overrides: value.get("overrides").cloned(),
            }),
            JobType::DocsScan => Ok(JobPayload::DocsScan),
            JobType::TagRulesSync => Ok(JobPayload::TagRulesSync),
            JobType::SummarizeFiles => Ok(JobPayload::SummarizeFiles),
            JobType::SummarizeSymbols => Ok(JobPayload::SummarizeSymbols),
            JobType::EmbedSummaries => Ok(JobPayload::EmbedSummaries),
            JobType::RegenerateSummary => Ok(JobPayload::RegenerateSummary),
        }
    }
}

/// A row from `codegraph_control.job_queue`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub repo_name: String,
    pub schema_name: String,
    pub job_type: JobType,
    pub payload: Value,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub dedup_key: Option<String>,
}

impl Job {
    /// Decode this row's payload into its typed form.
    pub fn typed_payload(&self) -> CoreResult<JobPayload> {
        JobPayload::from_value(self.job_type, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_round_trips_through_wire_name() {
        for jt in JobType::ALL {
            assert_eq!(JobType::parse(jt.as_str()), Some(jt));
        }
        assert_eq!(JobType::parse("NOT_A_JOB"), None);
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&JobType::EmbedMissing).unwrap();
        assert_eq!(json, "\"EMBED_MISSING\"");
    }

    #[test]
    fn reindex_file_payload_requires_path() {
        let err = JobPayload::from_value(JobType::ReindexFile, &serde_json::json!({}));
        assert!(matches!(err, Err(CoreError::Validation(_))));
    }

    #[test]
    fn reindex_file_payload_defaults_op_to_upsert() {
        let payload =
            JobPayload::from_value(JobType::ReindexFile, &serde_json::json!({"path": "a.py"}))
                .unwrap();
        assert_eq!(
            payload,
            JobPayload::ReindexFile {
                path: "a.py".to_string(),
                op: FileOp::Upsert,
                reason: None,
            }
        );
    }

    #[test]
    fn reindex_many_round_trips() {
        let original = JobPayload::ReindexMany {
            entries: vec![
                PathOp {
                    path: "a.py".to_string(),
                    op: FileOp::Delete,
                },
                PathOp {
                    path: "b.py".to_string(),
                    op: FileOp::Upsert,
                },
            ],
            reason: Some("watch_batch".to_string()),
        };
        let wire = original.to_value();
        let decoded = JobPayload::from_value(JobType::ReindexMany, &wire).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_extra_keys_are_tolerated() {
        let payload = JobPayload::from_value(
            JobType::EmbedMissing,
            &serde_json::json!({"unexpected": true}),
        );
        assert!(payload.is_ok());
    }
}
