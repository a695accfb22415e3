//! Error taxonomy for the coordination core.
//!
//! Worker-facing errors carry a classification that decides retry behavior:
//! validation failures burn all remaining attempts, transient store and
//! processor failures go through the ordinary backoff retry.

use serde::Serialize;
use thiserror::Error;

/// Errors produced by the coordination core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The store could not be reached or a statement failed with a
    /// transport error. Transient; jobs hitting this are retried.
    #[error("store unreachable: {0}")]
    Store(#[from] sqlx::Error),

    /// A repo name did not resolve to any namespace.
    #[error("repository '{0}' not found")]
    NamespaceMissing(String),

    /// A namespace exists but is not well-formed for this repo.
    #[error("schema '{0}' exists but is not properly initialized; use force to reinitialize")]
    SchemaExists(String),

    /// Malformed payload or missing required key.
    #[error("validation error: {0}")]
    Validation(String),

    /// Processor exceeded the configured per-job timeout.
    #[error("job timed out after {0} seconds")]
    Timeout(u64),

    /// Any other failure raised by a processor.
    #[error("processor error: {0}")]
    Processor(#[source] anyhow::Error),
}

impl CoreError {
    /// Whether a job failing with this error should keep its remaining
    /// retry budget. Validation-class errors are failed terminally.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CoreError::Validation(_) | CoreError::NamespaceMissing(_) | CoreError::Config(_)
        )
    }

    /// Short machine-readable kind tag recorded in `error_detail`.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config",
            CoreError::Store(_) => "store_unreachable",
            CoreError::NamespaceMissing(_) => "namespace_missing",
            CoreError::SchemaExists(_) => "schema_exists",
            CoreError::Validation(_) => "validation",
            CoreError::Timeout(_) => "timeout",
            CoreError::Processor(_) => "processor_error",
        }
    }

    /// Hint appended to structured error responses so callers can react
    /// without a human in the loop.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "Fix the configuration file and restart the daemon.",
            CoreError::Store(_) => "Check that PostgreSQL is reachable and the DSN is correct.",
            CoreError::NamespaceMissing(_) => {
                "Use `repo ls` to list registered repositories, or `index` to register one."
            }
            CoreError::SchemaExists(_) => "Re-run with --force to drop and reinitialize the schema.",
            CoreError::Validation(_) => "Inspect the job payload; this job will not be retried.",
            CoreError::Timeout(_) => "Increase workers.job_timeout_sec or split the work.",
            CoreError::Processor(_) => "The job will be retried with backoff; check the logs.",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Structured error envelope returned by management calls so callers can
/// recover automatically (suggest alternatives, list what exists).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub query: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<RepoSuggestion>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available_repos: Vec<String>,
    pub why: String,
    pub recovery_hint: String,
}

/// A fuzzy-matched repository name candidate.
#[derive(Debug, Clone, Serialize)]
pub struct RepoSuggestion {
    pub name: String,
    pub schema: String,
    pub similarity: f64,
}
