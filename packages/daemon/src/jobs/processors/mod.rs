//! Processor contract and registry.
//!
//! Each job type resolves to a processor: an opaque callable that performs
//! the work for a claimed job. Processors receive the shared pool and
//! configuration, do their own per-repo schema scoping, and must be
//! idempotent under replays (retries and dedup races cause them).

pub mod docs;
pub mod embed;
pub mod indexer;
pub mod summary;
pub mod tags;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::config::CoreConfig;
use crate::db::registry::RepoRegistration;
use crate::error::{CoreError, CoreResult};
use crate::jobs::job::{Job, JobType};

/// Shared dependencies handed to every processor.
#[derive(Clone)]
pub struct ProcessorContext {
    pub pool: PgPool,
    pub config: Arc<CoreConfig>,
}

impl ProcessorContext {
    pub fn new(pool: PgPool, config: Arc<CoreConfig>) -> Self {
        Self { pool, config }
    }

    /// Look up the registration for a job's repo, failing validation-fatal
    /// when the repo does not resolve.
    pub async fn registration(&self, repo_name: &str) -> CoreResult<RepoRegistration> {
        RepoRegistration::find_by_name(&self.pool, repo_name)
            .await?
            .ok_or_else(|| CoreError::NamespaceMissing(repo_name.to_string()))
    }
}

/// A callable registered against a job type.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> CoreResult<()>;
}

/// Maps job types to their processors.
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    /// Build the canonical registry: one processor per job type.
    pub fn build(ctx: ProcessorContext) -> Self {
        let mut registry = Self::new();
        let ctx = Arc::new(ctx);

        registry.register(
            JobType::FullIndex,
            Arc::new(indexer::FullIndexProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::ReindexFile,
            Arc::new(indexer::ReindexFileProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::ReindexMany,
            Arc::new(indexer::ReindexManyProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::DocsScan,
            Arc::new(docs::DocsScanProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::TagRulesSync,
            Arc::new(tags::TagRulesSyncProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::EmbedMissing,
            Arc::new(embed::EmbedMissingProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::EmbedSummaries,
            Arc::new(embed::EmbedSummariesProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::SummarizeFiles,
            Arc::new(summary::SummarizeFilesProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::SummarizeSymbols,
            Arc::new(summary::SummarizeSymbolsProcessor::new(ctx.clone())),
        );
        registry.register(
            JobType::RegenerateSummary,
            Arc::new(summary::RegenerateSummaryProcessor::new(ctx)),
        );

        registry
    }

    pub fn register(&mut self, job_type: JobType, processor: Arc<dyn Processor>) {
        self.processors.insert(job_type, processor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn Processor>> {
        self.processors.get(&job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.processors.keys().copied().collect()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProcessor;

    #[async_trait]
    impl Processor for NoopProcessor {
        async fn process(&self, _job: &Job) -> CoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ProcessorRegistry::new();
        registry.register(JobType::FullIndex, Arc::new(NoopProcessor));

        assert!(registry.get(JobType::FullIndex).is_some());
        assert!(registry.get(JobType::EmbedMissing).is_none());
    }
}
