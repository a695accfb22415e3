//! TAG_RULES_SYNC processor: apply substring tag rules to indexed files.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{Processor, ProcessorContext};
use crate::db::schema::with_schema;
use crate::error::CoreResult;
use crate::jobs::job::Job;

pub struct TagRulesSyncProcessor {
    ctx: Arc<ProcessorContext>,
}

impl TagRulesSyncProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for TagRulesSyncProcessor {
    async fn process(&self, job: &Job) -> CoreResult<()> {
        let registration = self.ctx.registration(&job.repo_name).await?;

        let mut conn = self.ctx.pool.acquire().await?;
        let applied = with_schema(&mut conn, &registration.schema_name, |conn| {
            Box::pin(async move {
                let rules = sqlx::query("SELECT id, pattern, tag FROM tag_rule WHERE enabled")
                    .fetch_all(&mut *conn)
                    .await?;

                let mut applied = 0u64;
                for rule in &rules {
                    let _rule_id: Uuid = rule.get("id");
                    let pattern: String = rule.get("pattern");
                    let tag: String = rule.get("tag");
                    let result = sqlx::query(
                        "INSERT INTO tag (file_id, tag, source) \
                         SELECT f.id, $1, 'rule' FROM file f \
                         WHERE position($2 in f.path) > 0 \
                         ON CONFLICT (file_id, tag) DO NOTHING",
                    )
                    .bind(&tag)
                    .bind(&pattern)
                    .execute(&mut *conn)
                    .await?;
                    applied += result.rows_affected();
                }

                // Drop rule-sourced tags whose rule no longer matches.
                sqlx::query(
                    "DELETE FROM tag t USING file f \
                     WHERE t.file_id = f.id AND t.source = 'rule' \
                       AND NOT EXISTS ( \
                           SELECT 1 FROM tag_rule r \
                           WHERE r.enabled AND r.tag = t.tag \
                             AND position(r.pattern in f.path) > 0)",
                )
                .execute(&mut *conn)
                .await?;

                Ok(applied)
            })
        })
        .await?;

        info!(repo = %job.repo_name, applied, "tag rules synced");
        Ok(())
    }
}
