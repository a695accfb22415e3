// CodeGraph daemon core
//
// A multi-tenant, schema-isolated, durable, dependency-aware job scheduler
// on top of PostgreSQL (pgvector + full-text search). Keeps registered
// source repositories continuously indexed, embedded, and summarized, and
// exposes the queue/registry surface the CLI and admin callers consume.

pub mod cli;
pub mod clients;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod jobs;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
