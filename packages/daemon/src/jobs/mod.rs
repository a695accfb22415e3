//! Durable job system: the queue, the row model, the follow-up dependency
//! map, and the processors.

pub mod dependencies;
pub mod job;
pub mod processors;
pub mod queue;

pub use job::{FileOp, Job, JobPayload, JobStatus, JobType, PathOp};
pub use queue::{EnqueueResult, JobQueue, QueueStats};
