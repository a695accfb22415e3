//! Daemon runtime: supervisor, worker pool, watcher, health monitor, and
//! the periodic schedulers.

pub mod health;
pub mod periodic;
pub mod supervisor;
pub mod watcher;
pub mod workers;

pub use supervisor::Daemon;
pub use watcher::RepoWatcher;
pub use workers::WorkerPool;
