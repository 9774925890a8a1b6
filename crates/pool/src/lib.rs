//! Agent worker pool for Tandem.
//!
//! An [`AgentPool`] runs [`AgentTask`]s on a fixed set of workers. Each
//! worker has a concurrency ceiling and runs every task on its own
//! [`RunOrchestrator`](tandem_agent::RunOrchestrator), created through an
//! [`OrchestratorFactory`]. Tasks are queued by priority, handed to workers
//! according to the configured balancing strategy and always resolve to a
//! [`TaskResult`], whether they succeed, fail, time out or are cancelled.
//!
//! ```rust,ignore
//! let pool = AgentPool::new(&config.pool, factory);
//! pool.initialize();
//!
//! let results = pool
//!     .submit_all(vec![
//!         AgentTask::new("review src/lib.rs"),
//!         AgentTask::new("write tests for the parser").with_tags(["rust"]),
//!     ])
//!     .await;
//! ```

pub mod pool;
mod strategy;
pub mod task;
pub mod worker;

pub use pool::{AgentPool, PoolStats};
pub use task::{AgentTask, TaskError, TaskResult};
pub use worker::{OrchestratorFactory, WorkerInfo, WorkerStatus};
