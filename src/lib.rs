pub mod job;
pub mod cycle_check;
pub mod graph;
pub mod queue;
pub mod retry;
pub mod breaker;
pub mod lock;
pub mod store;
pub mod coordinator;
pub mod resolver;
pub mod scheduler;
pub mod report;
pub mod config;
pub mod logging;

pub use job::{Job, JobContext, JobHandler, JobStatus};
pub use cycle_check::{find_cycle, has_cycle};
pub use graph::DependencyGraph;
pub use queue::SchedulingQueue;
pub use retry::RetryPolicy;
pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use lock::{Lease, LockCoordinator, LockService, MemoryLockService, RedisLockService};
pub use store::{JobStore, MemoryJobStore};
pub use coordinator::{ExecutionCoordinator, RunOutcome};
pub use resolver::Resolver;
pub use scheduler::Scheduler;
pub use report::{print_report, render_report};
pub use config::SchedulerConfig;

use std::sync::Arc;
use thiserror::Error;

pub type JobId = String;
pub type FencingToken = u64;
pub type BoxHandler = Arc<dyn JobHandler>;
pub type BoxStore = Arc<dyn JobStore>;
pub type BoxLockService = Arc<dyn LockService>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobcuterError {
    #[error("Unsatisfiable dependency: job {job} depends on unknown job {dependency}")]
    UnsatisfiableDependency { job: JobId, dependency: JobId },
    #[error("Circular dependency detected while admitting job {0}")]
    CycleDetected(JobId),
    #[error("Job already admitted: {0}")]
    DuplicateJob(JobId),
    #[error("Lock unavailable for job {0}")]
    LockUnavailable(JobId),
    #[error("Coordination service error: {0}")]
    Coordination(String),
    #[error("Circuit breaker is open")]
    CircuitOpen,
    #[error("Job execution failed: {0}")]
    ExecutionFailure(String),
    #[error("Job execution timed out after {0:?}")]
    ExecutionTimeout(std::time::Duration),
    #[error("Job {id} failed after {attempts} attempts")]
    RetriesExhausted { id: JobId, attempts: u32 },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Stale fencing token {token} for job {id}, latest is {latest}")]
    StaleFencingToken {
        id: JobId,
        token: FencingToken,
        latest: FencingToken,
    },
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobcuterError {
    /// Errors that leave the job schedulable without consuming a retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobcuterError::LockUnavailable(_)
                | JobcuterError::Coordination(_)
                | JobcuterError::CircuitOpen
                | JobcuterError::ContextCancelled(_)
        )
    }
}
