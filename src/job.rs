use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{FencingToken, JobId, JobcuterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of work. The payload is never interpreted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: String,
    pub dependencies: BTreeSet<JobId>,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: JobStatus,
}

impl Job {
    pub fn new(id: impl Into<JobId>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            dependencies: BTreeSet::new(),
            priority: 0,
            retry_count: 0,
            max_retries: 0,
            status: JobStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<JobId>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Per-attempt information handed to the job body.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub attempt: u32,
    pub fencing_token: FencingToken,
    pub cancel: CancellationToken,
}

/// The application logic run for every job. Only success or failure matters
/// to the scheduler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job, ctx: JobContext) -> Result<(), JobcuterError>;
}
