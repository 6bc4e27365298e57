use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{FencingToken, Job, JobId, JobStatus, JobcuterError};

/// What the scheduler needs from the persistence service.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Job>, JobcuterError>;

    async fn get_status(&self, id: &str) -> Result<Option<JobStatus>, JobcuterError> {
        Ok(self.get(id).await?.map(|job| job.status))
    }

    /// Idempotent, last-write-wins insert or update. A write carrying a
    /// fencing token older than one already seen for the job is rejected with
    /// `StaleFencingToken`.
    async fn upsert(&self, job: &Job, fence: Option<FencingToken>) -> Result<(), JobcuterError>;

    /// Every stored job, highest priority first.
    async fn list_all(&self) -> Result<Vec<Job>, JobcuterError>;
}

#[derive(Debug)]
struct Record {
    job: Job,
    fence: FencingToken,
    inserted: u64,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<JobId, Record>,
    next_insert: u64,
    history: Vec<Job>,
}

/// In-memory store. Keeps a log of every accepted write.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Accepted writes in the order they were applied.
    pub fn history(&self) -> Vec<Job> {
        self.lock().history.clone()
    }

    /// Accepted writes for one job.
    pub fn history_of(&self, id: &str) -> Vec<Job> {
        self.lock()
            .history
            .iter()
            .filter(|job| job.id == id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: &str) -> Result<Option<Job>, JobcuterError> {
        Ok(self.lock().records.get(id).map(|record| record.job.clone()))
    }

    async fn upsert(&self, job: &Job, fence: Option<FencingToken>) -> Result<(), JobcuterError> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        match inner.records.get_mut(&job.id) {
            Some(record) => {
                if let Some(token) = fence {
                    if token < record.fence {
                        return Err(JobcuterError::StaleFencingToken {
                            id: job.id.clone(),
                            token,
                            latest: record.fence,
                        });
                    }
                    record.fence = token;
                }
                record.job = job.clone();
            }
            None => {
                let inserted = inner.next_insert;
                inner.next_insert += 1;
                inner.records.insert(
                    job.id.clone(),
                    Record {
                        job: job.clone(),
                        fence: fence.unwrap_or(0),
                        inserted,
                    },
                );
            }
        }

        inner.history.push(job.clone());
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Job>, JobcuterError> {
        let inner = self.lock();
        let mut records: Vec<&Record> = inner.records.values().collect();
        records.sort_by(|a, b| {
            b.job
                .priority
                .cmp(&a.job.priority)
                .then_with(|| a.inserted.cmp(&b.inserted))
        });
        Ok(records.into_iter().map(|record| record.job.clone()).collect())
    }
}
