use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{BoxStore, Job, JobId, JobStatus, SchedulingQueue};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Promotes queued jobs whose dependencies have all completed.
pub struct Resolver {
    queue: Arc<SchedulingQueue>,
    store: BoxStore,
    scan_interval: Duration,
    wake: Arc<Notify>,
}

impl Resolver {
    pub fn new(queue: Arc<SchedulingQueue>, store: BoxStore) -> Self {
        Self {
            queue,
            store,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Fallback polling period between scans when nothing wakes the resolver.
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn wake(&self) -> &Arc<Notify> {
        &self.wake
    }

    /// True iff every dependency is persisted as `completed`. A failed
    /// lookup or a missing record counts as not ready.
    pub async fn is_ready(&self, job: &Job) -> bool {
        let mut cache = HashMap::new();
        self.is_ready_cached(job, &mut cache).await
    }

    async fn is_ready_cached(&self, job: &Job, cache: &mut HashMap<JobId, bool>) -> bool {
        for dep in &job.dependencies {
            let completed = match cache.get(dep) {
                Some(&completed) => completed,
                None => {
                    let completed = match self.store.get_status(dep).await {
                        Ok(status) => status == Some(JobStatus::Completed),
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, dependency = %dep, error = %e, "Dependency lookup failed");
                            false
                        }
                    };
                    cache.insert(dep.clone(), completed);
                    completed
                }
            };
            if !completed {
                return false;
            }
        }
        true
    }

    /// One readiness pass. The queue is only locked to copy its entries and
    /// to remove the ready ones, never while the store is consulted.
    pub async fn scan(&self) -> Vec<Job> {
        let pending = self.queue.snapshot().await;
        if pending.is_empty() {
            return Vec::new();
        }

        let mut cache = HashMap::new();
        let mut ready = HashSet::new();
        for job in &pending {
            if self.is_ready_cached(job, &mut cache).await {
                ready.insert(job.id.clone());
            }
        }

        let taken = self.queue.take_ready(&ready).await;
        if !taken.is_empty() {
            tracing::debug!(ready = taken.len(), pending = pending.len(), "Resolver pass");
        }
        taken
    }

    /// Scans until `ctx` is cancelled, sending ready jobs to `dispatch`.
    /// Wakes on the notify handle or after the scan interval, whichever
    /// comes first. Jobs that cannot be handed off go back on the queue.
    pub async fn run(&self, dispatch: mpsc::Sender<Job>, ctx: CancellationToken) {
        tracing::info!(scan_interval = ?self.scan_interval, "Resolver started");

        'scan: loop {
            if ctx.is_cancelled() {
                break;
            }
            let mut ready = self.scan().await.into_iter();
            while let Some(job) = ready.next() {
                let permit = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => None,
                    permit = dispatch.reserve() => permit.ok(),
                };
                match permit {
                    Some(permit) => {
                        tracing::debug!(job_id = %job.id, "Dispatching ready job");
                        permit.send(job);
                    }
                    None => {
                        self.queue.enqueue(job).await;
                        for job in ready {
                            self.queue.enqueue(job).await;
                        }
                        break 'scan;
                    }
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep(self.scan_interval) => {}
            }
        }

        tracing::info!("Resolver stopped");
    }
}
