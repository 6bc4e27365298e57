use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::{
    BoxHandler, BoxLockService, BoxStore, DependencyGraph, ExecutionCoordinator, Job, JobId,
    JobStatus, JobcuterError, LockCoordinator, RedisLockService, Resolver, SchedulingQueue,
    render_report,
};

const SETTLE_POLL: Duration = Duration::from_millis(20);

/// Single scheduling authority: admits jobs, runs the resolver and fans
/// ready jobs out to a bounded pool of execution tasks.
pub struct Scheduler {
    graph: Mutex<DependencyGraph>,
    queue: Arc<SchedulingQueue>,
    store: BoxStore,
    coordinator: Arc<ExecutionCoordinator>,
    resolver: Arc<Resolver>,
    wake: Arc<Notify>,
    max_workers: usize,
}

impl Scheduler {
    pub fn new(
        handler: BoxHandler,
        store: BoxStore,
        lock_service: BoxLockService,
        config: &SchedulerConfig,
    ) -> Self {
        let queue = Arc::new(SchedulingQueue::new());
        let wake = Arc::new(Notify::new());

        let locks = LockCoordinator::with_prefix(
            lock_service,
            config.lease_ttl(),
            config.lock.key_prefix.clone(),
        );
        let coordinator = ExecutionCoordinator::new(handler, store.clone(), locks, queue.clone())
            .with_breaker(config.breaker_settings())
            .with_retry_policy(config.retry_policy())
            .with_execution_timeout(config.execution_timeout())
            .with_wake(wake.clone());
        let resolver = Resolver::new(queue.clone(), store.clone())
            .with_scan_interval(config.scan_interval())
            .with_wake(wake.clone());

        Self {
            graph: Mutex::new(DependencyGraph::new()),
            queue,
            store,
            coordinator: Arc::new(coordinator),
            resolver: Arc::new(resolver),
            wake,
            max_workers: config.executor.max_workers.max(1),
        }
    }

    /// Builds a scheduler whose leases live in the Redis instance named by
    /// `config.lock.redis_url`.
    pub async fn connect(
        handler: BoxHandler,
        store: BoxStore,
        config: &SchedulerConfig,
    ) -> Result<Self, JobcuterError> {
        config.validate()?;
        let locks = RedisLockService::new(
            &config.lock.redis_url,
            config.lock.pool_size,
            Duration::from_millis(config.lock.connection_timeout_ms),
        )
        .await?;
        Ok(Self::new(handler, store, Arc::new(locks), config))
    }

    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    pub fn store(&self) -> &BoxStore {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub async fn render_graph(&self) -> String {
        self.graph.lock().await.render()
    }

    /// Admits one job. Its dependencies must have been admitted before.
    pub async fn submit(&self, job: Job) -> Result<(), JobcuterError> {
        self.submit_all(vec![job]).await
    }

    /// Admits a batch atomically; dependencies may also point inside the
    /// batch. Nothing is queued if any job is rejected.
    pub async fn submit_all(&self, jobs: Vec<Job>) -> Result<(), JobcuterError> {
        let jobs: Vec<Job> = jobs
            .into_iter()
            .map(|mut job| {
                job.status = JobStatus::Pending;
                job.retry_count = job.retry_count.min(job.max_retries);
                job
            })
            .collect();

        if let Err(e) = self.graph.lock().await.admit_all(&jobs) {
            tracing::warn!(error = %e, "Job admission rejected");
            return Err(e);
        }

        for job in &jobs {
            if let Err(e) = self.store.upsert(job, None).await {
                tracing::error!(job_id = %job.id, error = %e, "Failed to persist submitted job");
            }
        }
        for job in jobs {
            tracing::info!(
                job_id = %job.id,
                priority = job.priority,
                dependencies = job.dependencies.len(),
                "Job admitted"
            );
            self.queue.enqueue(job).await;
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Admitted jobs that can never run because a prerequisite failed.
    pub async fn blocked_jobs(&self) -> Vec<JobId> {
        let statuses = match self.statuses().await {
            Some(statuses) => statuses,
            None => return Vec::new(),
        };
        let mut blocked: Vec<JobId> = self.blocked(&statuses).await.into_iter().collect();
        blocked.sort();
        blocked
    }

    /// True once every admitted job is terminal or blocked by a failure.
    pub async fn is_settled(&self) -> bool {
        let statuses = match self.statuses().await {
            Some(statuses) => statuses,
            None => return false,
        };
        let blocked = self.blocked(&statuses).await;
        let graph = self.graph.lock().await;
        graph.job_ids().all(|id| {
            blocked.contains(id) || statuses.get(id).is_some_and(|status| status.is_terminal())
        })
    }

    async fn statuses(&self) -> Option<HashMap<JobId, JobStatus>> {
        match self.store.list_all().await {
            Ok(jobs) => Some(jobs.into_iter().map(|job| (job.id, job.status)).collect()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list jobs");
                None
            }
        }
    }

    async fn blocked(&self, statuses: &HashMap<JobId, JobStatus>) -> HashSet<JobId> {
        let failed: HashSet<JobId> = statuses
            .iter()
            .filter(|(_, status)| **status == JobStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        self.graph.lock().await.blocked_by(&failed)
    }

    /// Runs the resolver and the dispatch loop until `ctx` is cancelled, then
    /// waits for in-flight executions to wind down. Jobs not yet started go
    /// back on the queue.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), JobcuterError> {
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<Job>(self.max_workers);
        let workers = Arc::new(Semaphore::new(self.max_workers));

        let resolver = self.resolver.clone();
        let resolver_ctx = ctx.clone();
        let resolver_handle = tokio::spawn(async move { resolver.run(dispatch_tx, resolver_ctx).await });

        tracing::info!(max_workers = self.max_workers, "Scheduler started");
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                permit = workers.clone().acquire_owned() => permit.map_err(|_| {
                    JobcuterError::ContextCancelled("Worker pool closed".to_string())
                })?,
            };

            let job = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                job = dispatch_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            handles.retain(|handle| !handle.is_finished());
            handles.push(self.spawn_run(job, permit, ctx.clone()));
        }

        dispatch_rx.close();
        if let Err(e) = resolver_handle.await {
            tracing::error!(error = %e, "Resolver task failed");
        }
        while let Ok(job) = dispatch_rx.try_recv() {
            self.queue.enqueue(job).await;
        }

        try_join_all(handles).await.map_err(|e| {
            JobcuterError::ExecutionFailure(format!("Join error: {}", e))
        })?;

        tracing::info!(queued = self.queue.len().await, "Scheduler stopped");
        Ok(())
    }

    /// Runs until every admitted job is settled (see [`is_settled`]) or `ctx`
    /// is cancelled, and returns the persisted jobs.
    ///
    /// [`is_settled`]: Self::is_settled
    pub async fn run_until_settled(&self, ctx: CancellationToken) -> Result<Vec<Job>, JobcuterError> {
        let run_ctx = ctx.child_token();

        let watcher = async {
            loop {
                if self.is_settled().await {
                    run_ctx.cancel();
                    break;
                }
                tokio::select! {
                    _ = run_ctx.cancelled() => break,
                    _ = tokio::time::sleep(SETTLE_POLL) => {}
                }
            }
        };

        let (result, ()) = tokio::join!(self.run(run_ctx.clone()), watcher);
        result?;
        self.store.list_all().await
    }

    pub async fn report(&self) -> String {
        render_report(self.store.as_ref()).await
    }

    fn spawn_run(
        &self,
        job: Job,
        permit: OwnedSemaphorePermit,
        ctx: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let job_id = job.id.clone();

            match coordinator.run(job, &ctx).await {
                Ok(outcome) => tracing::debug!(job_id = %job_id, outcome = ?outcome, "Attempt finished"),
                Err(e) if e.is_transient() => {
                    tracing::info!(job_id = %job_id, error = %e, "Attempt deferred")
                }
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "Attempt failed"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResolverConfig, RetryConfig};
    use crate::{JobContext, JobHandler, JobStore, MemoryJobStore, MemoryLockService};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records execution order; jobs named in `failing` always fail.
    #[derive(Default)]
    struct Recorder {
        order: StdMutex<Vec<JobId>>,
        failing: HashSet<JobId>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn execute(&self, job: &Job, _ctx: JobContext) -> Result<(), JobcuterError> {
            self.order.lock().unwrap().push(job.id.clone());
            if self.failing.contains(&job.id) {
                return Err(JobcuterError::ExecutionFailure(job.payload.clone()));
            }
            Ok(())
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            resolver: ResolverConfig {
                scan_interval_ms: 50,
            },
            retry: RetryConfig {
                interval_ms: 10,
                max_interval_ms: 40,
                multiplier: 2.0,
            },
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(handler: Arc<Recorder>) -> (Scheduler, Arc<MemoryJobStore>) {
        let store = MemoryJobStore::shared();
        let scheduler = Scheduler::new(
            handler,
            store.clone(),
            MemoryLockService::shared(),
            &fast_config(),
        );
        (scheduler, store)
    }

    #[tokio::test]
    async fn submit_persists_pending_and_queues() {
        let (scheduler, store) = scheduler(Arc::new(Recorder::default()));
        let mut job = Job::new("a", "payload");
        job.status = JobStatus::Failed;
        scheduler.submit(job).await.unwrap();

        assert_eq!(store.get_status("a").await.unwrap(), Some(JobStatus::Pending));
        assert!(scheduler.queue().contains("a").await);
        assert!(scheduler.resolver().is_ready(&Job::new("a", "")).await);
    }

    #[tokio::test]
    async fn rejected_batch_queues_nothing() {
        let (scheduler, store) = scheduler(Arc::new(Recorder::default()));
        let err = scheduler
            .submit_all(vec![
                Job::new("a", "").depends_on("b"),
                Job::new("b", "").depends_on("a"),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, JobcuterError::CycleDetected(_)));
        assert!(scheduler.queue().is_empty().await);
        assert!(store.list_all().await.unwrap().is_empty());
        assert_eq!(scheduler.render_graph().await, "");
    }

    #[tokio::test(start_paused = true)]
    async fn dependents_run_after_their_prerequisites() {
        let handler = Arc::new(Recorder::default());
        let (scheduler, _store) = scheduler(handler.clone());
        scheduler
            .submit_all(vec![
                Job::new("c", "").depends_on("b").with_priority(100),
                Job::new("b", "").depends_on("a").with_priority(50),
                Job::new("a", ""),
            ])
            .await
            .unwrap();

        let jobs = scheduler.run_until_settled(CancellationToken::new()).await.unwrap();
        assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));
        assert_eq!(*handler.order.lock().unwrap(), ["a", "b", "c"]);
        assert!(scheduler.queue().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_prerequisite_blocks_dependents() {
        let handler = Arc::new(Recorder {
            failing: ["a".to_string()].into(),
            ..Recorder::default()
        });
        let (scheduler, store) = scheduler(handler.clone());
        scheduler
            .submit_all(vec![
                Job::new("a", "always fails"),
                Job::new("b", "").depends_on("a"),
                Job::new("other", ""),
            ])
            .await
            .unwrap();

        scheduler.run_until_settled(CancellationToken::new()).await.unwrap();

        assert_eq!(store.get_status("a").await.unwrap(), Some(JobStatus::Failed));
        assert_eq!(store.get_status("b").await.unwrap(), Some(JobStatus::Pending));
        assert_eq!(store.get_status("other").await.unwrap(), Some(JobStatus::Completed));
        assert_eq!(scheduler.blocked_jobs().await, ["b"]);
        assert!(scheduler.queue().contains("b").await);
        assert!(!handler.order.lock().unwrap().contains(&"b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_returns_queued_work() {
        let (scheduler, _store) = scheduler(Arc::new(Recorder::default()));
        scheduler
            .submit_all(vec![Job::new("a", ""), Job::new("b", "").depends_on("a")])
            .await
            .unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        scheduler.run(ctx).await.unwrap();
        assert_eq!(scheduler.queue().len().await, 2);
    }
}
