use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerSettings, CircuitBreaker};
use crate::{
    BoxHandler, BoxStore, FencingToken, Job, JobContext, JobStatus, JobcuterError, Lease,
    LockCoordinator, RetryPolicy, SchedulingQueue,
};

/// How an attempt that held the lease ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The body failed and the job went back on the queue.
    Retrying { retry_count: u32, backoff: Duration },
    /// The store already had a terminal status; the body was not run.
    AlreadyFinished(JobStatus),
}

/// Result of the leased part of a run, plus the job to put back on the queue
/// once the lease is released.
struct Attempt {
    result: Result<RunOutcome, JobcuterError>,
    requeue: Option<Job>,
}

impl Attempt {
    fn done(result: Result<RunOutcome, JobcuterError>) -> Self {
        Self {
            result,
            requeue: None,
        }
    }

    fn requeue(result: Result<RunOutcome, JobcuterError>, job: Job) -> Self {
        Self {
            result,
            requeue: Some(job),
        }
    }
}

/// Runs dispatched jobs: lease, breaker, body, retry policy, persistence.
pub struct ExecutionCoordinator {
    locks: LockCoordinator,
    breaker: CircuitBreaker,
    store: BoxStore,
    queue: Arc<SchedulingQueue>,
    handler: BoxHandler,
    retry_policy: RetryPolicy,
    execution_timeout: Option<Duration>,
    wake: Arc<Notify>,
}

impl ExecutionCoordinator {
    pub fn new(
        handler: BoxHandler,
        store: BoxStore,
        locks: LockCoordinator,
        queue: Arc<SchedulingQueue>,
    ) -> Self {
        Self {
            locks,
            breaker: CircuitBreaker::new("JobCircuitBreaker", BreakerSettings::default()),
            store,
            queue,
            handler,
            retry_policy: RetryPolicy::default(),
            execution_timeout: None,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_breaker(mut self, settings: BreakerSettings) -> Self {
        self.breaker = CircuitBreaker::new(self.breaker.name().to_string(), settings);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy.normalized();
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Signalled after every persisted `completed` status and whenever a
    /// retried job is back on the queue.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    /// Executes one dispatched attempt of `job`, which the caller hands over.
    ///
    /// Transient rejections (`LockUnavailable`, `Coordination`, `CircuitOpen`,
    /// and `ctx` firing mid-body) put the job back on the queue with its retry
    /// count untouched. Any other body error, including a `ContextCancelled`
    /// the body returns while `ctx` is live, is a failure: with retries left it
    /// is persisted, backed off and re-enqueued; with none left `failed` is
    /// persisted and `RetriesExhausted` returned. The lease is released on
    /// every path, before any re-enqueue.
    #[tracing::instrument(
        name = "run_job",
        skip_all,
        fields(job_id = %job.id, priority = job.priority, retry_count = job.retry_count)
    )]
    pub async fn run(&self, job: Job, ctx: &CancellationToken) -> Result<RunOutcome, JobcuterError> {
        let lease = match self.locks.acquire(&job.id).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::info!(error = %e, "Lease not acquired, job stays queued");
                self.queue.enqueue(job).await;
                return Err(e);
            }
        };

        let attempt = self.run_leased(job, &lease, ctx).await;
        self.locks.release(lease).await;

        // Back on the queue only once the lease is free, so the next
        // dispatch cannot collide with this attempt.
        if let Some(job) = attempt.requeue {
            self.queue.enqueue(job).await;
            if matches!(attempt.result, Ok(RunOutcome::Retrying { .. })) {
                self.wake.notify_one();
            }
        }
        attempt.result
    }

    async fn run_leased(
        &self,
        mut job: Job,
        lease: &Lease,
        ctx: &CancellationToken,
    ) -> Attempt {
        match self.store.get_status(&job.id).await {
            Ok(Some(status)) if status.is_terminal() => {
                tracing::info!(status = %status, "Job already finished, skipping duplicate dispatch");
                return Attempt::done(Ok(RunOutcome::AlreadyFinished(status)));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not read job status before execution"),
        }

        let permit = match self.breaker.allow() {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!("Circuit breaker open, deferring job");
                return Attempt::requeue(Err(e), job);
            }
        };

        job.status = JobStatus::Running;
        if let Err(e) = self.persist(&job, lease.token).await {
            self.breaker.forget(permit);
            return Attempt::done(Err(e));
        }

        tracing::info!(fencing_token = lease.token, "Executing job");
        let outcome = self.invoke(&job, lease.token, ctx).await;

        match outcome {
            Ok(()) => {
                self.breaker.record(permit, true);
                job.status = JobStatus::Completed;
                if let Err(e) = self.persist(&job, lease.token).await {
                    return Attempt::done(Err(e));
                }
                self.wake.notify_one();
                tracing::info!("Job completed successfully");
                Attempt::done(Ok(RunOutcome::Completed))
            }
            // Only a shutdown of the scheduler itself is transient. A body
            // that reports cancellation on its own has failed.
            Err(e) if ctx.is_cancelled() => {
                self.breaker.forget(permit);
                tracing::info!(error = %e, "Attempt interrupted by shutdown");
                job.status = JobStatus::Pending;
                if let Err(e) = self.persist(&job, lease.token).await {
                    return Attempt::done(Err(e));
                }
                Attempt::requeue(
                    Err(JobcuterError::ContextCancelled(format!("job {} interrupted", job.id))),
                    job,
                )
            }
            Err(e) => {
                self.breaker.record(permit, false);
                self.handle_failure(job, lease.token, e, ctx).await
            }
        }
    }

    async fn invoke(
        &self,
        job: &Job,
        token: FencingToken,
        ctx: &CancellationToken,
    ) -> Result<(), JobcuterError> {
        let job_ctx = JobContext {
            attempt: job.retry_count + 1,
            fencing_token: token,
            cancel: ctx.child_token(),
        };
        let body = AssertUnwindSafe(self.handler.execute(job, job_ctx)).catch_unwind();

        let caught = match self.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(caught) => caught,
                Err(_) => return Err(JobcuterError::ExecutionTimeout(limit)),
            },
            None => body.await,
        };

        caught.unwrap_or_else(|panic| Err(JobcuterError::ExecutionFailure(panic_message(panic))))
    }

    async fn handle_failure(
        &self,
        mut job: Job,
        token: FencingToken,
        error: JobcuterError,
        ctx: &CancellationToken,
    ) -> Attempt {
        if !job.has_retries_left() {
            job.status = JobStatus::Failed;
            tracing::error!(
                error = %error,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                "Job failed after max retries"
            );
            if let Err(e) = self.persist(&job, token).await {
                return Attempt::done(Err(e));
            }
            return Attempt::done(Err(JobcuterError::RetriesExhausted {
                attempts: job.retry_count + 1,
                id: job.id,
            }));
        }

        job.retry_count += 1;
        job.status = JobStatus::Pending;
        if let Err(e) = self.persist(&job, token).await {
            return Attempt::done(Err(e));
        }

        let backoff = self.retry_policy.backoff(job.retry_count);
        tracing::warn!(
            error = %error,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            backoff = ?backoff,
            "Job failed, retrying"
        );
        if let Err(e) = self.retry_policy.wait(ctx, job.retry_count).await {
            tracing::debug!(error = %e, "Backoff interrupted, re-enqueueing now");
        }

        let retry_count = job.retry_count;
        Attempt::requeue(
            Ok(RunOutcome::Retrying {
                retry_count,
                backoff,
            }),
            job,
        )
    }

    /// Persistence failures are logged and tolerated, except a stale fencing
    /// token: a newer lease owns the job and this attempt must stop writing.
    async fn persist(&self, job: &Job, token: FencingToken) -> Result<(), JobcuterError> {
        match self.store.upsert(job, Some(token)).await {
            Ok(()) => Ok(()),
            Err(e @ JobcuterError::StaleFencingToken { .. }) => {
                tracing::warn!(error = %e, "Attempt superseded by a newer lease");
                Err(e)
            }
            Err(e) => {
                tracing::error!(error = %e, status = %job.status, "Error updating job status");
                Ok(())
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("job body panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("job body panicked: {}", message)
    } else {
        "job body panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobHandler, JobStore, MemoryJobStore, MemoryLockService};
    use crate::breaker::BreakerState;
    use crate::lock::DEFAULT_LEASE_TTL;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted outcomes; succeeds once the script runs out.
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<VecDeque<bool>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn execute(&self, job: &Job, _ctx: JobContext) -> Result<(), JobcuterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(JobcuterError::ExecutionFailure(format!("{} failed", job.id)))
            }
        }
    }

    struct Harness {
        store: Arc<MemoryJobStore>,
        queue: Arc<SchedulingQueue>,
        coordinator: ExecutionCoordinator,
    }

    fn harness(handler: BoxHandler) -> Harness {
        let store = MemoryJobStore::shared();
        let queue = Arc::new(SchedulingQueue::new());
        let locks = LockCoordinator::new(MemoryLockService::shared(), DEFAULT_LEASE_TTL);
        let coordinator = ExecutionCoordinator::new(handler, store.clone(), locks, queue.clone())
            .with_retry_policy(RetryPolicy {
                interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(40),
                multiplier: 2.0,
            })
            .with_breaker(BreakerSettings {
                rolling_interval: Duration::ZERO,
                ..BreakerSettings::default()
            });
        Harness {
            store,
            queue,
            coordinator,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_persists_completed() {
        let h = harness(Scripted::new(&[]));
        let job = Job::new("a", "").with_max_retries(3);
        h.store.upsert(&job, None).await.unwrap();

        let outcome = h.coordinator.run(job, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.store.get_status("a").await.unwrap(), Some(JobStatus::Completed));
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_with_retries_left_is_requeued_with_incremented_count() {
        let h = harness(Scripted::new(&[false]));
        let job = Job::new("a", "").with_priority(4).with_max_retries(2);

        let outcome = h.coordinator.run(job, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Retrying {
                retry_count: 1,
                backoff: Duration::from_millis(10)
            }
        );
        let requeued = h.queue.dequeue().await.unwrap();
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.priority, 4);
        assert_eq!(requeued.status, JobStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_retries_left_is_terminal() {
        let h = harness(Scripted::new(&[false]));
        let job = Job::new("c", "").with_max_retries(0);

        let err = h.coordinator.run(job, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err,
            JobcuterError::RetriesExhausted {
                id: "c".into(),
                attempts: 1
            }
        );
        let stored = h.store.get("c").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_defers_without_consuming_retries() {
        let handler = Scripted::new(&[false, false, false, false]);
        let h = harness(handler.clone());
        for i in 0..4 {
            let job = Job::new(format!("j{i}"), "").with_max_retries(0);
            let _ = h.coordinator.run(job, &CancellationToken::new()).await;
        }
        assert_eq!(h.coordinator.breaker().state(), BreakerState::Open);

        let job = Job::new("victim", "").with_max_retries(1);
        let err = h.coordinator.run(job, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, JobcuterError::CircuitOpen);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

        let deferred = h.queue.dequeue().await.unwrap();
        assert_eq!(deferred.id, "victim");
        assert_eq!(deferred.retry_count, 0);
        assert_eq!(h.store.get("victim").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_job_in_store_is_not_rerun() {
        let handler = Scripted::new(&[]);
        let h = harness(handler.clone());
        let mut job = Job::new("a", "");
        job.status = JobStatus::Completed;
        h.store.upsert(&job, None).await.unwrap();

        let outcome = h
            .coordinator
            .run(Job::new("a", ""), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::AlreadyFinished(JobStatus::Completed));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn execute(&self, _job: &Job, _ctx: JobContext) -> Result<(), JobcuterError> {
            panic!("boom");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_body_counts_as_failure_and_releases_lease() {
        let h = harness(Arc::new(Panics));
        let err = h
            .coordinator
            .run(Job::new("p", ""), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobcuterError::RetriesExhausted { .. }));
        assert_eq!(h.coordinator.breaker().counts().failures, 1);

        let lease = h.coordinator.locks.acquire("p").await;
        assert!(lease.is_ok());
    }

    struct Sleeps;

    #[async_trait]
    impl JobHandler for Sleeps {
        async fn execute(&self, _job: &Job, _ctx: JobContext) -> Result<(), JobcuterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_body_times_out() {
        let mut h = harness(Arc::new(Sleeps));
        h.coordinator = h.coordinator.with_execution_timeout(Some(Duration::from_secs(5)));
        let err = h
            .coordinator
            .run(Job::new("slow", "").with_max_retries(0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobcuterError::RetriesExhausted { .. }));
        assert_eq!(h.store.get_status("slow").await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_attempt_stops_writing() {
        let handler = Scripted::new(&[]);
        let h = harness(handler.clone());
        let job = Job::new("a", "");
        // A later lease already wrote with a higher token.
        h.store.upsert(&job, Some(100)).await.unwrap();

        let err = h.coordinator.run(job, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobcuterError::StaleFencingToken { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get_status("a").await.unwrap(), Some(JobStatus::Pending));
    }

    /// Reports cancellation of its own accord, e.g. an aborted upstream call.
    #[derive(Default)]
    struct ReportsCancelled {
        calls: AtomicU32,
        shutdown: Option<CancellationToken>,
    }

    #[async_trait]
    impl JobHandler for ReportsCancelled {
        async fn execute(&self, job: &Job, _ctx: JobContext) -> Result<(), JobcuterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(shutdown) = &self.shutdown {
                shutdown.cancel();
            }
            Err(JobcuterError::ContextCancelled(format!("{} upstream request aborted", job.id)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn body_reported_cancellation_counts_as_failure() {
        let handler = Arc::new(ReportsCancelled::default());
        let h = harness(handler.clone());
        let ctx = CancellationToken::new();
        h.queue.enqueue(Job::new("c", "").with_max_retries(0)).await;

        for _ in 0..10 {
            match h.queue.dequeue().await {
                Some(job) => {
                    let _ = h.coordinator.run(job, &ctx).await;
                }
                None => break,
            }
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let stored = h.store.get("c").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(h.coordinator.breaker().counts().failures, 1);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn body_reported_cancellation_consumes_retries() {
        let handler = Arc::new(ReportsCancelled::default());
        let h = harness(handler.clone());
        let ctx = CancellationToken::new();
        h.queue.enqueue(Job::new("c", "").with_max_retries(2)).await;

        while let Some(job) = h.queue.dequeue().await {
            let _ = h.coordinator.run(job, &ctx).await;
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let stored = h.store.get("c").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_body_requeues_without_consuming_retries() {
        let ctx = CancellationToken::new();
        let handler = Arc::new(ReportsCancelled {
            shutdown: Some(ctx.clone()),
            ..ReportsCancelled::default()
        });
        let h = harness(handler.clone());

        let err = h
            .coordinator
            .run(Job::new("s", "").with_max_retries(0), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, JobcuterError::ContextCancelled(_)));
        assert_eq!(h.coordinator.breaker().counts().failures, 0);

        let requeued = h.queue.dequeue().await.unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(h.store.get_status("s").await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn retried_job_is_requeued_after_lease_release() {
        let wake = Arc::new(Notify::new());
        let h = harness(Scripted::new(&[false]));
        let coordinator = Arc::new(h.coordinator.with_wake(wake.clone()));

        let handle = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .run(Job::new("a", "").with_max_retries(1), &CancellationToken::new())
                    .await
            }
        });

        tokio::time::timeout(Duration::from_secs(5), wake.notified())
            .await
            .expect("retry re-enqueue should wake the resolver");
        let requeued = h.queue.dequeue().await.unwrap();
        assert_eq!(requeued.retry_count, 1);
        let lease = coordinator.locks.acquire("a").await.unwrap();
        coordinator.locks.release(lease).await;

        assert!(matches!(
            handle.await.unwrap(),
            Ok(RunOutcome::Retrying { retry_count: 1, .. })
        ));
    }
}
