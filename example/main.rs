use async_trait::async_trait;
use jobcuter::config::{ExecutorConfig, ResolverConfig, RetryConfig};
use jobcuter::logging::init_tracing;
use jobcuter::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Demo handler: "flaky" jobs fail their first attempts, "broken" jobs always fail.
struct PipelineStep {
    flaky_failures: AtomicU32,
}

#[async_trait]
impl JobHandler for PipelineStep {
    async fn execute(&self, job: &Job, ctx: JobContext) -> Result<(), JobcuterError> {
        println!(
            "running {} (attempt {}, token {}): {}",
            job.id, ctx.attempt, ctx.fencing_token, job.payload
        );

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(JobcuterError::ContextCancelled(job.id.clone()));
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        if job.payload.starts_with("broken") {
            return Err(JobcuterError::ExecutionFailure(format!("{} is broken", job.id)));
        }
        if job.payload.starts_with("flaky")
            && self.flaky_failures.fetch_add(1, Ordering::SeqCst) < 2
        {
            return Err(JobcuterError::ExecutionFailure(format!("{} hiccup", job.id)));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig {
        resolver: ResolverConfig {
            scan_interval_ms: 200,
        },
        executor: ExecutorConfig {
            max_workers: 4,
            execution_timeout_ms: Some(5_000),
        },
        retry: RetryConfig {
            interval_ms: 100,
            max_interval_ms: 1_000,
            multiplier: 2.0,
        },
        ..SchedulerConfig::default()
    };
    config.validate()?;
    init_tracing(&config.logging)?;

    let handler = Arc::new(PipelineStep {
        flaky_failures: AtomicU32::new(0),
    });
    let store = MemoryJobStore::shared();
    let scheduler = Scheduler::new(handler, store.clone(), MemoryLockService::shared(), &config);

    scheduler
        .submit_all(vec![
            Job::new("extract", "pull raw rows").with_priority(10),
            Job::new("validate", "flaky schema check")
                .depends_on("extract")
                .with_max_retries(3),
            Job::new("transform", "normalize").depends_on("validate"),
            Job::new("thumbnails", "broken image pipeline").depends_on("extract"),
            Job::new("publish", "push to warehouse")
                .depends_on("transform")
                .depends_on("thumbnails"),
            Job::new("audit", "write audit log").with_priority(-5),
        ])
        .await?;

    println!("=== Dependency graph ===");
    print!("{}", scheduler.render_graph().await);

    println!("=== Running ===");
    let start = std::time::Instant::now();
    scheduler.run_until_settled(CancellationToken::new()).await?;
    println!("=== Settled in {:?} ===", start.elapsed());

    print_report(store.as_ref()).await;
    println!("Blocked: {:?}", scheduler.blocked_jobs().await);

    Ok(())
}
