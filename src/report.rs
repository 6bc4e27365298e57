use std::fmt::Write;

use crate::JobStore;

/// Renders every persisted job, highest priority first. A store error is
/// logged and yields the header alone.
pub async fn render_report(store: &dyn JobStore) -> String {
    let mut out = String::from("Job Execution Report:\n");

    match store.list_all().await {
        Ok(jobs) => {
            for job in jobs {
                let _ = writeln!(
                    out,
                    "Job ID: {}, Status: {}, Retries: {}",
                    job.id, job.status, job.retry_count
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "Error generating report"),
    }

    out
}

pub async fn print_report(store: &dyn JobStore) {
    print!("{}", render_report(store).await);
}
