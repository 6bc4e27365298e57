use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use crate::JobcuterError;

const MAX_INTERVAL_CEILING: Duration = Duration::from_secs(150);

/// Exponential backoff between retries of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Replaces unusable values with defaults. A multiplier below one would
    /// make the delay shrink as retries accumulate.
    pub fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = Duration::from_secs(1);
        }
        if self.max_interval.is_zero() {
            self.max_interval = Duration::from_secs(30);
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            self.multiplier = 2.0;
        }
        if self.max_interval > MAX_INTERVAL_CEILING {
            self.max_interval = MAX_INTERVAL_CEILING;
        }
        if self.interval > self.max_interval {
            self.interval = self.max_interval;
        }
        self
    }

    /// Delay before the attempt that follows the `retry_count`-th failure.
    /// Non-decreasing in `retry_count` and capped at `max_interval`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.interval.as_secs_f64() * self.multiplier.powi(exponent);

        if !backoff.is_finite() || backoff >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(backoff)
        }
    }

    /// Sleeps for the backoff of `retry_count`, returning early with
    /// `ContextCancelled` if `ctx` fires first.
    pub async fn wait(
        &self,
        ctx: &CancellationToken,
        retry_count: u32,
    ) -> Result<Duration, JobcuterError> {
        let wait_time = self.backoff(retry_count);

        tokio::select! {
            _ = ctx.cancelled() => {
                Err(JobcuterError::ContextCancelled(
                    "Context cancelled during retry wait".to_string()
                ))
            }
            _ = sleep(wait_time) => Ok(wait_time),
        }
    }
}
