//! Retry executor and backoff
//!
//! [`execute`] drives a [`Task`] through attempts until it succeeds, gives up,
//! or exhausts its retry ceiling. Retry decisions come only from
//! [`RunResult::needs_retry`] and the counter in [`TaskInfo`]; the executor
//! never looks at the cause.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use pan_transfer::retry::execute;
//! use pan_transfer::task::{RunResult, Task, TaskInfo};
//! use std::time::Duration;
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Task for Ping {
//!     fn bind(&mut self, _info: TaskInfo) {}
//!     async fn run(&mut self) -> RunResult {
//!         RunResult::success()
//!     }
//!     fn retry_wait(&self) -> Duration {
//!         Duration::from_millis(10)
//!     }
//! }
//!
//! # async fn example() {
//! let report = execute(&mut Ping, &TaskInfo::new("ping", 3)).await;
//! assert!(report.succeeded);
//! # }
//! ```

use crate::config::RetryConfig;
use crate::task::{RunResult, Task, TaskInfo};
use std::time::Duration;

/// Final report of an executed task
#[derive(Debug)]
pub struct ExecutionReport {
    /// Task id
    pub id: String,
    /// Overall outcome
    pub succeeded: bool,
    /// Retries performed
    pub retries: u32,
    /// Result of the last attempt, authoritative for diagnostics
    pub last: RunResult,
}

/// Drive `task` until it succeeds, fails terminally, or runs out of retries
pub async fn execute<T: Task + ?Sized>(task: &mut T, info: &TaskInfo) -> ExecutionReport {
    task.bind(info.clone());

    loop {
        let result = task.run().await;

        if result.succeeded() {
            if info.retry() > 0 {
                tracing::info!(task_id = info.id(), retries = info.retry(), "Task succeeded after retry");
            }
            task.on_success(&result);
            task.on_complete(&result);
            return report(info, true, result);
        }

        if result.needs_retry() && info.retry() < info.max_retry() {
            task.on_retry(&result);
            let retry = info.increment_retry();
            let wait = task.retry_wait();

            tracing::warn!(
                task_id = info.id(),
                attempt = retry,
                max_retry = info.max_retry(),
                delay_ms = wait.as_millis() as u64,
                reason = %result.describe(),
                "Task attempt failed, retrying"
            );

            tokio::time::sleep(wait).await;
            continue;
        }

        if result.needs_retry() {
            tracing::error!(
                task_id = info.id(),
                retries = info.retry(),
                reason = %result.describe(),
                "Task failed after all retries exhausted"
            );
        } else {
            tracing::error!(
                task_id = info.id(),
                reason = %result.describe(),
                "Task failed with non-retryable result"
            );
        }
        task.on_failed(&result);
        task.on_complete(&result);
        return report(info, false, result);
    }
}

fn report(info: &TaskInfo, succeeded: bool, last: RunResult) -> ExecutionReport {
    ExecutionReport {
        id: info.id().to_string(),
        succeeded,
        retries: info.retry(),
        last,
    }
}

/// Backoff delay before retry number `retry` (1-based)
///
/// `initial_delay * backoff_multiplier^(retry - 1)`, capped at `max_delay`.
/// Retry `0` maps to the initial delay. The result never decreases as
/// `retry` grows as long as the multiplier is at least 1.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(64) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::from_secs_f64(secs)
}
