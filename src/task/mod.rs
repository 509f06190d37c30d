//! Retryable task contract
//!
//! A [`Task`] is one unit of work (an upload, for instance) that the retry
//! executor in [`crate::retry`] drives through attempts. The task decides
//! *whether* an attempt may be retried by returning a [`RunResult`]; the
//! executor decides *when* and *how often*, using only the result's outcome
//! and the retry counter in [`TaskInfo`].

mod group;

pub use group::TaskGroup;

use crate::error::Error;
use crate::printer::SharedPrinter;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Identity of a task inside an execution session
///
/// Clones share the retry counter, so the renderer can display the live
/// count while the executor increments it.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    id: Arc<str>,
    retry: Arc<AtomicU32>,
    max_retry: u32,
}

impl TaskInfo {
    /// New identity with a zero retry counter
    pub fn new(id: impl Into<String>, max_retry: u32) -> Self {
        let id: String = id.into();
        Self {
            id: Arc::from(id),
            retry: Arc::new(AtomicU32::new(0)),
            max_retry,
        }
    }

    /// Stable task id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Retries performed so far
    pub fn retry(&self) -> u32 {
        self.retry.load(Ordering::SeqCst)
    }

    /// Retry ceiling: additional attempts allowed after the first one
    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub(crate) fn increment_retry(&self) -> u32 {
        self.retry.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// How an attempt ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The work is done
    Succeeded,
    /// The attempt failed but another attempt may succeed
    Retry,
    /// The attempt failed and retrying will not help
    Failed,
}

/// Result of one attempt
#[must_use]
#[derive(Debug)]
pub struct RunResult {
    outcome: Outcome,
    message: String,
    cause: Option<Error>,
}

impl RunResult {
    /// Successful attempt
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Succeeded,
            message: String::new(),
            cause: None,
        }
    }

    /// Failed attempt that may be retried
    pub fn retry(message: impl Into<String>, cause: Option<Error>) -> Self {
        Self {
            outcome: Outcome::Retry,
            message: message.into(),
            cause,
        }
    }

    /// Failed attempt that must not be retried
    pub fn failed(message: impl Into<String>, cause: Option<Error>) -> Self {
        Self {
            outcome: Outcome::Failed,
            message: message.into(),
            cause,
        }
    }

    /// Outcome of the attempt
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Whether the attempt succeeded
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Whether the attempt asks to be retried
    pub fn needs_retry(&self) -> bool {
        self.outcome == Outcome::Retry
    }

    /// Human-readable summary
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Underlying error, if any
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_ref()
    }

    /// `"message, cause"`, or just the message when there is no cause
    pub fn describe(&self) -> String {
        match &self.cause {
            Some(cause) if self.message.is_empty() => cause.to_string(),
            Some(cause) => format!("{}, {}", self.message, cause),
            None => self.message.clone(),
        }
    }
}

/// A retryable unit of work
///
/// Lifecycle, as driven by [`crate::retry::execute`]:
/// `bind` once, then `run` repeatedly; after each failed attempt either
/// `on_retry` (followed by a `retry_wait` sleep) or `on_failed`; after a
/// successful attempt `on_success`. `on_complete` is always the last call.
#[async_trait]
pub trait Task: Send {
    /// Attach the identity the executor tracks this task under
    fn bind(&mut self, info: TaskInfo);

    /// Attach the single-line output callback for this task
    fn set_printer(&mut self, _printer: SharedPrinter) {}

    /// Perform one attempt
    async fn run(&mut self) -> RunResult;

    /// Called before the executor waits and retries
    fn on_retry(&mut self, _last: &RunResult) {}

    /// Called once after the successful attempt
    fn on_success(&mut self, _last: &RunResult) {}

    /// Called once when the task gives up
    fn on_failed(&mut self, _last: &RunResult) {}

    /// Called once at the very end, whatever the outcome
    fn on_complete(&mut self, _last: &RunResult) {}

    /// How long to wait before the next attempt
    ///
    /// Called after the retry counter was incremented.
    fn retry_wait(&self) -> Duration;
}
