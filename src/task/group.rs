//! Concurrent execution of many tasks against one renderer

use super::{RunResult, Task, TaskInfo};
use crate::error::{Error, Result};
use crate::printer::{LogPrinter, TaskPrinter, TaskStatus};
use crate::retry::{ExecutionReport, execute};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A batch of tasks executed with bounded concurrency
///
/// Each task gets its own retry executor on a tokio task. When a renderer is
/// attached every task is registered with it before any task starts, and its
/// row follows the task through Running to Done or Failed.
pub struct TaskGroup {
    parallel: usize,
    printer: Option<TaskPrinter>,
    entries: Vec<(TaskInfo, Box<dyn Task>)>,
    ids: HashSet<String>,
    next_id: u64,
}

impl TaskGroup {
    /// Group running at most `parallel` tasks at once (at least one)
    pub fn new(parallel: usize) -> Self {
        Self {
            parallel: parallel.max(1),
            printer: None,
            entries: Vec::new(),
            ids: HashSet::new(),
            next_id: 1,
        }
    }

    /// Report progress through a renderer instead of `tracing`
    pub fn with_printer(mut self, printer: TaskPrinter) -> Self {
        self.printer = Some(printer);
        self
    }

    /// Add a task under the next free numeric id
    ///
    /// Numbers already taken by [`append_with_id`](Self::append_with_id) are skipped.
    pub fn append(&mut self, task: impl Task + 'static, max_retry: u32) -> TaskInfo {
        let id = loop {
            let candidate = self.next_id.to_string();
            self.next_id += 1;
            if !self.ids.contains(&candidate) {
                break candidate;
            }
        };
        self.push(id, task, max_retry)
    }

    /// Add a task under an explicit id
    ///
    /// Every task owns one renderer row, so an id already in the group is
    /// rejected with [`Error::DuplicateTask`].
    pub fn append_with_id(
        &mut self,
        id: impl Into<String>,
        task: impl Task + 'static,
        max_retry: u32,
    ) -> Result<TaskInfo> {
        let id = id.into();
        if self.ids.contains(&id) {
            return Err(Error::DuplicateTask(id));
        }
        Ok(self.push(id, task, max_retry))
    }

    fn push(&mut self, id: String, task: impl Task + 'static, max_retry: u32) -> TaskInfo {
        self.ids.insert(id.clone());
        let info = TaskInfo::new(id, max_retry);
        self.entries.push((info.clone(), Box::new(task)));
        info
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no task was added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every task and return the reports in insertion order
    ///
    /// A failing or panicking task does not affect its siblings.
    pub async fn execute(self) -> Vec<ExecutionReport> {
        let TaskGroup {
            parallel,
            printer,
            entries,
            ..
        } = self;

        if let Some(printer) = &printer {
            for (info, _) in &entries {
                printer.register(info);
            }
        }

        let permits = Arc::new(Semaphore::new(parallel));
        let mut handles = Vec::with_capacity(entries.len());
        for (info, mut task) in entries {
            match &printer {
                Some(printer) => task.set_printer(Arc::new(printer.printer_for(info.id()))),
                None => task.set_printer(Arc::new(LogPrinter::new(info.id()))),
            }

            let permits = permits.clone();
            let printer = printer.clone();
            let task_info = info.clone();
            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                if let Some(printer) = &printer {
                    printer.set_status(task_info.id(), TaskStatus::Running);
                }
                let report = execute(task.as_mut(), &task_info).await;
                if let Some(printer) = &printer {
                    let status = if report.succeeded {
                        TaskStatus::Done
                    } else {
                        TaskStatus::Failed
                    };
                    printer.set_status(task_info.id(), status);
                }
                report
            });
            handles.push((info, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (info, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(task_id = info.id(), error = %e, "Task panicked");
                    if let Some(printer) = &printer {
                        printer.set_status(info.id(), TaskStatus::Failed);
                    }
                    reports.push(ExecutionReport {
                        id: info.id().to_string(),
                        succeeded: false,
                        retries: info.retry(),
                        last: RunResult::failed(
                            "task panicked",
                            Some(Error::Other(e.to_string())),
                        ),
                    });
                }
            }
        }
        reports
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use crate::printer::{Renderer, SharedPrinter};
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Sleeper {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        fail: bool,
        printer: Option<SharedPrinter>,
    }

    #[async_trait]
    impl Task for Sleeper {
        fn bind(&mut self, _info: TaskInfo) {}

        fn set_printer(&mut self, printer: SharedPrinter) {
            self.printer = Some(printer);
        }

        async fn run(&mut self) -> RunResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if let Some(printer) = &self.printer {
                printer.print("done sleeping");
            }
            if self.fail {
                RunResult::failed("boom", None)
            } else {
                RunResult::success()
            }
        }

        fn retry_wait(&self) -> Duration {
            Duration::ZERO
        }
    }

    struct Panics;

    #[async_trait]
    impl Task for Panics {
        fn bind(&mut self, _info: TaskInfo) {}

        async fn run(&mut self) -> RunResult {
            panic!("task blew up");
        }

        fn retry_wait(&self) -> Duration {
            Duration::ZERO
        }
    }

    fn sleeper(running: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>, fail: bool) -> Sleeper {
        Sleeper {
            running: running.clone(),
            peak: peak.clone(),
            fail,
            printer: None,
        }
    }

    #[tokio::test]
    async fn respects_parallel_limit_and_keeps_order() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(2);
        for i in 0..6 {
            group.append(sleeper(&running, &peak, i == 3), 0);
        }
        assert_eq!(group.len(), 6);

        let reports = group.execute().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let ids: Vec<&str> = reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4", "5", "6"]);
        let failed: Vec<&str> = reports
            .iter()
            .filter(|r| !r.succeeded)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(failed, ["4"], "one failure must not affect siblings");
    }

    #[tokio::test]
    async fn panicking_task_is_reported_as_failed() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(4);
        group.append_with_id("bad", Panics, 2).unwrap();
        group.append_with_id("good", sleeper(&running, &peak, false), 2).unwrap();

        let reports = group.execute().await;

        assert!(!reports[0].succeeded);
        assert_eq!(reports[0].last.message(), "task panicked");
        assert!(reports[1].succeeded);
    }

    #[tokio::test]
    async fn numeric_ids_skip_explicit_ones() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(4);
        group.append_with_id("2", sleeper(&running, &peak, false), 0).unwrap();
        assert_eq!(group.append(sleeper(&running, &peak, false), 0).id(), "1");
        assert_eq!(group.append(sleeper(&running, &peak, false), 0).id(), "3");

        let capture = Capture::default();
        let renderer = Renderer::start(
            capture.clone(),
            &RendererConfig {
                tick_interval: Duration::from_millis(5),
                ..RendererConfig::default()
            },
        );
        let reports = group.with_printer(renderer.printer()).execute().await;
        renderer.stop().await.unwrap();

        let ids: Vec<&str> = reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["2", "1", "3"]);
        let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let frame = text.rsplit("\x1b[").next().unwrap();
        let rows: Vec<&str> = frame.lines().filter(|l| l.contains("done sleeping")).collect();
        assert_eq!(rows.len(), 3, "one row per task: {text:?}");
        for id in ["[2]", "[1]", "[3]"] {
            assert_eq!(rows.iter().filter(|row| row.contains(id)).count(), 1, "{id} in {rows:?}");
        }
    }

    #[test]
    fn duplicate_explicit_id_is_rejected() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(1);
        group.append(sleeper(&running, &peak, false), 0);
        let err = group
            .append_with_id("1", sleeper(&running, &peak, false), 0)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTask(ref id) if id == "1"));
        assert_eq!(group.len(), 1);
    }

    #[tokio::test]
    async fn empty_group_returns_no_reports() {
        let group = TaskGroup::new(0);
        assert!(group.is_empty());
        assert!(group.execute().await.is_empty());
    }
}
