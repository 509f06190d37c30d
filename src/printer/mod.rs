//! Concurrent terminal renderer
//!
//! Any number of tasks report status changes and single-line messages through
//! cheap [`TaskPrinter`] handles. One renderer loop owns all render state and
//! applies events strictly one at a time, redrawing a fixed table with one
//! row per registered task after each event:
//!
//! ```text
//! ⣽ [1] ↑ 12.00MB/48.00MB 2.00MB/s in 6s ............
//! √ [2] upload succeeded, saved to /backup/b.bin
//! - [3]
//! ```
//!
//! Messages containing a line break are printed once above the table and
//! scroll away with the terminal instead of occupying a row.
//!
//! ## Usage
//!
//! ```no_run
//! use pan_transfer::config::RendererConfig;
//! use pan_transfer::printer::{Printer, Renderer, TaskStatus};
//! use pan_transfer::task::TaskInfo;
//!
//! # async fn example() -> pan_transfer::Result<()> {
//! let renderer = Renderer::start(std::io::stdout(), &RendererConfig::default());
//! let printer = renderer.printer();
//!
//! let info = TaskInfo::new("f1", 3);
//! printer.register(&info);
//! printer.set_status("f1", TaskStatus::Running);
//! printer.printer_for("f1").print("halfway there");
//! printer.set_status("f1", TaskStatus::Done);
//!
//! // Returns once the final frame is written.
//! renderer.stop().await?;
//! # Ok(())
//! # }
//! ```

mod screen;
pub mod spinner;

use crate::config::RendererConfig;
use crate::error::{Error, Result};
use crate::task::TaskInfo;
use screen::{RenderEvent, Screen};
use spinner::Spinner;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Display status of a task row
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Registered, not started
    Waiting,
    /// Executing
    Running,
    /// Finished successfully
    Done,
    /// Gave up
    Failed,
}

/// Single-line output callback injected into a task
pub trait Printer: Send + Sync {
    /// Show `message` as the task's current line
    fn print(&self, message: &str);
}

/// Shared printer handle
pub type SharedPrinter = Arc<dyn Printer>;

/// Printer that forwards messages to `tracing`
///
/// Used when a task runs without a renderer, for instance in verbose mode
/// where other output would corrupt the table.
#[derive(Debug, Clone)]
pub struct LogPrinter {
    id: String,
}

impl LogPrinter {
    /// Printer tagging every message with `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Printer for LogPrinter {
    fn print(&self, message: &str) {
        let message = message.trim_end_matches(['\n', '\r']);
        if !message.is_empty() {
            tracing::info!(task_id = %self.id, "{message}");
        }
    }
}

/// Producer-side handle to a running renderer
///
/// Cloning is cheap. Events sent from one handle reach the renderer in the
/// order they were sent.
#[derive(Debug, Clone)]
pub struct TaskPrinter {
    tx: mpsc::UnboundedSender<RenderEvent>,
}

impl TaskPrinter {
    /// Bind `info` to a new row
    ///
    /// Must be called before the task produces any output. Registering an id
    /// twice keeps the first row.
    pub fn register(&self, info: &TaskInfo) {
        self.send(RenderEvent::Register(info.clone()));
    }

    /// Change the status glyph of a task row
    pub fn set_status(&self, id: &str, status: TaskStatus) {
        self.send(RenderEvent::Status {
            id: id.to_string(),
            status,
        });
    }

    /// Printer writing into the row of task `id`
    pub fn printer_for(&self, id: &str) -> RowPrinter {
        RowPrinter {
            id: id.to_string(),
            printer: self.clone(),
        }
    }

    fn send(&self, event: RenderEvent) {
        // A stopped renderer drops late events; nothing is left to draw them.
        if self.tx.send(event).is_err() {
            tracing::trace!("Renderer stopped, dropping event");
        }
    }
}

/// [`Printer`] bound to one task row
#[derive(Debug, Clone)]
pub struct RowPrinter {
    id: String,
    printer: TaskPrinter,
}

impl Printer for RowPrinter {
    fn print(&self, message: &str) {
        let text = message.trim_end_matches(['\n', '\r']);
        if text.is_empty() {
            return;
        }
        self.printer.send(RenderEvent::Message {
            id: self.id.clone(),
            text: text.to_string(),
        });
    }
}

/// Owner of the renderer loop
pub struct Renderer {
    printer: TaskPrinter,
    handle: JoinHandle<std::io::Result<()>>,
}

impl Renderer {
    /// Spawn the renderer loop writing frames to `out`
    ///
    /// Must be called from within a tokio runtime. A zero tick interval is
    /// raised to one millisecond.
    pub fn start<W>(out: W, config: &RendererConfig) -> Self
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let screen = Screen::new(Spinner::dot(), config.erase_margin);
        let tick_interval = config.tick_interval.max(std::time::Duration::from_millis(1));
        let handle = tokio::spawn(render_loop(screen, rx, out, tick_interval));
        Self {
            printer: TaskPrinter { tx },
            handle,
        }
    }

    /// New producer handle
    pub fn printer(&self) -> TaskPrinter {
        self.printer.clone()
    }

    /// Signal quit and wait until the final frame is flushed
    ///
    /// Every event sent before this call is drawn.
    pub async fn stop(self) -> Result<()> {
        let Renderer { printer, handle } = self;
        printer.send(RenderEvent::Quit);
        drop(printer);
        match handle.await {
            Ok(written) => written.map_err(Error::from),
            Err(e) => Err(Error::Other(format!("renderer loop panicked: {e}"))),
        }
    }
}

async fn render_loop<W: Write>(
    mut screen: Screen,
    mut rx: mpsc::UnboundedReceiver<RenderEvent>,
    mut out: W,
    tick_interval: std::time::Duration,
) -> std::io::Result<()> {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    draw(&mut screen, &mut out)?;
    loop {
        let event = tokio::select! {
            received = rx.recv() => received.unwrap_or(RenderEvent::Quit),
            _ = ticker.tick() => RenderEvent::Tick,
        };
        screen.apply(event);
        draw(&mut screen, &mut out)?;
        if screen.quit_requested() {
            return Ok(());
        }
    }
}

fn draw<W: Write>(screen: &mut Screen, out: &mut W) -> std::io::Result<()> {
    let frame = screen.render();
    out.write_all(frame.as_bytes())?;
    out.flush()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
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

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn slow_ticks() -> RendererConfig {
        RendererConfig {
            tick_interval: Duration::from_secs(3600),
            erase_margin: 4,
        }
    }

    fn last_frame(output: &str) -> &str {
        output.rsplit("\x1b[").next().unwrap()
    }

    #[tokio::test]
    async fn stop_flushes_final_frame() {
        let capture = Capture::default();
        let renderer = Renderer::start(capture.clone(), &slow_ticks());
        let printer = renderer.printer();

        printer.register(&TaskInfo::new("f1", 3));
        printer.set_status("f1", TaskStatus::Running);
        printer.printer_for("f1").print("50%/100% 1.0MB/s in 5s");
        printer.set_status("f1", TaskStatus::Done);
        renderer.stop().await.unwrap();

        let output = capture.text();
        assert!(
            output.contains(&format!("{} [f1] 50%/100% 1.0MB/s in 5s", spinner::DOT_FRAMES[0])),
            "running frame missing in {output:?}"
        );
        assert!(last_frame(&output).contains("√ [f1] 50%/100% 1.0MB/s in 5s"));
    }

    #[tokio::test]
    async fn row_printer_strips_trailing_newlines_and_drops_empty() {
        let capture = Capture::default();
        let renderer = Renderer::start(capture.clone(), &slow_ticks());
        let printer = renderer.printer();

        printer.register(&TaskInfo::new("a", 0));
        let row = printer.printer_for("a");
        row.print("first\n\n");
        row.print("\n");
        renderer.stop().await.unwrap();

        let output = capture.text();
        assert!(last_frame(&output).contains("- [a] first"));
        assert!(!output.contains("[a] \n"), "empty message must not reach the row");
    }

    #[tokio::test]
    async fn concurrent_producers_each_own_one_row() {
        let capture = Capture::default();
        let renderer = Renderer::start(capture.clone(), &slow_ticks());
        let printer = renderer.printer();

        for i in 0..8 {
            printer.register(&TaskInfo::new(format!("t{i}"), 0));
        }
        let producers: Vec<_> = (0..8)
            .map(|i| {
                let printer = printer.clone();
                tokio::spawn(async move {
                    let id = format!("t{i}");
                    let row = printer.printer_for(&id);
                    for step in 0..20 {
                        row.print(&format!("step {step}"));
                        tokio::task::yield_now().await;
                    }
                    printer.set_status(&id, TaskStatus::Done);
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        renderer.stop().await.unwrap();

        let output = capture.text();
        let frame = last_frame(&output);
        let rows: Vec<&str> = frame.lines().collect();
        for i in 0..8 {
            let expected = format!("√ [t{i}] step 19");
            assert_eq!(
                rows.iter().filter(|row| row.contains(&format!("[t{i}]"))).count(),
                1,
                "t{i} must own exactly one row"
            );
            assert!(
                rows.iter().any(|row| row.trim_end().ends_with(&expected)),
                "missing {expected:?} in {frame:?}"
            );
        }
    }

    #[tokio::test]
    async fn spinner_ticks_redraw_running_rows() {
        let capture = Capture::default();
        let config = RendererConfig {
            tick_interval: Duration::from_millis(10),
            erase_margin: 4,
        };
        let renderer = Renderer::start(capture.clone(), &config);
        let printer = renderer.printer();

        printer.register(&TaskInfo::new("spin", 0));
        printer.set_status("spin", TaskStatus::Running);
        tokio::time::sleep(Duration::from_millis(80)).await;
        renderer.stop().await.unwrap();

        let output = capture.text();
        let distinct = spinner::DOT_FRAMES
            .iter()
            .filter(|frame| output.contains(&format!("{frame} [spin]")))
            .count();
        assert!(distinct >= 2, "expected several spinner frames in {output:?}");
    }

    #[tokio::test]
    async fn zero_tick_interval_still_renders() {
        let capture = Capture::default();
        let config = RendererConfig {
            tick_interval: Duration::ZERO,
            erase_margin: 4,
        };
        let renderer = Renderer::start(capture.clone(), &config);
        let printer = renderer.printer();

        printer.register(&TaskInfo::new("z", 0));
        printer.set_status("z", TaskStatus::Running);
        tokio::time::sleep(Duration::from_millis(5)).await;
        printer.set_status("z", TaskStatus::Done);
        renderer.stop().await.unwrap();

        assert!(last_frame(&capture.text()).contains("√ [z]"));
    }

    #[tokio::test]
    async fn events_after_stop_are_ignored() {
        let renderer = Renderer::start(Capture::default(), &slow_ticks());
        let printer = renderer.printer();
        renderer.stop().await.unwrap();

        // Must not panic or block.
        printer.set_status("gone", TaskStatus::Failed);
        printer.printer_for("gone").print("late");
    }

    #[test]
    fn log_printer_accepts_messages_without_subscriber() {
        let printer = LogPrinter::new("t");
        printer.print("hello\n");
        printer.print("");
    }
}
