//! Render state and the redraw algorithm
//!
//! [`Screen`] owns everything the renderer mutates: the id → row mapping, the
//! task rows, the pending scroll-back block, the spinner and the width mask of
//! the previous frame. It is only ever touched by the renderer loop, one event
//! at a time.

use super::TaskStatus;
use super::spinner::Spinner;
use crate::task::TaskInfo;
use crossterm::Command;
use crossterm::cursor::MoveUp;
use std::collections::HashMap;
use unicode_width::UnicodeWidthStr;

/// Message of a row until its task prints something
pub(crate) const INITIAL_MESSAGE: &str = "initializing...";

/// Event consumed by the renderer loop
#[derive(Debug)]
pub(crate) enum RenderEvent {
    /// Bind a task to a new row
    Register(TaskInfo),
    /// Task status changed
    Status { id: String, status: TaskStatus },
    /// Task message; multi-line text goes to the scroll-back block
    Message { id: String, text: String },
    /// Advance the spinner
    Tick,
    /// Draw the last frame and stop
    Quit,
}

#[derive(Debug)]
struct Slot {
    info: TaskInfo,
    status: TaskStatus,
    message: String,
}

#[derive(Debug)]
pub(crate) struct Screen {
    spinner: Spinner,
    erase_margin: usize,
    rows: HashMap<String, usize>,
    slots: Vec<Slot>,
    scrollback: Option<String>,
    /// Widths of the previously drawn table rows; `None` before the first frame
    mask: Option<Vec<usize>>,
    quit: bool,
}

impl Screen {
    pub(crate) fn new(spinner: Spinner, erase_margin: usize) -> Self {
        Self {
            spinner,
            erase_margin,
            rows: HashMap::new(),
            slots: Vec::new(),
            scrollback: None,
            mask: None,
            quit: false,
        }
    }

    pub(crate) fn quit_requested(&self) -> bool {
        self.quit
    }

    pub(crate) fn apply(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::Register(info) => {
                if self.rows.contains_key(info.id()) {
                    tracing::debug!(task_id = info.id(), "Task already has a row, ignoring");
                    return;
                }
                self.rows.insert(info.id().to_string(), self.slots.len());
                self.slots.push(Slot {
                    info,
                    status: TaskStatus::Waiting,
                    message: INITIAL_MESSAGE.to_string(),
                });
            }
            RenderEvent::Status { id, status } => match self.rows.get(&id) {
                Some(&row) => self.slots[row].status = status,
                None => tracing::debug!(task_id = %id, "Status for unregistered task"),
            },
            RenderEvent::Message { id, text } => {
                if text.contains('\n') {
                    let block = format!("[{id}] {text}");
                    match &mut self.scrollback {
                        Some(pending) => {
                            pending.push('\n');
                            pending.push_str(&block);
                        }
                        None => self.scrollback = Some(block),
                    }
                    return;
                }
                match self.rows.get(&id) {
                    Some(&row) => self.slots[row].message = text,
                    None => tracing::debug!(task_id = %id, "Message for unregistered task"),
                }
            }
            RenderEvent::Tick => self.spinner.tick(),
            RenderEvent::Quit => self.quit = true,
        }
    }

    /// Text of one table row, without padding
    pub(crate) fn row_text(&self, index: usize) -> Option<String> {
        let slot = self.slots.get(index)?;
        let glyph = match slot.status {
            TaskStatus::Waiting => "-",
            TaskStatus::Running => self.spinner.frame(),
            TaskStatus::Done => "√",
            TaskStatus::Failed => "X",
        };

        let mut line = format!("{glyph} [{}]", slot.info.id());
        if !slot.message.is_empty() {
            line.push(' ');
            line.push_str(&slot.message);
        }
        let retry = slot.info.retry();
        if retry > 0 {
            line.push_str(&format!(" (retry: {}/{})", retry, slot.info.max_retry()));
        }
        Some(line)
    }

    /// Build the next frame and consume the scroll-back block
    ///
    /// After the first frame the output starts by moving the cursor up over
    /// the previous table. Every line shorter than the one it overwrites is
    /// padded with spaces, plus the erase margin.
    pub(crate) fn render(&mut self) -> String {
        let mut lines: Vec<String> = self
            .scrollback
            .take()
            .map(|block| block.split('\n').map(str::to_string).collect())
            .unwrap_or_default();
        let table_start = lines.len();
        lines.extend((0..self.slots.len()).filter_map(|i| self.row_text(i)));

        let previous = self.mask.take();
        let mut frame = String::new();
        if let Some(prev) = &previous {
            if !prev.is_empty() {
                let up = u16::try_from(prev.len()).unwrap_or(u16::MAX);
                // Writing into a String cannot fail.
                let _ = MoveUp(up).write_ansi(&mut frame);
            }
        }

        let mut mask = Vec::with_capacity(lines.len() - table_start);
        for (i, line) in lines.iter().enumerate() {
            let width = line.width();
            frame.push_str(line);
            if let Some(&old) = previous.as_ref().and_then(|prev| prev.get(i)) {
                if width < old + self.erase_margin {
                    frame.push_str(&" ".repeat(old + self.erase_margin - width));
                }
            }
            frame.push('\n');
            if i >= table_start {
                mask.push(width);
            }
        }

        self.mask = Some(mask);
        frame
    }
}
