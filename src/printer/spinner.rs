//! Spinner animation state

/// Braille dot frames
pub const DOT_FRAMES: [&str; 8] = ["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];

/// Cyclic frame counter driven by renderer ticks
#[derive(Debug, Clone)]
pub struct Spinner {
    frames: Vec<&'static str>,
    frame: usize,
}

impl Spinner {
    /// Spinner over the given frames
    ///
    /// An empty frame list renders as a blank.
    pub fn new(frames: &[&'static str]) -> Self {
        Self {
            frames: frames.to_vec(),
            frame: 0,
        }
    }

    /// Braille dot spinner
    pub fn dot() -> Self {
        Self::new(&DOT_FRAMES)
    }

    /// Advance one frame
    pub fn tick(&mut self) {
        self.frame = self.frame.wrapping_add(1);
    }

    /// Current frame
    pub fn frame(&self) -> &'static str {
        if self.frames.is_empty() {
            return " ";
        }
        self.frames[self.frame % self.frames.len()]
    }
}

impl Default for Spinner {
    fn default() -> Self {
        Self::dot()
    }
}
