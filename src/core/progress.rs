//! Progress tracking for the operation in flight.
//!
//! The board reports a total length once and then a stream of completion
//! lengths. Completion is clamped to the total and never moves backwards
//! within an operation, so observers can draw a monotonic bar.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u32,
    /// Zero while the total is not known yet (indeterminate).
    pub total: u32,
}

impl Progress {
    pub fn is_indeterminate(&self) -> bool {
        self.total == 0
    }

    pub fn percentage(&self) -> Option<u8> {
        if self.is_indeterminate() {
            return None;
        }
        Some(((self.current as u64 * 100) / self.total as u64) as u8)
    }
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Progress,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to indeterminate at the start of an operation or phase.
    pub fn reset(&mut self) -> Progress {
        self.state = Progress::default();
        self.state
    }

    /// Establish the upper bound. Returns the new state if it changed.
    pub fn set_total(&mut self, total: u32) -> Option<Progress> {
        let next = Progress {
            current: self.state.current.min(total),
            total,
        };
        self.apply(next)
    }

    /// Record a completion length. Returns the new state if it changed.
    pub fn set_completion(&mut self, completed: u32) -> Option<Progress> {
        let clamped = completed.min(self.state.total);
        let next = Progress {
            current: clamped.max(self.state.current),
            total: self.state.total,
        };
        self.apply(next)
    }

    pub fn get(&self) -> Progress {
        self.state
    }

    fn apply(&mut self, next: Progress) -> Option<Progress> {
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
