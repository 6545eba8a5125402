//! Windowed max filter keyed by round count.

use std::collections::VecDeque;

/// Running maximum over the last `window` rounds.
///
/// Samples are kept in a monotone deque: values strictly decrease from the
/// front, so the front is always the maximum and every update is amortised
/// O(1).
#[derive(Debug, Clone)]
pub struct WindowedMaxFilter {
    window: u64,
    samples: VecDeque<(u64, u64)>,
}

impl WindowedMaxFilter {
    /// Create a filter spanning `window` rounds (at least one).
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Add a sample taken during `round`.
    pub fn update(&mut self, round: u64, value: u64) {
        self.expire(round);
        while matches!(self.samples.back(), Some(&(_, v)) if v <= value) {
            self.samples.pop_back();
        }
        self.samples.push_back((round, value));
    }

    /// Drop samples that fell out of the window as of `round`.
    pub fn expire(&mut self, round: u64) {
        while matches!(self.samples.front(), Some(&(r, _)) if r + self.window <= round) {
            self.samples.pop_front();
        }
    }

    /// Current maximum, zero when empty.
    pub fn get(&self) -> u64 {
        self.samples.front().map(|&(_, v)| v).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
