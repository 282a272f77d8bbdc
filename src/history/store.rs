//! Bounded tick history
//!
//! Uses a VecDeque ring so appends stay O(1) while evicting the oldest tick,
//! and keeps running last-digit counts so statistics never rescan the window.

use std::collections::VecDeque;

use super::Tick;
use crate::stats::{DigitStats, DIGITS};

/// Default number of ticks retained per instrument
pub const DEFAULT_CAPACITY: usize = 1000;

/// Ordered, bounded history for a single instrument
#[derive(Debug, Clone)]
pub struct TickHistory {
    ticks: VecDeque<Tick>,
    capacity: usize,
    /// Last-digit counts over `ticks`
    counts: [usize; DIGITS],
    /// Ticks dropped off the front since creation
    evicted: u64,
}

impl TickHistory {
    /// Create an empty history; a capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ticks: VecDeque::with_capacity(capacity),
            capacity,
            counts: [0; DIGITS],
            evicted: 0,
        }
    }

    /// Replace the contents with a backfill, keeping the most recent ticks
    pub fn load(&mut self, backfill: impl IntoIterator<Item = Tick>) {
        self.clear();
        for tick in backfill {
            self.append(tick);
        }
    }

    /// Append a tick, evicting the oldest one when full
    pub fn append(&mut self, tick: Tick) {
        if self.ticks.len() == self.capacity {
            if let Some(oldest) = self.ticks.pop_front() {
                self.counts[oldest.last_digit as usize % DIGITS] -= 1;
                self.evicted += 1;
            }
        }
        self.counts[tick.last_digit as usize % DIGITS] += 1;
        self.ticks.push_back(tick);
    }

    /// Copy of the window, most recent last
    pub fn window(&self) -> Vec<Tick> {
        self.ticks.iter().copied().collect()
    }

    /// Copy of the last `n` ticks, most recent last
    pub fn tail(&self, n: usize) -> Vec<Tick> {
        let skip = self.ticks.len().saturating_sub(n);
        self.ticks.iter().skip(skip).copied().collect()
    }

    pub fn latest(&self) -> Option<Tick> {
        self.ticks.back().copied()
    }

    /// Digit statistics consistent with the current window
    pub fn digit_stats(&self) -> DigitStats {
        DigitStats::from_counts(self.counts)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.ticks.clear();
        self.counts = [0; DIGITS];
    }
}

impl Default for TickHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
