//! Last-digit frequency statistics
//!
//! Percentages are reported to one decimal place, which keeps their sum
//! within half a point of 100 for any non-empty window. Rankings use the
//! exact counts so rounding never manufactures ties.

use serde::{Deserialize, Serialize};

use crate::history::Tick;

/// Number of distinct last digits
pub const DIGITS: usize = 10;

/// Frequency of each last digit over a window of ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitStats {
    counts: [usize; DIGITS],
    total: usize,
}

/// One row of the per-digit breakdown
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DigitShare {
    pub digit: u8,
    pub count: usize,
    pub percentage: f64,
}

impl DigitStats {
    /// Compute statistics over a point-in-time window
    pub fn compute(window: &[Tick]) -> Self {
        let mut counts = [0usize; DIGITS];
        for tick in window {
            counts[(tick.last_digit as usize) % DIGITS] += 1;
        }
        Self::from_counts(counts)
    }

    pub fn from_counts(counts: [usize; DIGITS]) -> Self {
        Self {
            counts,
            total: counts.iter().sum(),
        }
    }

    pub fn count(&self, digit: u8) -> usize {
        self.counts.get(digit as usize).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> [usize; DIGITS] {
        self.counts
    }

    /// Window size the statistics were computed over
    pub fn total(&self) -> usize {
        self.total
    }

    /// Share of the window ending in `digit`, 0 for an empty window
    pub fn percentage(&self, digit: u8) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let exact = 100.0 * self.count(digit) as f64 / self.total as f64;
        (exact * 10.0).round() / 10.0
    }

    pub fn percentages(&self) -> [f64; DIGITS] {
        let mut out = [0.0; DIGITS];
        for (digit, slot) in out.iter_mut().enumerate() {
            *slot = self.percentage(digit as u8);
        }
        out
    }

    /// Per-digit breakdown in digit order
    pub fn shares(&self) -> Vec<DigitShare> {
        (0..DIGITS as u8)
            .map(|digit| DigitShare {
                digit,
                count: self.count(digit),
                percentage: self.percentage(digit),
            })
            .collect()
    }

    /// All digits from most to least frequent, ties by ascending digit
    pub fn ranking(&self) -> [u8; DIGITS] {
        let mut order: [u8; DIGITS] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        order.sort_by(|a, b| {
            self.counts[*b as usize]
                .cmp(&self.counts[*a as usize])
                .then(a.cmp(b))
        });
        order
    }

    /// The k most frequent digits
    pub fn hot_digits(&self, k: usize) -> Vec<u8> {
        self.ranking()[..k.min(DIGITS)].to_vec()
    }

    /// The k least frequent digits, least frequent first.
    ///
    /// Taken from the tail of [`ranking`](Self::ranking) so that hot and cold
    /// never share a digit while `k <= 5`.
    pub fn cold_digits(&self, k: usize) -> Vec<u8> {
        let k = k.min(DIGITS);
        let mut cold = self.ranking()[DIGITS - k..].to_vec();
        cold.sort_by(|a, b| {
            self.counts[*a as usize]
                .cmp(&self.counts[*b as usize])
                .then(a.cmp(b))
        });
        cold
    }

    /// Most frequent digit, if the window is non-empty
    pub fn mode(&self) -> Option<u8> {
        (self.total > 0).then(|| self.ranking()[0])
    }
}
