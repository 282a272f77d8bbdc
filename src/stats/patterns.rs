//! Two-outcome contract patterns over a tick window

use serde::{Deserialize, Serialize};

use crate::history::Tick;

/// Digit contract families that split every tick into two outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContractPattern {
    EvenOdd,
    /// Quote movement against the previous tick; unchanged counts as a fall
    RiseFall,
    /// Last digit strictly above the barrier, or not
    OverUnder { barrier: u8 },
    MatchesDiffers { target: u8 },
}

impl ContractPattern {
    /// Labels for the first and second outcome
    pub fn labels(&self) -> (String, String) {
        match self {
            ContractPattern::EvenOdd => ("Even".into(), "Odd".into()),
            ContractPattern::RiseFall => ("Rise".into(), "Fall".into()),
            ContractPattern::OverUnder { barrier } => {
                (format!("Over {}", barrier), format!("Under {}", barrier.saturating_add(1)))
            }
            ContractPattern::MatchesDiffers { .. } => ("Matches".into(), "Differs".into()),
        }
    }

    /// `Some(true)` for the first outcome; `None` when the tick can't be classified
    fn classify(&self, previous: Option<&Tick>, tick: &Tick) -> Option<bool> {
        match self {
            ContractPattern::EvenOdd => Some(tick.is_even()),
            ContractPattern::RiseFall => previous.map(|prev| tick.quote > prev.quote),
            ContractPattern::OverUnder { barrier } => Some(tick.last_digit > *barrier),
            ContractPattern::MatchesDiffers { target } => Some(tick.last_digit == *target),
        }
    }

    fn marks(&self) -> (char, char) {
        match self {
            ContractPattern::EvenOdd => ('E', 'O'),
            ContractPattern::RiseFall => ('R', 'F'),
            ContractPattern::OverUnder { .. } => ('O', 'U'),
            ContractPattern::MatchesDiffers { .. } => ('M', 'D'),
        }
    }
}

/// Outcome counts of a pattern over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSplit {
    pub pattern: ContractPattern,
    pub first: usize,
    pub second: usize,
    pub first_pct: u32,
    pub second_pct: u32,
}

impl PatternSplit {
    pub fn compute(window: &[Tick], pattern: ContractPattern) -> Self {
        let mut first = 0usize;
        let mut second = 0usize;
        let mut previous: Option<&Tick> = None;

        for tick in window {
            match pattern.classify(previous, tick) {
                Some(true) => first += 1,
                Some(false) => second += 1,
                None => {}
            }
            previous = Some(tick);
        }

        let total = first + second;
        let pct = |count: usize| -> u32 {
            if total == 0 {
                0
            } else {
                (100.0 * count as f64 / total as f64).round() as u32
            }
        };

        Self {
            pattern,
            first,
            second,
            first_pct: pct(first),
            second_pct: pct(second),
        }
    }

    pub fn total(&self) -> usize {
        self.first + self.second
    }
}

/// Per-tick outcome marks for the last `n` ticks, oldest first.
///
/// A rise/fall mark needs a predecessor; the oldest tick of the window gets `-`.
pub fn recent_marks(window: &[Tick], pattern: ContractPattern, n: usize) -> Vec<char> {
    let start = window.len().saturating_sub(n);
    let (first, second) = pattern.marks();

    (start..window.len())
        .map(|i| {
            let previous = i.checked_sub(1).map(|p| &window[p]);
            match pattern.classify(previous, &window[i]) {
                Some(true) => first,
                Some(false) => second,
                None => '-',
            }
        })
        .collect()
}
