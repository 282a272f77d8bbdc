//! Statistics derived from a tick window

mod digits;
mod patterns;

pub use digits::{DigitShare, DigitStats, DIGITS};
pub use patterns::{recent_marks, ContractPattern, PatternSplit};
