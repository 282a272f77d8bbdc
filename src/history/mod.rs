//! Tick history module
//!
//! Per-instrument bounded windows of observed ticks.

mod store;
mod tick;

pub use store::{TickHistory, DEFAULT_CAPACITY};
pub use tick::{last_digit, DigitFormat, Tick, MAX_DECIMALS};
