//! Tick type and last-digit extraction

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Most decimal places a quote is rendered with; an `f64` carries no more
pub const MAX_DECIMALS: u32 = 17;

/// How a quote is rendered before its last digit is taken.
///
/// The upstream reports the price precision of each instrument as `pip_size`;
/// a quote of `1234.5` at pip size 2 is "1234.50" and ends in 0, not 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitFormat {
    /// Always render with this many decimal places
    Fixed(u32),
    /// Use the precision reported by the upstream, shortest form if absent
    #[default]
    Upstream,
    /// Shortest round-trip representation of the float
    Shortest,
}

impl DigitFormat {
    /// Decimal places to render with, given the upstream's reported pip size
    pub fn decimals(&self, pip_size: Option<u32>) -> Option<u32> {
        match self {
            DigitFormat::Fixed(decimals) => Some(*decimals),
            DigitFormat::Upstream => pip_size,
            DigitFormat::Shortest => None,
        }
    }
}

/// Final digit of the quote's decimal string
pub fn last_digit(quote: f64, decimals: Option<u32>) -> u8 {
    let rendered = match decimals {
        Some(places) => format!("{:.*}", places.min(MAX_DECIMALS) as usize, quote),
        None => quote.to_string(),
    };

    rendered
        .bytes()
        .rev()
        .find(u8::is_ascii_digit)
        .map(|b| b - b'0')
        .unwrap_or(0)
}

/// A single market observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub quote: f64,
    /// Seconds since the Unix epoch
    pub epoch: i64,
    pub last_digit: u8,
}

impl Tick {
    pub fn new(quote: f64, epoch: i64, decimals: Option<u32>) -> Self {
        Self {
            quote,
            epoch,
            last_digit: last_digit(quote, decimals),
        }
    }

    /// Observation time as a UTC timestamp
    pub fn time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.epoch, 0).single()
    }

    pub fn is_even(&self) -> bool {
        self.last_digit % 2 == 0
    }
}
