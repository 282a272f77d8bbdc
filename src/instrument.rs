//! Instrument registry
//!
//! Instruments are the sharding key for all per-symbol state, so only
//! symbols the upstream actually quotes are accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TickStreamError};

/// Symbols the upstream streams ticks for, with their display names
pub const KNOWN_INSTRUMENTS: &[(&str, &str)] = &[
    ("R_10", "Volatility 10 Index"),
    ("R_25", "Volatility 25 Index"),
    ("R_50", "Volatility 50 Index"),
    ("R_75", "Volatility 75 Index"),
    ("R_100", "Volatility 100 Index"),
    ("1HZ10V", "Volatility 10 (1s) Index"),
    ("1HZ25V", "Volatility 25 (1s) Index"),
    ("1HZ50V", "Volatility 50 (1s) Index"),
    ("1HZ75V", "Volatility 75 (1s) Index"),
    ("1HZ100V", "Volatility 100 (1s) Index"),
    ("1HZ150V", "Volatility 150 (1s) Index"),
    ("1HZ250V", "Volatility 250 (1s) Index"),
];

/// A tradable symbol known to the upstream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument(String);

impl Instrument {
    /// Parse a symbol, rejecting empty and unknown keys
    pub fn parse(symbol: &str) -> Result<Self> {
        let symbol = symbol.trim();
        KNOWN_INSTRUMENTS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(symbol))
            .map(|(known, _)| Instrument((*known).to_string()))
            .ok_or_else(|| TickStreamError::UnknownInstrument(symbol.to_string()))
    }

    pub fn symbol(&self) -> &str {
        &self.0
    }

    /// Human readable name, e.g. "Volatility 50 Index"
    pub fn display_name(&self) -> &'static str {
        KNOWN_INSTRUMENTS
            .iter()
            .find(|(known, _)| *known == self.0)
            .map(|(_, name)| *name)
            .unwrap_or("Unknown")
    }

    /// All registered instruments
    pub fn all() -> Vec<Instrument> {
        KNOWN_INSTRUMENTS
            .iter()
            .map(|(symbol, _)| Instrument((*symbol).to_string()))
            .collect()
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Instrument {
    type Err = TickStreamError;

    fn from_str(s: &str) -> Result<Self> {
        Instrument::parse(s)
    }
}

impl TryFrom<String> for Instrument {
    type Error = TickStreamError;

    fn try_from(value: String) -> Result<Self> {
        Instrument::parse(&value)
    }
}

impl From<Instrument> for String {
    fn from(instrument: Instrument) -> Self {
        instrument.0
    }
}
