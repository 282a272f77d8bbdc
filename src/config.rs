//! Configuration module for the tick stream service

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TickStreamError};
use crate::history::{DigitFormat, DEFAULT_CAPACITY, MAX_DECIMALS};
use crate::instrument::Instrument;
use crate::protocol::MAX_HISTORY_COUNT;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Instruments streamed by the service (e.g., ["R_50", "1HZ100V"])
    pub symbols: Vec<Instrument>,

    /// Upstream WebSocket endpoint
    pub ws_endpoint: String,

    /// Query parameters appended to the endpoint
    pub app_id: u32,
    pub language: String,
    pub brand: Option<String>,

    /// Ticks kept per instrument
    pub history_capacity: usize,

    /// Ticks requested when a stream starts
    pub backfill_count: u32,

    /// Timeouts
    pub request_timeout_ms: u64,
    pub probe_timeout_ms: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_connect_attempts: u32,

    /// Fixed decimals for last-digit extraction; upstream pip size when unset
    pub digit_decimals: Option<u32>,

    /// Digits reported as hot/cold
    pub hot_cold_count: usize,

    /// Cached credential, either inline or read from a file
    pub api_token: Option<String>,
    pub api_token_file: Option<PathBuf>,

    /// HTTP port for health, metrics and statistics
    pub health_port: u16,

    /// Status log interval in seconds
    pub status_log_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let symbols = env::var("SYMBOLS")
            .unwrap_or_else(|_| "R_50".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Instrument::parse)
            .collect::<Result<Vec<_>>>()?;

        let defaults = Self::default();

        Ok(Self {
            symbols,
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            app_id: parse_var("APP_ID", defaults.app_id),
            language: env::var("LANGUAGE").unwrap_or(defaults.language),
            brand: env::var("BRAND").ok().filter(|b| !b.is_empty()),
            history_capacity: parse_var("HISTORY_CAPACITY", defaults.history_capacity),
            backfill_count: parse_var("BACKFILL_COUNT", defaults.backfill_count),
            request_timeout_ms: parse_var("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            probe_timeout_ms: parse_var("PROBE_TIMEOUT_MS", defaults.probe_timeout_ms),
            reconnect_delay_ms: parse_var("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_connect_attempts: parse_var("MAX_CONNECT_ATTEMPTS", defaults.max_connect_attempts),
            digit_decimals: parse_digit_decimals(env::var("DIGIT_DECIMALS").ok().as_deref())?,
            hot_cold_count: parse_var("HOT_COLD_COUNT", defaults.hot_cold_count),
            api_token: env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),
            api_token_file: env::var("API_TOKEN_FILE").ok().map(PathBuf::from),
            health_port: parse_var("HEALTH_PORT", defaults.health_port),
            status_log_interval_secs: parse_var(
                "STATUS_LOG_INTERVAL_SECS",
                defaults.status_log_interval_secs,
            ),
        })
    }

    /// Full connection URL including query parameters
    pub fn endpoint_url(&self) -> String {
        let mut url = format!(
            "{}?app_id={}&l={}",
            self.ws_endpoint, self.app_id, self.language
        );
        if let Some(brand) = &self.brand {
            url.push_str("&brand=");
            url.push_str(brand);
        }
        url
    }

    /// How last digits are extracted from quotes
    pub fn digit_format(&self) -> DigitFormat {
        match self.digit_decimals {
            Some(decimals) => DigitFormat::Fixed(decimals),
            None => DigitFormat::Upstream,
        }
    }

    /// Backfill size, clamped to what the upstream serves
    pub fn backfill_count(&self) -> u32 {
        self.backfill_count.min(MAX_HISTORY_COUNT)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// The cached credential; the token file wins over the inline token.
    ///
    /// The file is only read. A missing or empty file means no credential.
    pub fn credential(&self) -> Result<Option<String>> {
        if let Some(path) = &self.api_token_file {
            return match std::fs::read_to_string(path) {
                Ok(contents) => {
                    let token = contents.trim();
                    Ok((!token.is_empty()).then(|| token.to_string()))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(TickStreamError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                ))),
            };
        }
        Ok(self.api_token.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: Instrument::parse("R_50").into_iter().collect(),
            ws_endpoint: "wss://ws.derivws.com/websockets/v3".to_string(),
            app_id: 1089,
            language: "EN".to_string(),
            brand: None,
            history_capacity: DEFAULT_CAPACITY,
            backfill_count: MAX_HISTORY_COUNT,
            request_timeout_ms: 15_000,
            probe_timeout_ms: 10_000,
            reconnect_delay_ms: 1000,
            max_connect_attempts: 3,
            digit_decimals: None,
            hot_cold_count: 3,
            api_token: None,
            api_token_file: None,
            health_port: 9090,
            status_log_interval_secs: 30,
        }
    }
}

/// Parse an environment variable, falling back to the default when unset or invalid
fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Unparseable values mean "unset"; precision beyond an `f64` is an error
fn parse_digit_decimals(raw: Option<&str>) -> Result<Option<u32>> {
    let Some(decimals) = raw.and_then(|v| v.trim().parse::<u32>().ok()) else {
        return Ok(None);
    };
    if decimals > MAX_DECIMALS {
        return Err(TickStreamError::Config(format!(
            "DIGIT_DECIMALS must be at most {}, got {}",
            MAX_DECIMALS, decimals
        )));
    }
    Ok(Some(decimals))
}
