//! Upstream market-data protocol
//!
//! Request builders and deserialization of history, tick and error messages.
//! Every message is a JSON object; responses echo the caller's `req_id` and
//! carry a `msg_type` discriminator.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, TickStreamError};
use crate::history::{DigitFormat, Tick, MAX_DECIMALS};

/// Largest `count` the upstream accepts for a history request
pub const MAX_HISTORY_COUNT: u32 = 1000;

/// `{ ticks_history, count, end: "latest", style: "ticks" }`
#[derive(Debug, Clone, Serialize)]
pub struct TicksHistoryRequest {
    pub ticks_history: String,
    pub count: u32,
    pub end: &'static str,
    pub style: &'static str,
}

impl TicksHistoryRequest {
    /// Build a history request, clamping `count` to the upstream maximum
    pub fn new(symbol: &str, count: u32) -> Self {
        Self {
            ticks_history: symbol.to_string(),
            count: count.min(MAX_HISTORY_COUNT),
            end: "latest",
            style: "ticks",
        }
    }
}

/// `{ ticks, subscribe: 1 }`
#[derive(Debug, Clone, Serialize)]
pub struct TicksRequest {
    pub ticks: String,
    pub subscribe: u8,
}

impl TicksRequest {
    pub fn subscribe(symbol: &str) -> Self {
        Self {
            ticks: symbol.to_string(),
            subscribe: 1,
        }
    }
}

/// `{ forget: subscription_id }`
#[derive(Debug, Clone, Serialize)]
pub struct ForgetRequest {
    pub forget: String,
}

/// `{ authorize: token }`
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest {
    pub authorize: String,
}

/// `{ ping: 1 }`, used as the readiness probe
#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    pub ping: u8,
}

impl Default for PingRequest {
    fn default() -> Self {
        Self { ping: 1 }
    }
}

/// Serialize a request into the JSON value the transport sends
pub fn request<T: Serialize>(req: &T) -> Result<Value> {
    Ok(serde_json::to_value(req)?)
}

/// Error payload reported by the upstream
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl From<ApiError> for TickStreamError {
    fn from(err: ApiError) -> Self {
        TickStreamError::UpstreamError {
            code: err.code,
            message: err.message,
        }
    }
}

/// Response to a history request: parallel price/time arrays
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    pub history: History,

    /// Decimal places the instrument is quoted with
    #[serde(default, deserialize_with = "deserialize_pip_size")]
    pub pip_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct History {
    pub prices: Vec<f64>,
    pub times: Vec<i64>,
}

impl HistoryResponse {
    /// Ticks in upstream order; unmatched trailing entries are dropped
    pub fn into_ticks(self, format: DigitFormat) -> Vec<Tick> {
        let decimals = format.decimals(self.pip_size);
        self.history
            .prices
            .into_iter()
            .zip(self.history.times)
            .map(|(quote, epoch)| Tick::new(quote, epoch, decimals))
            .collect()
    }
}

/// Streaming tick payload
#[derive(Debug, Clone, Deserialize)]
pub struct TickPayload {
    pub quote: f64,
    pub epoch: i64,
    pub symbol: String,

    #[serde(default, deserialize_with = "deserialize_pip_size")]
    pub pip_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
}

/// Streaming tick message
#[derive(Debug, Clone, Deserialize)]
pub struct TickMessage {
    pub tick: TickPayload,
    pub subscription: Option<SubscriptionInfo>,
}

impl TickMessage {
    pub fn to_tick(&self, format: DigitFormat) -> Tick {
        Tick::new(
            self.tick.quote,
            self.tick.epoch,
            format.decimals(self.tick.pip_size),
        )
    }
}

/// Parsed upstream message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    History(HistoryResponse),
    Tick(TickMessage),
    Error(ApiError),
    Pong,
    Authorized,
    Forgotten,
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(error) = value.get("error") {
            let error: ApiError = serde_json::from_value(error.clone())?;
            return Ok(ParsedMessage::Error(error));
        }

        match value.get("msg_type").and_then(Value::as_str) {
            Some("history") => Ok(ParsedMessage::History(serde_json::from_value(
                value.clone(),
            )?)),
            Some("tick") => Ok(ParsedMessage::Tick(serde_json::from_value(value.clone())?)),
            Some("ping") => Ok(ParsedMessage::Pong),
            Some("authorize") => Ok(ParsedMessage::Authorized),
            Some("forget") => Ok(ParsedMessage::Forgotten),
            _ => Ok(ParsedMessage::Unknown(value.to_string())),
        }
    }
}

/// The upstream error carried by a message, if any
pub fn upstream_error(value: &Value) -> Option<TickStreamError> {
    let error = value.get("error")?;
    let parsed: ApiError = serde_json::from_value(error.clone()).unwrap_or_else(|_| ApiError {
        code: "Unknown".to_string(),
        message: error.to_string(),
    });
    Some(parsed.into())
}

/// Request correlation id echoed by the upstream
pub fn req_id(value: &Value) -> Option<u64> {
    value.get("req_id").and_then(Value::as_u64)
}

/// Subscription id of a streaming message
pub fn subscription_id(value: &Value) -> Option<String> {
    value
        .get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Accepts pip size as an integer, a float or a numeric string.
///
/// Anything outside `0..=MAX_DECIMALS` fails the message.
fn deserialize_pip_size<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Value> = Option::deserialize(deserializer)?;
    let places = match raw {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid pip_size"))?,
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(serde::de::Error::custom)?,
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "invalid pip_size: {}",
                other
            )))
        }
    };

    let in_range = (0.0..=f64::from(MAX_DECIMALS)).contains(&places);
    if !in_range || places.fract() != 0.0 {
        return Err(serde::de::Error::custom(format!(
            "pip_size {} out of range 0..={}",
            places, MAX_DECIMALS
        )));
    }
    Ok(Some(places as u32))
}
