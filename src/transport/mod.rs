//! Transport module for the upstream market-data connection
//!
//! [`Transport`] is the request/response plus named-channel contract every
//! connection strategy is normalized to. The [`TransportController`] owns the
//! connection lifecycle and falls back across strategies.

mod controller;
mod socket;
mod strategy;

pub use controller::{ConnectionState, ConnectionStats, StatusListener, TransportController};
pub use socket::SocketTransport;
pub use strategy::{
    authorize, ClientFactoryStrategy, ConnectionStrategy, ExistingClientStrategy,
    SocketStrategy, StrategyContext, TransportFactory,
};

#[cfg(test)]
pub use strategy::MockConnectionStrategy;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TickStreamError};

/// Event delivered on a streaming channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(Value),
    /// The channel failed; no further messages follow
    Error(TickStreamError),
}

/// Callback receiving every event of one channel
pub type ChannelHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Handle to an open streaming channel.
///
/// Dropping the handle or calling [`unsubscribe`](Self::unsubscribe) stops
/// delivery immediately and cancels the channel upstream.
pub struct ChannelSubscription {
    id: Option<String>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelSubscription {
    pub fn new(id: Option<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Upstream subscription id, when the upstream reported one
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Request/response and streaming access to the upstream service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and stats
    fn name(&self) -> &'static str;

    /// Single round trip; upstream error payloads become `UpstreamError`
    async fn send(&self, request: Value) -> Result<Value>;

    /// Open a channel delivering every message tagged for `request`
    async fn subscribe(&self, request: Value, handler: ChannelHandler)
        -> Result<ChannelSubscription>;

    fn is_connected(&self) -> bool;

    /// Release the connection; open channels receive `StreamInterrupted`
    async fn close(&self);
}

/// Stand-in installed when no strategy could connect
#[derive(Debug, Clone)]
pub struct UnavailableTransport {
    reason: String,
}

impl UnavailableTransport {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transport for UnavailableTransport {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn send(&self, _request: Value) -> Result<Value> {
        Err(TickStreamError::TransportUnavailable(self.reason.clone()))
    }

    async fn subscribe(
        &self,
        _request: Value,
        _handler: ChannelHandler,
    ) -> Result<ChannelSubscription> {
        Err(TickStreamError::TransportUnavailable(self.reason.clone()))
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn close(&self) {}
}
