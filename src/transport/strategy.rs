//! Connection strategies
//!
//! Each strategy produces a [`Transport`] or fails; the controller tries them
//! in order and keeps the first success.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{SocketTransport, Transport};
use crate::config::Config;
use crate::error::{Result, TickStreamError};
use crate::protocol::{self, AuthorizeRequest};

/// What a strategy needs to build a connection
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl StrategyContext {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            url: config.endpoint_url(),
            token: config.credential()?,
            request_timeout: config.request_timeout(),
        })
    }
}

/// One way of obtaining a connected transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn establish(&self, ctx: &StrategyContext) -> Result<Arc<dyn Transport>>;
}

/// Authorize a transport with the cached credential; failures are only logged
pub async fn authorize(transport: &dyn Transport, token: &str) {
    let request = match protocol::request(&AuthorizeRequest {
        authorize: token.to_string(),
    }) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Failed to build authorize request");
            return;
        }
    };

    match transport.send(request).await {
        Ok(_) => info!(transport = transport.name(), "Authorized with cached token"),
        Err(e) => warn!(transport = transport.name(), error = %e, "Token authorization failed"),
    }
}

/// Reuse a client the application already registered
pub struct ExistingClientStrategy {
    client: Option<Arc<dyn Transport>>,
}

impl ExistingClientStrategy {
    pub fn new(client: Option<Arc<dyn Transport>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConnectionStrategy for ExistingClientStrategy {
    fn name(&self) -> &'static str {
        "existing-client"
    }

    async fn establish(&self, ctx: &StrategyContext) -> Result<Arc<dyn Transport>> {
        let client = self.client.clone().ok_or_else(|| {
            TickStreamError::TransportUnavailable("no registered client".to_string())
        })?;

        if let Some(token) = &ctx.token {
            authorize(client.as_ref(), token).await;
        }
        Ok(client)
    }
}

/// Builds a transport asynchronously from the strategy context
pub type TransportFactory =
    Box<dyn Fn(StrategyContext) -> BoxFuture<'static, Result<Arc<dyn Transport>>> + Send + Sync>;

/// Construct a fresh client through a registered constructor
pub struct ClientFactoryStrategy {
    factory: Option<TransportFactory>,
}

impl ClientFactoryStrategy {
    pub fn new(factory: Option<TransportFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl ConnectionStrategy for ClientFactoryStrategy {
    fn name(&self) -> &'static str {
        "client-factory"
    }

    async fn establish(&self, ctx: &StrategyContext) -> Result<Arc<dyn Transport>> {
        let factory = self.factory.as_ref().ok_or_else(|| {
            TickStreamError::TransportUnavailable("no client constructor registered".to_string())
        })?;

        let client = factory(ctx.clone()).await?;
        if let Some(token) = &ctx.token {
            authorize(client.as_ref(), token).await;
        }
        Ok(client)
    }
}

/// Open a dedicated WebSocket with manual request correlation
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketStrategy;

#[async_trait]
impl ConnectionStrategy for SocketStrategy {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn establish(&self, ctx: &StrategyContext) -> Result<Arc<dyn Transport>> {
        // The socket authorizes itself on every (re)connect
        let transport = SocketTransport::new(&ctx.url, ctx.token.clone(), ctx.request_timeout);
        transport.connect().await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, UnavailableTransport};
    use serde_json::json;

    fn ctx(token: Option<&str>) -> StrategyContext {
        StrategyContext {
            url: "ws://127.0.0.1:1".to_string(),
            token: token.map(str::to_string),
            request_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_existing_client_absent() {
        let strategy = ExistingClientStrategy::new(None);
        assert!(matches!(
            strategy.establish(&ctx(None)).await,
            Err(TickStreamError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_existing_client_is_authorized() {
        let mut client = MockTransport::new();
        client.expect_name().return_const("mock");
        client
            .expect_send()
            .withf(|req| req == &json!({ "authorize": "tok" }))
            .times(1)
            .returning(|_| Ok(json!({ "msg_type": "authorize" })));

        let strategy = ExistingClientStrategy::new(Some(Arc::new(client)));
        let transport = strategy.establish(&ctx(Some("tok"))).await.unwrap();
        assert_eq!(transport.name(), "mock");
    }

    #[tokio::test]
    async fn test_factory_absent_and_present() {
        let absent = ClientFactoryStrategy::new(None);
        assert!(absent.establish(&ctx(None)).await.is_err());

        let factory: TransportFactory = Box::new(|_ctx| {
            Box::pin(async {
                Ok(Arc::new(UnavailableTransport::new("stub")) as Arc<dyn Transport>)
            })
        });
        let present = ClientFactoryStrategy::new(Some(factory));
        let transport = tokio_test::assert_ok!(present.establish(&ctx(None)).await);
        assert_eq!(transport.name(), "unavailable");
    }

    #[tokio::test]
    async fn test_socket_strategy_fails_without_server() {
        assert!(SocketStrategy.establish(&ctx(None)).await.is_err());
    }
}
