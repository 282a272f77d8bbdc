//! Transport lifecycle controller
//!
//! Runs the ordered strategy list with bounded exponential backoff, probes
//! the winner and installs it; when nothing connects a stub that rejects
//! every call is installed instead. Callers never see connection failures
//! as errors from `initialize`, only as the Degraded state.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::{
    ChannelHandler, ChannelSubscription, ConnectionStrategy, StrategyContext, Transport,
    UnavailableTransport,
};
use crate::config::Config;
use crate::error::{Result, TickStreamError};
use crate::metrics;
use crate::protocol::{self, PingRequest};
use crate::sync::lock;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;

/// Lifecycle of the upstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
}

impl ConnectionState {
    fn is_settled(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Degraded)
    }
}

/// Callback told whether the transport is connected
pub type StatusListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Snapshot of the controller for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub connected: bool,
    pub strategy: Option<&'static str>,
    pub listener_count: usize,
    pub endpoint: String,
}

struct Active {
    transport: Arc<dyn Transport>,
    strategy: Option<&'static str>,
}

/// Owns the active transport and its lifecycle
pub struct TransportController {
    strategies: Vec<Box<dyn ConnectionStrategy>>,
    context: StrategyContext,
    reconnect_delay: Duration,
    max_connect_attempts: u32,
    probe_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    active: Mutex<Active>,
    listeners: Mutex<Vec<(u64, StatusListener)>>,
    next_listener_id: AtomicU64,
    init_lock: tokio::sync::Mutex<()>,
}

impl TransportController {
    /// Create a controller that will try `strategies` in order
    pub fn new(strategies: Vec<Box<dyn ConnectionStrategy>>, context: StrategyContext) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            strategies,
            context,
            reconnect_delay: Duration::from_millis(1000),
            max_connect_attempts: 3,
            probe_timeout: Duration::from_secs(10),
            state,
            active: Mutex::new(Active {
                transport: Arc::new(UnavailableTransport::new("transport not initialized")),
                strategy: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a controller with retry and probe settings from configuration
    pub fn from_config(config: &Config, strategies: Vec<Box<dyn ConnectionStrategy>>) -> Result<Self> {
        Ok(Self::new(strategies, StrategyContext::from_config(config)?)
            .with_retry(
                Duration::from_millis(config.reconnect_delay_ms),
                config.max_connect_attempts,
            )
            .with_probe_timeout(config.probe_timeout()))
    }

    /// Base backoff delay and number of passes over the strategy list
    pub fn with_retry(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_connect_attempts = max_attempts.max(1);
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Establish a transport unless one is already settled.
    ///
    /// Concurrent callers share a single run of the strategy list.
    pub async fn initialize(&self) -> ConnectionState {
        if self.state().is_settled() {
            return self.state();
        }

        let _guard = self.init_lock.lock().await;
        if self.state().is_settled() {
            return self.state();
        }
        self.run_strategies().await
    }

    /// Drop the current transport and run the strategy list again
    pub async fn reinitialize(&self) -> ConnectionState {
        let _guard = self.init_lock.lock().await;
        self.restart().await
    }

    /// Run the strategy list again if the last run ended Degraded.
    ///
    /// Any other settled state is left alone, so concurrent callers restart once.
    pub async fn recover(&self) -> ConnectionState {
        let _guard = self.init_lock.lock().await;
        match self.state() {
            ConnectionState::Degraded => self.restart().await,
            ConnectionState::Uninitialized => self.run_strategies().await,
            state => state,
        }
    }

    /// Caller holds `init_lock`
    async fn restart(&self) -> ConnectionState {
        info!("Reinitializing transport");

        let previous = self.install(
            Arc::new(UnavailableTransport::new("transport reinitializing")),
            None,
        );
        self.state.send_replace(ConnectionState::Uninitialized);
        previous.close().await;

        self.run_strategies().await
    }

    async fn run_strategies(&self) -> ConnectionState {
        self.state.send_replace(ConnectionState::Initializing);
        metrics::record_transport_state(ConnectionState::Initializing);

        for attempt in 0..self.max_connect_attempts {
            if attempt > 0 {
                // Exponential backoff, capped at MAX_BACKOFF_MS
                let base_delay =
                    self.reconnect_delay.as_millis() as u64 * 2u64.pow(attempt.min(6));
                let delay = Duration::from_millis(base_delay.min(MAX_BACKOFF_MS));
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying connection strategies after backoff"
                );
                sleep(delay).await;
            }

            for strategy in &self.strategies {
                info!(strategy = strategy.name(), attempt, "Trying connection strategy");
                match strategy.establish(&self.context).await {
                    Ok(transport) => {
                        self.probe(transport.as_ref()).await;
                        self.install(transport, Some(strategy.name()));
                        info!(strategy = strategy.name(), "Transport ready");
                        self.transition(ConnectionState::Ready);
                        return ConnectionState::Ready;
                    }
                    Err(e) => {
                        warn!(strategy = strategy.name(), error = %e, "Connection strategy failed");
                    }
                }
            }
        }

        error!(
            attempts = self.max_connect_attempts,
            "No connection strategy succeeded, degrading"
        );
        self.install(
            Arc::new(UnavailableTransport::new(
                "no connection strategy could be established",
            )),
            None,
        );
        self.transition(ConnectionState::Degraded);
        ConnectionState::Degraded
    }

    /// Round-trip check; a failed probe is logged and tolerated
    async fn probe(&self, transport: &dyn Transport) {
        let request = match protocol::request(&PingRequest::default()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Failed to build probe request");
                return;
            }
        };

        match timeout(self.probe_timeout, transport.send(request)).await {
            Ok(Ok(_)) => info!(transport = transport.name(), "Connection probe succeeded"),
            Ok(Err(e)) => warn!(error = %e, "Connection probe failed"),
            Err(_) => warn!(
                timeout_ms = self.probe_timeout.as_millis() as u64,
                "Connection probe timed out"
            ),
        }
    }

    /// Swap the active transport, returning the previous one
    fn install(
        &self,
        transport: Arc<dyn Transport>,
        strategy: Option<&'static str>,
    ) -> Arc<dyn Transport> {
        let mut active = lock(&self.active);
        active.strategy = strategy;
        std::mem::replace(&mut active.transport, transport)
    }

    fn transition(&self, state: ConnectionState) {
        self.state.send_replace(state);
        metrics::record_transport_state(state);
        self.notify(state == ConnectionState::Ready);
    }

    fn notify(&self, connected: bool) {
        let listeners: Vec<StatusListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in &listeners {
            call_listener(listener, connected);
        }
    }

    /// The transport calls are routed to
    pub fn current(&self) -> Arc<dyn Transport> {
        lock(&self.active).transport.clone()
    }

    async fn ready_transport(&self) -> Arc<dyn Transport> {
        if !self.state().is_settled() {
            self.initialize().await;
        }
        self.current()
    }

    /// Register a status listener; it is called at once with the current state
    pub fn add_connection_listener(&self, listener: StatusListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, listener.clone()));
        call_listener(&listener, self.is_connected());
        id
    }

    pub fn remove_connection_listener(&self, id: u64) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Wait until Ready, starting initialization if nobody has
    pub async fn wait_for_ready(&self, wait: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();

        let ready = async {
            if self.state() == ConnectionState::Uninitialized {
                self.initialize().await;
            }
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Degraded => {
                        return Err(TickStreamError::TransportUnavailable(
                            "transport degraded".to_string(),
                        ))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TickStreamError::TransportUnavailable(
                        "controller dropped".to_string(),
                    ));
                }
            }
        };

        timeout(wait, ready)
            .await
            .map_err(|_| TickStreamError::TransportTimeout(wait.as_millis() as u64))?
    }

    pub fn stats(&self) -> ConnectionStats {
        let strategy = lock(&self.active).strategy;
        ConnectionStats {
            state: self.state(),
            connected: self.is_connected(),
            strategy,
            listener_count: lock(&self.listeners).len(),
            endpoint: self.context.url.clone(),
        }
    }
}

#[async_trait]
impl Transport for TransportController {
    fn name(&self) -> &'static str {
        lock(&self.active).strategy.unwrap_or("unavailable")
    }

    async fn send(&self, request: Value) -> Result<Value> {
        self.ready_transport().await.send(request).await
    }

    async fn subscribe(
        &self,
        request: Value,
        handler: ChannelHandler,
    ) -> Result<ChannelSubscription> {
        self.ready_transport().await.subscribe(request, handler).await
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready && self.current().is_connected()
    }

    async fn close(&self) {
        let _guard = self.init_lock.lock().await;
        let previous = self.install(
            Arc::new(UnavailableTransport::new("transport closed")),
            None,
        );
        self.state.send_replace(ConnectionState::Uninitialized);
        metrics::record_transport_state(ConnectionState::Uninitialized);
        previous.close().await;
    }
}

fn call_listener(listener: &StatusListener, connected: bool) {
    if catch_unwind(AssertUnwindSafe(|| listener(connected))).is_err() {
        error!("Connection listener panicked");
    }
}
