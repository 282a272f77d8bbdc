//! Raw WebSocket transport
//!
//! Keeps one persistent connection, correlates responses to requests by
//! `req_id` and routes streaming messages to channel handlers. The
//! connection is opened lazily and re-opened on the next call after a drop.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, trace, warn};

use super::{ChannelEvent, ChannelHandler, ChannelSubscription, Transport};
use crate::error::{Result, TickStreamError};
use crate::protocol::{self, AuthorizeRequest, ForgetRequest, PingRequest};
use crate::sync::lock;

/// Interval between application-level keepalive pings
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type Responder = oneshot::Sender<Result<Value>>;

struct StreamRoute {
    handler: ChannelHandler,
    subscription_id: Option<String>,
}

/// In-flight requests and open channels of one connection, keyed by `req_id`
#[derive(Default)]
struct Routes {
    pending: HashMap<u64, Responder>,
    streams: HashMap<u64, StreamRoute>,
    /// Subscribes that timed out before their ack; a late ack is forgotten
    abandoned: HashSet<u64>,
}

type SharedRoutes = Arc<Mutex<Routes>>;

/// Cheap handle used to issue requests on the current connection
#[derive(Clone)]
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    routes: SharedRoutes,
}

struct Connection {
    link: Link,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// WebSocket transport with manual request/response correlation
pub struct SocketTransport {
    url: String,
    token: Option<String>,
    request_timeout: Duration,
    next_req_id: AtomicU64,
    connection: tokio::sync::Mutex<Option<Connection>>,
    alive: Mutex<Arc<AtomicBool>>,
}

impl SocketTransport {
    /// Create a transport; no connection is made until first use
    pub fn new(url: &str, token: Option<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            token,
            request_timeout,
            next_req_id: AtomicU64::new(1),
            connection: tokio::sync::Mutex::new(None),
            alive: Mutex::new(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Open the connection now instead of on first request
    pub async fn connect(&self) -> Result<()> {
        self.link().await.map(|_| ())
    }

    /// Current link, connecting (and authorizing) first if needed
    async fn link(&self) -> Result<Link> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.alive.load(Ordering::SeqCst) {
                return Ok(conn.link.clone());
            }
        }

        let conn = self.open().await?;
        let link = conn.link.clone();
        *lock(&self.alive) = conn.alive.clone();
        *guard = Some(conn);

        if let Some(token) = &self.token {
            match protocol::request(&AuthorizeRequest {
                authorize: token.clone(),
            }) {
                Ok(req) => match self.request_on(&link, req).await {
                    Ok(_) => info!("Connection authorized with cached token"),
                    Err(e) => warn!(error = %e, "Token authorization failed, continuing unauthorized"),
                },
                Err(e) => warn!(error = %e, "Failed to build authorize request"),
            }
        }

        Ok(link)
    }

    async fn open(&self) -> Result<Connection> {
        info!(url = %self.url, "Connecting to market-data WebSocket");

        let (ws_stream, response) = timeout(self.request_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TickStreamError::TransportTimeout(self.request_timeout.as_millis() as u64))?
            .map_err(|e| TickStreamError::WebSocket(format!("Failed to connect: {}", e)))?;

        info!(status = ?response.status(), "WebSocket connected");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let routes: SharedRoutes = Arc::new(Mutex::new(Routes::default()));
        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut keepalive = interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            keepalive.tick().await;

            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let closing = matches!(msg, Message::Close(_));
                        if let Err(e) = sink.send(msg).await {
                            warn!(error = %e, "Failed to write to WebSocket");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = keepalive.tick() => {
                        if let Ok(ping) = protocol::request(&PingRequest::default()) {
                            debug!("Sending keepalive ping");
                            if let Err(e) = sink.send(Message::Text(ping.to_string())).await {
                                warn!(error = %e, "Failed to send keepalive ping");
                                break;
                            }
                        }
                    }
                    _ = writer_shutdown.notified() => break,
                }
            }
            let _ = sink.close().await;
        });

        let reader_routes = routes.clone();
        let reader_alive = alive.clone();
        let reply_tx = outbound.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        debug!(len = text.len(), "Received text message");
                        guarded_dispatch(&reader_routes, &reply_tx, &text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).to_string();
                        guarded_dispatch(&reader_routes, &reply_tx, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping, sending pong");
                        let _ = reply_tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        warn!(frame = ?frame, "Received close frame");
                        break "connection closed by upstream".to_string();
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        break e.to_string();
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        break "stream ended".to_string();
                    }
                }
            };

            reader_alive.store(false, Ordering::SeqCst);
            shutdown.notify_one();
            fail_all(&reader_routes, TickStreamError::StreamInterrupted(reason));
        });

        Ok(Connection {
            link: Link { outbound, routes },
            alive,
            reader,
        })
    }

    fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn timeout_error(&self) -> TickStreamError {
        TickStreamError::TransportTimeout(self.request_timeout.as_millis() as u64)
    }

    /// Send on a specific link and wait for the correlated response
    async fn request_on(&self, link: &Link, request: Value) -> Result<Value> {
        let req_id = self.next_req_id();
        let request = with_req_id(request, req_id)?;
        let (tx, rx) = oneshot::channel();

        lock(&link.routes).pending.insert(req_id, tx);

        if link.outbound.send(Message::Text(request.to_string())).is_err() {
            lock(&link.routes).pending.remove(&req_id);
            return Err(TickStreamError::StreamInterrupted(
                "connection closed".to_string(),
            ));
        }
        trace!(req_id, "Request sent");

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TickStreamError::StreamInterrupted(
                "connection closed before response".to_string(),
            )),
            Err(_) => {
                // A late response finds no route and is dropped
                lock(&link.routes).pending.remove(&req_id);
                warn!(req_id, "Request timed out");
                Err(self.timeout_error())
            }
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn send(&self, request: Value) -> Result<Value> {
        let link = self.link().await?;
        self.request_on(&link, request).await
    }

    async fn subscribe(
        &self,
        request: Value,
        handler: ChannelHandler,
    ) -> Result<ChannelSubscription> {
        let link = self.link().await?;
        let req_id = self.next_req_id();
        let request = with_req_id(request, req_id)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut routes = lock(&link.routes);
            routes.pending.insert(req_id, tx);
            routes.streams.insert(
                req_id,
                StreamRoute {
                    handler,
                    subscription_id: None,
                },
            );
        }

        let unroute = |routes: &SharedRoutes| {
            let mut routes = lock(routes);
            routes.pending.remove(&req_id);
            routes.streams.remove(&req_id);
        };

        if link.outbound.send(Message::Text(request.to_string())).is_err() {
            unroute(&link.routes);
            return Err(TickStreamError::StreamInterrupted(
                "connection closed".to_string(),
            ));
        }

        let ack = match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(TickStreamError::StreamInterrupted(
                    "connection closed before subscription was acknowledged".to_string(),
                ))
            }
            Err(_) => {
                abandon(&link, req_id);
                warn!(req_id, "Subscription timed out");
                return Err(self.timeout_error());
            }
        };

        let subscription_id = protocol::subscription_id(&ack);
        info!(req_id, subscription_id = ?subscription_id, "Channel subscribed");

        let routes = link.routes.clone();
        let outbound = link.outbound.clone();
        let acked_id = subscription_id.clone();
        Ok(ChannelSubscription::new(subscription_id, move || {
            let route = lock(&routes).streams.remove(&req_id);
            if let Some(id) = route.and_then(|r| r.subscription_id).or(acked_id) {
                send_forget(&outbound, id);
            }
        }))
    }

    fn is_connected(&self) -> bool {
        lock(&self.alive).load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };

        info!("Closing market-data WebSocket");
        conn.alive.store(false, Ordering::SeqCst);
        let _ = conn.link.outbound.send(Message::Close(None));
        conn.reader.abort();
        fail_all(
            &conn.link.routes,
            TickStreamError::StreamInterrupted("transport closed".to_string()),
        );
    }
}

/// Attach the correlation id to an outgoing request object
fn with_req_id(mut request: Value, req_id: u64) -> Result<Value> {
    match request.as_object_mut() {
        Some(map) => {
            map.insert("req_id".to_string(), json!(req_id));
            Ok(request)
        }
        None => Err(TickStreamError::Parse(
            "request must be a JSON object".to_string(),
        )),
    }
}

/// Send `{ forget: id }` on the connection
fn send_forget(outbound: &mpsc::UnboundedSender<Message>, id: String) {
    match protocol::request(&ForgetRequest { forget: id.clone() }) {
        Ok(forget) => {
            info!(subscription_id = %id, "Forgetting channel");
            let _ = outbound.send(Message::Text(forget.to_string()));
        }
        Err(e) => warn!(error = %e, "Failed to build forget request"),
    }
}

/// Drop a subscribe that timed out; whatever the upstream opened for it is forgotten
fn abandon(link: &Link, req_id: u64) {
    let acked = {
        let mut routes = lock(&link.routes);
        routes.pending.remove(&req_id);
        match routes.streams.remove(&req_id).and_then(|r| r.subscription_id) {
            Some(id) => Some(id),
            None => {
                routes.abandoned.insert(req_id);
                None
            }
        }
    };
    // The ack raced the timeout
    if let Some(id) = acked {
        send_forget(&link.outbound, id);
    }
}

/// Dispatch without letting a panicking handler take the reader down
fn guarded_dispatch(
    routes: &SharedRoutes,
    outbound: &mpsc::UnboundedSender<Message>,
    raw: &str,
) {
    if catch_unwind(AssertUnwindSafe(|| dispatch(routes, outbound, raw))).is_err() {
        error!("Message handler panicked, message dropped");
    }
}

/// Route one inbound message to its waiting request or open channel
fn dispatch(routes: &SharedRoutes, outbound: &mpsc::UnboundedSender<Message>, raw: &str) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Dropping malformed message");
            return;
        }
    };

    let Some(req_id) = protocol::req_id(&value) else {
        trace!(msg_type = ?value.get("msg_type"), "Dropping uncorrelated message");
        return;
    };

    let mut guard = lock(routes);
    if guard.abandoned.remove(&req_id) {
        drop(guard);
        if protocol::upstream_error(&value).is_none() {
            if let Some(id) = protocol::subscription_id(&value) {
                warn!(req_id, subscription_id = %id, "Late ack for abandoned subscription");
                send_forget(outbound, id);
            }
        }
        return;
    }

    let Routes {
        pending, streams, ..
    } = &mut *guard;
    let responder = pending.remove(&req_id);
    let error = protocol::upstream_error(&value);

    if let Some(route) = streams.get_mut(&req_id) {
        if let Some(err) = error {
            let route = streams.remove(&req_id);
            drop(guard);
            match (responder, route) {
                (Some(tx), _) => {
                    let _ = tx.send(Err(err));
                }
                (None, Some(route)) => (route.handler)(ChannelEvent::Error(err)),
                (None, None) => {}
            }
            return;
        }

        if route.subscription_id.is_none() {
            route.subscription_id = protocol::subscription_id(&value);
        }
        let handler = route.handler.clone();
        drop(guard);

        if let Some(tx) = responder {
            let _ = tx.send(Ok(value.clone()));
        }
        handler(ChannelEvent::Message(value));
        return;
    }
    drop(guard);

    match responder {
        Some(tx) => {
            let result = match error {
                Some(err) => Err(err),
                None => Ok(value),
            };
            let _ = tx.send(result);
        }
        None => trace!(req_id, "Dropping response with no waiting request"),
    }
}

/// Reject every waiting request and interrupt every open channel
fn fail_all(routes: &SharedRoutes, err: TickStreamError) {
    let (pending, streams) = {
        let mut routes = lock(routes);
        (
            std::mem::take(&mut routes.pending),
            std::mem::take(&mut routes.streams),
        )
    };

    for (_, tx) in pending {
        let _ = tx.send(Err(err.clone()));
    }
    for (req_id, route) in streams {
        debug!(req_id, "Interrupting channel");
        (route.handler)(ChannelEvent::Error(err.clone()));
    }
}
