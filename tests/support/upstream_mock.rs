//! Scriptable stand-in for the market-data WebSocket.
//!
//! Every inbound request is recorded and answered by a responder function;
//! replies get the request's `req_id` echoed the way the real upstream does.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

/// How the mock answers one request
pub enum Reply {
    Send(Vec<Value>),
    After(Duration, Value),
    Silent,
    /// Drop the connection without a close handshake
    Hangup,
}

pub type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

enum Outbound {
    Text(String),
    Hangup,
}

pub struct UpstreamMock {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<Outbound>>>>,
}

impl UpstreamMock {
    pub async fn spawn() -> Self {
        Self::spawn_with(Arc::new(default_reply)).await
    }

    pub async fn spawn_with(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let senders: Arc<Mutex<Vec<mpsc::UnboundedSender<Outbound>>>> =
            Arc::new(Mutex::new(Vec::new()));

        tokio::spawn({
            let received = received.clone();
            let connections = connections.clone();
            let senders = senders.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let Ok(ws) = accept_async(stream).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);

                    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
                    senders.lock().unwrap().push(tx.clone());

                    let received = received.clone();
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        let (mut sink, mut source) = ws.split();
                        loop {
                            tokio::select! {
                                out = rx.recv() => match out {
                                    Some(Outbound::Text(text)) => {
                                        if sink.send(Message::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Outbound::Hangup) | None => break,
                                },
                                msg = source.next() => {
                                    let Some(Ok(msg)) = msg else { break };
                                    let Message::Text(text) = msg else {
                                        if matches!(msg, Message::Close(_)) {
                                            break;
                                        }
                                        continue;
                                    };
                                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                                        continue;
                                    };
                                    received.lock().unwrap().push(request.clone());

                                    match responder(&request) {
                                        Reply::Send(replies) => {
                                            for reply in replies {
                                                let text = echo_req_id(reply, &request).to_string();
                                                if sink.send(Message::Text(text)).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                        Reply::After(delay, reply) => {
                                            let tx = tx.clone();
                                            let text = echo_req_id(reply, &request).to_string();
                                            tokio::spawn(async move {
                                                tokio::time::sleep(delay).await;
                                                let _ = tx.send(Outbound::Text(text));
                                            });
                                        }
                                        Reply::Silent => {}
                                        Reply::Hangup => break,
                                    }
                                }
                            }
                        }
                    });
                }
            }
        });

        Self {
            addr,
            received,
            connections,
            senders,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Requests carrying `key`, in arrival order
    pub fn received_with(&self, key: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|r| r.get(key).is_some())
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Send an unsolicited message on every open connection
    pub fn push(&self, message: Value) {
        let text = message.to_string();
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(Outbound::Text(text.clone())).is_ok());
    }

    /// Drop every open connection
    pub fn hangup_all(&self) {
        for tx in self.senders.lock().unwrap().drain(..) {
            let _ = tx.send(Outbound::Hangup);
        }
    }
}

fn echo_req_id(mut reply: Value, request: &Value) -> Value {
    if let (Some(map), Some(req_id)) = (reply.as_object_mut(), request.get("req_id")) {
        map.entry("req_id").or_insert_with(|| req_id.clone());
    }
    reply
}

pub fn history_reply(symbol: &str, prices: &[f64]) -> Value {
    let times: Vec<i64> = (0..prices.len() as i64).map(|i| 1_700_000_000 + i).collect();
    json!({
        "msg_type": "history",
        "echo_req": { "ticks_history": symbol },
        "history": { "prices": prices, "times": times },
        "pip_size": 2
    })
}

pub fn tick_reply(symbol: &str, quote: f64, epoch: i64, req_id: Option<&Value>) -> Value {
    let mut message = json!({
        "msg_type": "tick",
        "tick": { "quote": quote, "epoch": epoch, "symbol": symbol, "pip_size": 2 },
        "subscription": { "id": format!("sub-{symbol}") }
    });
    if let Some(req_id) = req_id {
        message["req_id"] = req_id.clone();
    }
    message
}

pub fn error_reply(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message }, "msg_type": "error" })
}

/// Behaves like the real upstream for the handful of calls the client makes
pub fn default_reply(request: &Value) -> Reply {
    if request.get("ping").is_some() {
        return Reply::Send(vec![json!({ "msg_type": "ping", "ping": "pong" })]);
    }
    if let Some(token) = request.get("authorize").and_then(Value::as_str) {
        if token == "bad" {
            return Reply::Send(vec![error_reply("InvalidToken", "The token is invalid.")]);
        }
        return Reply::Send(vec![json!({
            "msg_type": "authorize",
            "authorize": { "loginid": "VRTC1001" }
        })]);
    }
    if let Some(symbol) = request.get("ticks_history").and_then(Value::as_str) {
        if symbol == "NOPE" {
            return Reply::Send(vec![error_reply("InvalidSymbol", "Symbol NOPE is invalid.")]);
        }
        return Reply::Send(vec![history_reply(symbol, &[1234.51, 1234.52, 1234.53])]);
    }
    if let Some(symbol) = request.get("ticks").and_then(Value::as_str) {
        return Reply::Send(vec![tick_reply(symbol, 1234.57, 1_700_000_100, None)]);
    }
    if request.get("forget").is_some() {
        return Reply::Send(vec![json!({ "msg_type": "forget", "forget": 1 })]);
    }
    Reply::Send(vec![error_reply("UnrecognisedRequest", "Unrecognised request.")])
}
