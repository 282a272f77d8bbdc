//! SocketTransport against a local mock upstream

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use support::upstream_mock::{default_reply, error_reply, tick_reply, Reply, UpstreamMock};
use support::{eventually, init_tracing};
use tick_analysis::transport::{ChannelEvent, ChannelHandler, SocketTransport, Transport};
use tick_analysis::TickStreamError;

const WAIT: Duration = Duration::from_secs(2);

/// `{ "echo": n, "delay_ms": d }` is answered with `{ "echo": n }` after `d` ms
fn echo_reply(request: &Value) -> Reply {
    let Some(echo) = request.get("echo") else {
        return default_reply(request);
    };
    let reply = json!({ "msg_type": "echo", "echo": echo });
    match request.get("delay_ms").and_then(Value::as_u64) {
        Some(ms) if ms > 0 => Reply::After(Duration::from_millis(ms), reply),
        _ => Reply::Send(vec![reply]),
    }
}

fn collecting_handler() -> (ChannelHandler, Arc<Mutex<Vec<ChannelEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let handler: ChannelHandler = Arc::new(move |event| sink.lock().unwrap().push(event));
    (handler, events)
}

fn quotes(events: &Mutex<Vec<ChannelEvent>>) -> Vec<f64> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Message(value) => value["tick"]["quote"].as_f64(),
            ChannelEvent::Error(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn concurrent_requests_are_matched_by_req_id() {
    init_tracing();
    let mock = UpstreamMock::spawn_with(Arc::new(echo_reply)).await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_secs(2));

    // Replies come back in the opposite order of the requests
    let (a, b, c) = tokio::join!(
        transport.send(json!({ "echo": 1, "delay_ms": 150 })),
        transport.send(json!({ "echo": 2, "delay_ms": 80 })),
        transport.send(json!({ "echo": 3, "delay_ms": 10 })),
    );

    assert_eq!(a.unwrap()["echo"], 1);
    assert_eq!(b.unwrap()["echo"], 2);
    assert_eq!(c.unwrap()["echo"], 3);
    assert_eq!(mock.connections(), 1);
}

#[tokio::test]
async fn upstream_error_payload_is_surfaced() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_secs(2));

    let result = transport
        .send(json!({ "ticks_history": "NOPE", "count": 10, "end": "latest", "style": "ticks" }))
        .await;

    assert_eq!(
        result,
        Err(TickStreamError::UpstreamError {
            code: "InvalidSymbol".into(),
            message: "Symbol NOPE is invalid.".into(),
        })
    );
}

#[tokio::test]
async fn timed_out_request_does_not_steal_a_later_response() {
    init_tracing();
    let mock = UpstreamMock::spawn_with(Arc::new(echo_reply)).await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_millis(100));

    let slow = transport
        .send(json!({ "echo": "slow", "delay_ms": 300 }))
        .await;
    assert_eq!(slow, Err(TickStreamError::TransportTimeout(100)));

    // Let the late reply arrive and be dropped
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fast = transport.send(json!({ "echo": "fast" })).await.unwrap();
    assert_eq!(fast["echo"], "fast");
    assert!(transport.is_connected());
}

#[tokio::test]
async fn subscription_streams_until_forgotten() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_secs(2));
    let (handler, events) = collecting_handler();

    let subscription = transport
        .subscribe(json!({ "ticks": "R_50", "subscribe": 1 }), handler)
        .await
        .unwrap();
    assert_eq!(subscription.id(), Some("sub-R_50"));

    let req_id = mock.received_with("ticks")[0]["req_id"].clone();
    mock.push(tick_reply("R_50", 1234.58, 1_700_000_101, Some(&req_id)));
    mock.push(tick_reply("R_50", 1234.59, 1_700_000_102, Some(&req_id)));

    assert!(eventually(WAIT, || quotes(&events).len() == 3).await);
    assert_eq!(quotes(&events), vec![1234.57, 1234.58, 1234.59]);

    subscription.unsubscribe();
    assert!(eventually(WAIT, || !mock.received_with("forget").is_empty()).await);
    assert_eq!(mock.received_with("forget")[0]["forget"], "sub-R_50");

    mock.push(tick_reply("R_50", 1234.60, 1_700_000_103, Some(&req_id)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(quotes(&events).len(), 3);
}

#[tokio::test]
async fn rejected_subscription_returns_error() {
    init_tracing();
    let mock = UpstreamMock::spawn_with(Arc::new(|request: &Value| {
        if request.get("ticks").is_some() {
            Reply::Send(vec![error_reply("MarketIsClosed", "This market is presently closed.")])
        } else {
            default_reply(request)
        }
    }))
    .await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_secs(2));
    let (handler, events) = collecting_handler();

    let result = transport
        .subscribe(json!({ "ticks": "R_50", "subscribe": 1 }), handler)
        .await;

    assert!(matches!(
        result,
        Err(TickStreamError::UpstreamError { ref code, .. }) if code == "MarketIsClosed"
    ));
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn token_is_authorized_before_first_request() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let transport = SocketTransport::new(&mock.url(), Some("a1-token".into()), Duration::from_secs(2));

    let pong = transport.send(json!({ "ping": 1 })).await.unwrap();
    assert_eq!(pong["ping"], "pong");

    let received = mock.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0]["authorize"], "a1-token");
    assert_eq!(received[1]["ping"], 1);
}

#[tokio::test]
async fn rejected_token_does_not_block_requests() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let transport = SocketTransport::new(&mock.url(), Some("bad".into()), Duration::from_secs(2));

    let pong = transport.send(json!({ "ping": 1 })).await.unwrap();
    assert_eq!(pong["ping"], "pong");
}

#[tokio::test]
async fn dropped_connection_interrupts_streams_and_reconnects() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_secs(2));
    let (handler, events) = collecting_handler();

    let _subscription = transport
        .subscribe(json!({ "ticks": "R_50", "subscribe": 1 }), handler)
        .await
        .unwrap();
    assert!(transport.is_connected());

    mock.hangup_all();

    let interrupted = || {
        events.lock().unwrap().iter().any(|event| {
            matches!(event, ChannelEvent::Error(TickStreamError::StreamInterrupted(_)))
        })
    };
    assert!(eventually(WAIT, interrupted).await);
    assert!(!transport.is_connected());

    let pong = transport.send(json!({ "ping": 1 })).await.unwrap();
    assert_eq!(pong["ping"], "pong");
    assert!(transport.is_connected());
    assert_eq!(mock.connections(), 2);
}

#[tokio::test]
async fn close_is_idempotent() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_secs(2));

    transport.connect().await.unwrap();
    assert!(transport.is_connected());

    transport.close().await;
    assert!(!transport.is_connected());

    // Closing twice is a no-op
    transport.close().await;
}

#[tokio::test]
async fn late_ack_after_subscribe_timeout_is_forgotten() {
    init_tracing();
    let mock = UpstreamMock::spawn_with(Arc::new(|request: &Value| {
        match request.get("ticks").and_then(Value::as_str) {
            Some(symbol) => Reply::After(
                Duration::from_millis(300),
                tick_reply(symbol, 1234.57, 1_700_000_100, None),
            ),
            None => default_reply(request),
        }
    }))
    .await;
    let transport = SocketTransport::new(&mock.url(), None, Duration::from_millis(100));
    let (handler, events) = collecting_handler();

    let result = transport
        .subscribe(json!({ "ticks": "R_50", "subscribe": 1 }), handler)
        .await;
    assert_eq!(result.err(), Some(TickStreamError::TransportTimeout(100)));

    assert!(eventually(WAIT, || mock.received_with("forget").len() == 1).await);
    assert_eq!(mock.received_with("forget")[0]["forget"], "sub-R_50");
    assert!(events.lock().unwrap().is_empty());
    assert!(transport.is_connected());
}
