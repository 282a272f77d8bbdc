//! Controller, socket strategy and coordinator wired against a mock upstream

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use support::upstream_mock::{tick_reply, UpstreamMock};
use support::{eventually, init_tracing};
use tick_analysis::history::DigitFormat;
use tick_analysis::transport::{ConnectionStrategy, StrategyContext};
use tick_analysis::{
    ConnectionState, FeedEvent, FeedStatus, Instrument, SocketStrategy, SubscriptionCoordinator,
    TickPointer, Transport, TransportController,
};

const WAIT: Duration = Duration::from_secs(3);

fn controller(mock: &UpstreamMock) -> Arc<TransportController> {
    let strategies: Vec<Box<dyn ConnectionStrategy>> = vec![Box::new(SocketStrategy)];
    let ctx = StrategyContext {
        url: mock.url(),
        token: None,
        request_timeout: Duration::from_secs(1),
    };
    Arc::new(
        TransportController::new(strategies, ctx)
            .with_retry(Duration::from_millis(10), 1)
            .with_probe_timeout(Duration::from_secs(1)),
    )
}

/// Last digits seen by a listener: snapshot contents followed by live ticks
#[derive(Default)]
struct Seen {
    digits: Vec<u8>,
    interrupted: usize,
    recovered: usize,
}

fn recorder() -> (Arc<Mutex<Seen>>, impl Fn(&FeedEvent) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let sink = seen.clone();
    let listener = move |event: &FeedEvent| {
        let mut seen = sink.lock().unwrap();
        match event {
            FeedEvent::Snapshot { ticks, .. } => {
                seen.digits.extend(ticks.iter().map(|t| t.last_digit))
            }
            FeedEvent::Tick { tick, .. } => seen.digits.push(tick.last_digit),
            FeedEvent::Interrupted(_) => seen.interrupted += 1,
            FeedEvent::Recovered => seen.recovered += 1,
            FeedEvent::Unavailable(_) => {}
        }
    };
    (seen, listener)
}

#[tokio::test]
async fn backfill_then_live_ticks_reach_listener() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let controller = controller(&mock);

    assert_eq!(controller.initialize().await, ConnectionState::Ready);
    assert_eq!(controller.stats().strategy, Some("socket"));

    let coordinator =
        SubscriptionCoordinator::new(controller.clone()).with_digit_format(DigitFormat::Upstream);
    let (seen, listener) = recorder();
    let handle = coordinator
        .initialize_tick_stream("R_50", 3, listener)
        .await
        .unwrap();

    // Backfill 1,2,3 plus the tick acknowledging the subscription
    assert!(eventually(WAIT, || seen.lock().unwrap().digits.len() == 4).await);
    assert_eq!(seen.lock().unwrap().digits, vec![1, 2, 3, 7]);

    let req_id = mock.received_with("ticks")[0]["req_id"].clone();
    mock.push(tick_reply("R_50", 1234.59, 1_700_000_101, Some(&req_id)));
    assert!(eventually(WAIT, || seen.lock().unwrap().digits.len() == 5).await);
    assert_eq!(seen.lock().unwrap().digits[4], 9);

    let history = &mock.received_with("ticks_history")[0];
    assert_eq!(history["count"], 3);
    assert_eq!(history["end"], "latest");

    handle.unsubscribe();
    assert!(eventually(WAIT, || mock.received_with("forget").len() == 1).await);
    assert_eq!(
        coordinator.feed_status(&Instrument::parse("R_50").unwrap()),
        None
    );
}

#[tokio::test]
async fn two_listeners_share_one_upstream_stream() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let controller = controller(&mock);
    let coordinator =
        SubscriptionCoordinator::new(controller.clone()).with_digit_format(DigitFormat::Upstream);

    let (first_seen, first) = recorder();
    let (second_seen, second) = recorder();
    let (a, b) = tokio::join!(
        coordinator.initialize_tick_stream("1HZ100V", 3, first),
        coordinator.initialize_tick_stream("1HZ100V", 3, second),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(mock.received_with("ticks_history").len(), 1);
    assert_eq!(mock.received_with("ticks").len(), 1);

    let req_id = mock.received_with("ticks")[0]["req_id"].clone();
    mock.push(tick_reply("1HZ100V", 1234.56, 1_700_000_101, Some(&req_id)));
    assert!(eventually(WAIT, || first_seen.lock().unwrap().digits.last() == Some(&6)).await);
    assert!(eventually(WAIT, || second_seen.lock().unwrap().digits.last() == Some(&6)).await);

    // Upstream stays open while one listener remains
    drop(a);
    assert!(mock.received_with("forget").is_empty());
    drop(b);
    assert!(eventually(WAIT, || mock.received_with("forget").len() == 1).await);
}

#[tokio::test]
async fn dropped_connection_is_resubscribed_once() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let controller = controller(&mock);
    let coordinator =
        SubscriptionCoordinator::new(controller.clone()).with_digit_format(DigitFormat::Upstream);

    let (seen, listener) = recorder();
    let handle = coordinator
        .initialize_tick_stream("R_100", 3, listener)
        .await
        .unwrap();

    mock.hangup_all();

    assert!(eventually(WAIT, || seen.lock().unwrap().interrupted == 1).await);
    assert!(eventually(WAIT, || seen.lock().unwrap().recovered == 1).await);
    assert!(eventually(WAIT, || handle.status() == Some(FeedStatus::Live)).await);

    assert_eq!(mock.connections(), 2);
    assert_eq!(mock.received_with("ticks").len(), 2);
    // Recovery does not backfill again
    assert_eq!(mock.received_with("ticks_history").len(), 1);
}

#[tokio::test]
async fn pointer_follows_stream_and_degraded_transport_is_reported() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let controller = controller(&mock);
    let coordinator =
        SubscriptionCoordinator::new(controller.clone()).with_digit_format(DigitFormat::Upstream);

    let mut pointer = TickPointer::new(coordinator, 3, 100);
    pointer.set_instrument("R_10", true).await;
    assert!(pointer.is_subscribed());
    assert!(eventually(WAIT, || pointer.tick_history().len() == 4).await);
    assert_eq!(pointer.current_tick().map(|t| t.last_digit), Some(7));

    // Nothing listens on this port once the probe listener is dropped
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let strategies: Vec<Box<dyn ConnectionStrategy>> = vec![Box::new(SocketStrategy)];
    let unreachable = TransportController::new(
        strategies,
        StrategyContext {
            url: format!("ws://127.0.0.1:{port}"),
            token: None,
            request_timeout: Duration::from_millis(200),
        },
    )
    .with_retry(Duration::from_millis(1), 1);
    assert_eq!(unreachable.initialize().await, ConnectionState::Degraded);
    assert!(unreachable
        .wait_for_ready(Duration::from_millis(100))
        .await
        .is_err());
}

#[tokio::test]
async fn tick_with_absurd_precision_is_dropped_and_stream_continues() {
    init_tracing();
    let mock = UpstreamMock::spawn().await;
    let controller = controller(&mock);
    let coordinator =
        SubscriptionCoordinator::new(controller.clone()).with_digit_format(DigitFormat::Upstream);

    let (seen, listener) = recorder();
    let _handle = coordinator
        .initialize_tick_stream("R_25", 3, listener)
        .await
        .unwrap();
    assert!(eventually(WAIT, || seen.lock().unwrap().digits.len() == 4).await);

    let req_id = mock.received_with("ticks")[0]["req_id"].clone();
    let mut malformed = tick_reply("R_25", 1234.58, 1_700_000_101, Some(&req_id));
    malformed["tick"]["pip_size"] = serde_json::json!(70000);
    mock.push(malformed);
    mock.push(tick_reply("R_25", 1234.59, 1_700_000_102, Some(&req_id)));
    mock.push(tick_reply("R_25", 1234.51, 1_700_000_103, Some(&req_id)));

    assert!(eventually(WAIT, || seen.lock().unwrap().digits.len() == 6).await);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.digits[4..].to_vec(), vec![9, 1]);
    assert_eq!(seen.interrupted, 0);
    assert!(controller.is_connected());
}
