//! Prometheus metrics
//!
//! Collectors live in the default registry and are created on first use, so
//! `prometheus::gather()` in the HTTP handler sees everything recorded here.

use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};
use std::sync::OnceLock;
use tracing::warn;

use crate::transport::ConnectionState;

fn register<M: Collector + Clone + 'static>(metric: prometheus::Result<M>) -> Option<M> {
    let registered =
        metric.and_then(|m| prometheus::register(Box::new(m.clone())).map(|_| m));
    match registered {
        Ok(metric) => Some(metric),
        Err(e) => {
            warn!(error = %e, "Failed to register metric");
            None
        }
    }
}

fn ticks_received() -> Option<&'static IntCounterVec> {
    static METRIC: OnceLock<Option<IntCounterVec>> = OnceLock::new();
    METRIC
        .get_or_init(|| {
            register(IntCounterVec::new(
                Opts::new("ticks_received_total", "Live ticks received per instrument"),
                &["symbol"],
            ))
        })
        .as_ref()
}

fn backfill_requests() -> Option<&'static IntCounter> {
    static METRIC: OnceLock<Option<IntCounter>> = OnceLock::new();
    METRIC
        .get_or_init(|| {
            register(IntCounter::new(
                "backfill_requests_total",
                "History backfill requests issued upstream",
            ))
        })
        .as_ref()
}

fn upstream_subscriptions() -> Option<&'static IntGauge> {
    static METRIC: OnceLock<Option<IntGauge>> = OnceLock::new();
    METRIC
        .get_or_init(|| {
            register(IntGauge::new(
                "upstream_subscriptions_active",
                "Open upstream tick subscriptions",
            ))
        })
        .as_ref()
}

fn stream_interruptions() -> Option<&'static IntCounterVec> {
    static METRIC: OnceLock<Option<IntCounterVec>> = OnceLock::new();
    METRIC
        .get_or_init(|| {
            register(IntCounterVec::new(
                Opts::new("stream_interruptions_total", "Live stream failures per instrument"),
                &["symbol"],
            ))
        })
        .as_ref()
}

fn transport_state() -> Option<&'static IntGauge> {
    static METRIC: OnceLock<Option<IntGauge>> = OnceLock::new();
    METRIC
        .get_or_init(|| {
            register(IntGauge::new(
                "transport_state",
                "0 uninitialized, 1 initializing, 2 ready, 3 degraded",
            ))
        })
        .as_ref()
}

pub fn record_tick(symbol: &str) {
    if let Some(metric) = ticks_received() {
        metric.with_label_values(&[symbol]).inc();
    }
}

pub fn record_backfill() {
    if let Some(metric) = backfill_requests() {
        metric.inc();
    }
}

pub fn upstream_opened() {
    if let Some(metric) = upstream_subscriptions() {
        metric.inc();
    }
}

pub fn upstream_closed() {
    if let Some(metric) = upstream_subscriptions() {
        metric.dec();
    }
}

pub fn record_interruption(symbol: &str) {
    if let Some(metric) = stream_interruptions() {
        metric.with_label_values(&[symbol]).inc();
    }
}

pub fn record_transport_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Uninitialized => 0,
        ConnectionState::Initializing => 1,
        ConnectionState::Ready => 2,
        ConnectionState::Degraded => 3,
    };
    if let Some(metric) = transport_state() {
        metric.set(value);
    }
}

/// Render the default registry in the text exposition format
pub fn render() -> Result<String, String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
