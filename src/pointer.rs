//! Tick pointer
//!
//! Consumer-side binding over the coordinator: tracks the current tick, a
//! bounded copy of the window and its digit statistics for one instrument,
//! and publishes every change through a `watch` channel. Failures end up in
//! the state, never as errors to the consumer.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::coordinator::{FeedEvent, SubscriptionCoordinator, TickStreamHandle};
use crate::history::{Tick, TickHistory};
use crate::instrument::Instrument;
use crate::stats::DigitStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerStatus {
    Idle,
    Loading,
    Live,
    Interrupted,
    Unavailable,
    Error,
}

/// What a consumer renders from
#[derive(Debug, Clone)]
pub struct PointerState {
    pub instrument: Option<Instrument>,
    pub current_tick: Option<Tick>,
    pub history: TickHistory,
    pub is_subscribed: bool,
    pub status: PointerStatus,
    pub error: Option<String>,
}

impl PointerState {
    fn new(capacity: usize) -> Self {
        Self {
            instrument: None,
            current_tick: None,
            history: TickHistory::new(capacity),
            is_subscribed: false,
            status: PointerStatus::Idle,
            error: None,
        }
    }

    pub fn tick_history(&self) -> Vec<Tick> {
        self.history.window()
    }

    pub fn digit_stats(&self) -> DigitStats {
        self.history.digit_stats()
    }

    pub fn hot_digits(&self, k: usize) -> Vec<u8> {
        self.digit_stats().hot_digits(k)
    }

    pub fn cold_digits(&self, k: usize) -> Vec<u8> {
        self.digit_stats().cold_digits(k)
    }

    fn apply(&mut self, event: &FeedEvent) {
        match event {
            FeedEvent::Snapshot { ticks, .. } => {
                self.history.load(ticks.iter().copied());
                self.current_tick = self.history.latest();
                self.status = PointerStatus::Live;
                self.error = None;
            }
            FeedEvent::Tick { tick, .. } => {
                self.history.append(*tick);
                self.current_tick = Some(*tick);
                self.status = PointerStatus::Live;
            }
            FeedEvent::Interrupted(e) => {
                self.status = PointerStatus::Interrupted;
                self.error = Some(e.to_string());
            }
            FeedEvent::Recovered => {
                self.status = PointerStatus::Live;
                self.error = None;
            }
            FeedEvent::Unavailable(e) => {
                self.status = PointerStatus::Unavailable;
                self.error = Some(e.to_string());
            }
        }
    }
}

/// Live view of one instrument for a single consumer
pub struct TickPointer {
    coordinator: SubscriptionCoordinator,
    backfill_count: u32,
    state: Arc<watch::Sender<PointerState>>,
    handle: Option<TickStreamHandle>,
}

impl TickPointer {
    pub fn new(coordinator: SubscriptionCoordinator, backfill_count: u32, capacity: usize) -> Self {
        let (state, _) = watch::channel(PointerState::new(capacity));
        Self {
            coordinator,
            backfill_count,
            state: Arc::new(state),
            handle: None,
        }
    }

    /// Point at `symbol`, replacing any previous subscription.
    ///
    /// A disabled pointer holds no subscription and reports `Idle`.
    pub async fn set_instrument(&mut self, symbol: &str, enabled: bool) {
        self.detach();

        if !enabled {
            return;
        }

        let instrument = match Instrument::parse(symbol) {
            Ok(instrument) => instrument,
            Err(e) => {
                warn!(symbol, error = %e, "Tick pointer rejected instrument");
                self.state.send_modify(|state| {
                    state.status = PointerStatus::Error;
                    state.error = Some(e.to_string());
                });
                return;
            }
        };

        self.state.send_modify(|state| {
            state.instrument = Some(instrument.clone());
            state.status = PointerStatus::Loading;
            state.error = None;
        });

        let sink = self.state.clone();
        let result = self
            .coordinator
            .initialize_tick_stream(instrument.symbol(), self.backfill_count, move |event| {
                sink.send_modify(|state| state.apply(event));
            })
            .await;

        match result {
            Ok(handle) => {
                info!(symbol = instrument.symbol(), "Tick pointer subscribed");
                self.handle = Some(handle);
                self.state.send_modify(|state| state.is_subscribed = true);
            }
            Err(e) => {
                warn!(symbol = instrument.symbol(), error = %e, "Tick pointer failed to subscribe");
                self.state.send_modify(|state| {
                    state.status = PointerStatus::Error;
                    state.error = Some(e.to_string());
                });
            }
        }
    }

    /// Release the subscription and reset to `Idle`
    pub fn detach(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unsubscribe();
        }
        self.state.send_modify(|state| {
            state.instrument = None;
            state.current_tick = None;
            state.history.clear();
            state.is_subscribed = false;
            state.status = PointerStatus::Idle;
            state.error = None;
        });
    }

    pub fn state(&self) -> PointerState {
        self.state.borrow().clone()
    }

    /// Receiver that wakes on every state change
    pub fn watch(&self) -> watch::Receiver<PointerState> {
        self.state.subscribe()
    }

    pub fn current_tick(&self) -> Option<Tick> {
        self.state.borrow().current_tick
    }

    pub fn tick_history(&self) -> Vec<Tick> {
        self.state.borrow().tick_history()
    }

    pub fn digit_stats(&self) -> DigitStats {
        self.state.borrow().digit_stats()
    }

    pub fn hot_digits(&self, k: usize) -> Vec<u8> {
        self.state.borrow().hot_digits(k)
    }

    pub fn cold_digits(&self, k: usize) -> Vec<u8> {
        self.state.borrow().cold_digits(k)
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.borrow().is_subscribed
    }
}
