//! Per-instrument feed state
//!
//! One feed owns the tick history, the listener slots and the upstream
//! subscription of an instrument. Everything is behind a single mutex that is
//! never held across an await or while a listener runs.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::listener::ListenerSlot;
use super::FeedEvent;
use crate::error::TickStreamError;
use crate::history::{Tick, TickHistory};
use crate::instrument::Instrument;
use crate::metrics;
use crate::stats::DigitStats;
use crate::sync::lock;
use crate::transport::ChannelSubscription;

/// Externally visible state of an instrument feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Backfilling,
    Live,
    Interrupted,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Backfilling,
    Live,
    Interrupted,
    Unavailable,
    /// Torn down; the feed is out of the map or about to be
    Closed,
}

impl Phase {
    pub(crate) fn status(self) -> Option<FeedStatus> {
        match self {
            Phase::Backfilling => Some(FeedStatus::Backfilling),
            Phase::Live => Some(FeedStatus::Live),
            Phase::Interrupted => Some(FeedStatus::Interrupted),
            Phase::Unavailable => Some(FeedStatus::Unavailable),
            Phase::Closed => None,
        }
    }

    fn accepts_ticks(self) -> bool {
        matches!(self, Phase::Live | Phase::Interrupted)
    }
}

/// Outcome of a feed start, observed by callers waiting on the leader
#[derive(Debug, Clone)]
pub(crate) enum Readiness {
    Pending,
    Ready,
    Failed(TickStreamError),
    Closed,
}

pub(crate) struct FeedState {
    pub(crate) phase: Phase,
    pub(crate) history: TickHistory,
    pub(crate) slots: Vec<Arc<ListenerSlot>>,
    pub(crate) upstream: Option<ChannelSubscription>,
    /// Bumped per upstream subscription; events of older ones are ignored
    pub(crate) generation: u64,
}

pub(crate) struct Feed {
    pub(crate) instrument: Instrument,
    state: Mutex<FeedState>,
    pub(crate) ready: watch::Sender<Readiness>,
}

impl Feed {
    pub(crate) fn new(instrument: Instrument, capacity: usize) -> Self {
        let (ready, _) = watch::channel(Readiness::Pending);
        Self {
            instrument,
            state: Mutex::new(FeedState {
                phase: Phase::Backfilling,
                history: TickHistory::new(capacity),
                slots: Vec::new(),
                upstream: None,
                generation: 0,
            }),
            ready,
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FeedState> {
        lock(&self.state)
    }

    pub(crate) fn symbol(&self) -> &str {
        self.instrument.symbol()
    }

    /// Append a live tick and fan it out; ticks of stale subscriptions are dropped
    pub(crate) fn push_tick(&self, tick: Tick, generation: u64) {
        let (slots, recovered, stats) = {
            let mut state = self.state();
            if state.generation != generation || !state.phase.accepts_ticks() {
                return;
            }
            let recovered = state.phase == Phase::Interrupted;
            state.phase = Phase::Live;
            state.history.append(tick);
            (state.slots.clone(), recovered, state.history.digit_stats())
        };

        metrics::record_tick(self.symbol());
        if recovered {
            super::listener::fan_out(&slots, &FeedEvent::Recovered);
        }
        super::listener::fan_out(&slots, &FeedEvent::Tick { tick, stats });
    }

    /// Point-in-time copy of the window and its statistics
    pub(crate) fn snapshot(&self) -> (Vec<Tick>, DigitStats) {
        let state = self.state();
        (state.history.window(), state.history.digit_stats())
    }
}
