//! Listener slots
//!
//! A slot wraps one registered callback. Delivery takes the slot's gate and
//! re-checks `active`, so once [`ListenerSlot::deactivate`] returns the
//! callback is never entered again, even for an event already in flight.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;

use super::FeedEvent;
use crate::sync::lock;

/// Callback receiving every event of one instrument feed
pub type TickListener = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

thread_local! {
    /// Slot whose callback is running on this thread, 0 when none
    static DELIVERING: Cell<u64> = const { Cell::new(0) };
}

pub(crate) struct ListenerSlot {
    id: u64,
    listener: TickListener,
    active: AtomicBool,
    gate: Mutex<()>,
}

impl ListenerSlot {
    pub(crate) fn new(id: u64, listener: TickListener) -> Self {
        Self {
            id,
            listener,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hold back deliveries until the returned guard is dropped
    pub(crate) fn hold(&self) -> MutexGuard<'_, ()> {
        lock(&self.gate)
    }

    /// Deliver while the caller already holds the gate
    pub(crate) fn deliver_held(&self, event: &FeedEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let previous = DELIVERING.with(|current| current.replace(self.id));
        if catch_unwind(AssertUnwindSafe(|| (self.listener)(event))).is_err() {
            error!(listener = self.id, "Tick listener panicked");
        }
        DELIVERING.with(|current| current.set(previous));
    }

    pub(crate) fn deliver(&self, event: &FeedEvent) {
        // A listener reacting to its own event is already inside the gate
        if DELIVERING.with(Cell::get) == self.id {
            return;
        }
        let _gate = self.hold();
        self.deliver_held(event);
    }

    /// Stop delivery, waiting out a callback running on another thread
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        if DELIVERING.with(Cell::get) != self.id {
            drop(self.hold());
        }
    }
}

/// Deliver one event to each slot in registration order
pub(crate) fn fan_out(slots: &[Arc<ListenerSlot>], event: &FeedEvent) {
    for slot in slots {
        slot.deliver(event);
    }
}
