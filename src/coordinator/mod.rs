//! Subscription coordinator
//!
//! Deduplicates tick streams per instrument: the first caller backfills the
//! history and opens the one upstream subscription, later callers attach to
//! the running feed and receive its current window as a snapshot. The last
//! listener to leave closes the upstream subscription and drops the history.

mod feed;
mod listener;

pub use feed::FeedStatus;
pub use listener::TickListener;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use self::feed::{Feed, Phase, Readiness};
use self::listener::{fan_out, ListenerSlot};
use crate::config::Config;
use crate::error::{Result, TickStreamError};
use crate::history::{DigitFormat, Tick, DEFAULT_CAPACITY};
use crate::instrument::Instrument;
use crate::metrics;
use crate::protocol::{self, ParsedMessage, TicksHistoryRequest, TicksRequest, MAX_HISTORY_COUNT};
use crate::stats::DigitStats;
use crate::sync::lock;
use crate::transport::{ChannelEvent, ChannelHandler, ChannelSubscription, Transport};

/// Event delivered to tick stream listeners
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Current window, delivered once on registration and after a restart
    Snapshot { ticks: Vec<Tick>, stats: DigitStats },
    /// A live tick with the statistics of the window it was appended to
    Tick { tick: Tick, stats: DigitStats },
    /// The live stream failed; one resubscription is under way
    Interrupted(TickStreamError),
    /// The stream is live again after an interruption
    Recovered,
    /// The stream is down and will not be retried automatically
    Unavailable(TickStreamError),
}

/// Summary of one feed for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct FeedSummary {
    pub symbol: String,
    pub status: FeedStatus,
    pub listeners: usize,
    pub ticks: usize,
}

struct Inner {
    transport: Arc<dyn Transport>,
    feeds: Mutex<HashMap<Instrument, Arc<Feed>>>,
    history_capacity: usize,
    digit_format: DigitFormat,
    backfill_timeout: Duration,
    next_slot_id: AtomicU64,
}

enum Role {
    Leader,
    Follower,
}

/// Shares one upstream tick stream per instrument among many listeners
#[derive(Clone)]
pub struct SubscriptionCoordinator {
    inner: Arc<Inner>,
}

impl SubscriptionCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                feeds: Mutex::new(HashMap::new()),
                history_capacity: DEFAULT_CAPACITY,
                digit_format: DigitFormat::default(),
                backfill_timeout: Duration::from_secs(15),
                next_slot_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self::new(transport)
            .with_history_capacity(config.history_capacity)
            .with_digit_format(config.digit_format())
            .with_backfill_timeout(config.request_timeout())
    }

    fn configure(mut self, apply: impl FnOnce(&mut Inner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => apply(inner),
            None => warn!("Coordinator already shared, ignoring configuration change"),
        }
        self
    }

    pub fn with_history_capacity(self, capacity: usize) -> Self {
        self.configure(|inner| inner.history_capacity = capacity.max(1))
    }

    pub fn with_digit_format(self, format: DigitFormat) -> Self {
        self.configure(|inner| inner.digit_format = format)
    }

    pub fn with_backfill_timeout(self, backfill_timeout: Duration) -> Self {
        self.configure(|inner| inner.backfill_timeout = backfill_timeout)
    }

    /// Register `on_event` for `symbol`, starting the feed if nobody else has.
    ///
    /// The listener first receives a [`FeedEvent::Snapshot`] of the current
    /// window, then every live tick in upstream order. The returned handle
    /// unregisters the listener when dropped.
    pub async fn initialize_tick_stream<F>(
        &self,
        symbol: &str,
        backfill_count: u32,
        on_event: F,
    ) -> Result<TickStreamHandle>
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let instrument = Instrument::parse(symbol)?;
        let count = backfill_count.min(MAX_HISTORY_COUNT);
        let listener: TickListener = Arc::new(on_event);

        loop {
            let (feed, role) = self.inner.acquire(&instrument);

            match role {
                Role::Leader => {
                    let mut guard = StartGuard {
                        inner: &self.inner,
                        feed: &feed,
                        armed: true,
                    };
                    let started = self.inner.start(&feed, count).await;
                    guard.armed = false;
                    if let Err(e) = started {
                        self.inner.fail_start(&feed, e.clone());
                        return Err(e);
                    }
                }
                Role::Follower => {
                    if !wait_ready(&feed).await? {
                        continue;
                    }
                }
            }

            if let Some(handle) = self.inner.attach(&feed, listener.clone()) {
                return Ok(handle);
            }
            debug!(symbol = instrument.symbol(), "Feed closed while attaching, retrying");
        }
    }

    /// Status of the feed for `instrument`, if one is running
    pub fn feed_status(&self, instrument: &Instrument) -> Option<FeedStatus> {
        let feed = lock(&self.inner.feeds).get(instrument).cloned()?;
        let phase = feed.state().phase;
        phase.status()
    }

    /// Current window and statistics of a running feed
    pub fn snapshot(&self, instrument: &Instrument) -> Option<(Vec<Tick>, DigitStats)> {
        let feed = lock(&self.inner.feeds).get(instrument).cloned()?;
        Some(feed.snapshot())
    }

    pub fn summaries(&self) -> Vec<FeedSummary> {
        let feeds: Vec<Arc<Feed>> = lock(&self.inner.feeds).values().cloned().collect();
        let mut summaries: Vec<FeedSummary> = feeds
            .iter()
            .filter_map(|feed| {
                let state = feed.state();
                Some(FeedSummary {
                    symbol: feed.symbol().to_string(),
                    status: state.phase.status()?,
                    listeners: state.slots.len(),
                    ticks: state.history.len(),
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        summaries
    }

    /// Close every upstream subscription and forget all feeds
    pub fn shutdown(&self) {
        let feeds: Vec<Arc<Feed>> = lock(&self.inner.feeds).drain().map(|(_, f)| f).collect();
        for feed in feeds {
            let upstream = {
                let mut state = feed.state();
                state.phase = Phase::Closed;
                state.upstream.take()
            };
            feed.ready.send_replace(Readiness::Closed);
            close_upstream(feed.symbol(), upstream);
        }
    }
}

/// Marks the feed failed if the leader is dropped before finishing
struct StartGuard<'a> {
    inner: &'a Arc<Inner>,
    feed: &'a Arc<Feed>,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(symbol = self.feed.symbol(), "Tick stream start cancelled");
            self.inner.fail_start(
                self.feed,
                TickStreamError::StreamInterrupted("stream start cancelled".to_string()),
            );
        }
    }
}

/// Wait for the leader's outcome; `false` means the feed went away
async fn wait_ready(feed: &Feed) -> Result<bool> {
    let mut rx = feed.ready.subscribe();
    loop {
        let readiness = rx.borrow_and_update().clone();
        match readiness {
            Readiness::Ready => return Ok(true),
            Readiness::Closed => return Ok(false),
            Readiness::Failed(e) => return Err(e),
            Readiness::Pending => {}
        }
        if rx.changed().await.is_err() {
            return Ok(false);
        }
    }
}

fn close_upstream(symbol: &str, upstream: Option<ChannelSubscription>) {
    if let Some(subscription) = upstream {
        info!(symbol, subscription_id = ?subscription.id(), "Closing upstream tick subscription");
        subscription.unsubscribe();
        metrics::upstream_closed();
    }
}

impl Inner {
    /// Find or create the feed for `instrument` and decide who starts it
    fn acquire(&self, instrument: &Instrument) -> (Arc<Feed>, Role) {
        let mut feeds = lock(&self.feeds);

        if let Some(feed) = feeds.get(instrument).cloned() {
            let mut state = feed.state();
            match state.phase {
                Phase::Closed => {}
                Phase::Unavailable => {
                    info!(symbol = instrument.symbol(), "Restarting unavailable tick stream");
                    state.phase = Phase::Backfilling;
                    feed.ready.send_replace(Readiness::Pending);
                    drop(state);
                    return (feed, Role::Leader);
                }
                _ => {
                    drop(state);
                    return (feed, Role::Follower);
                }
            }
        }

        let feed = Arc::new(Feed::new(instrument.clone(), self.history_capacity));
        feeds.insert(instrument.clone(), feed.clone());
        (feed, Role::Leader)
    }

    /// Backfill the history, then open the upstream subscription
    async fn start(self: &Arc<Self>, feed: &Arc<Feed>, count: u32) -> Result<()> {
        let backfill = if count == 0 {
            Vec::new()
        } else {
            self.backfill(feed.symbol(), count).await.map_err(|e| {
                TickStreamError::BackfillFailure {
                    symbol: feed.symbol().to_string(),
                    reason: e.to_string(),
                }
            })?
        };

        // History is complete before the first live tick can arrive
        let (generation, restarted) = {
            let mut state = feed.state();
            if state.phase == Phase::Closed {
                return Err(TickStreamError::StreamInterrupted(
                    "coordinator shut down".to_string(),
                ));
            }
            state.history.load(backfill);
            state.generation += 1;
            state.phase = Phase::Live;
            let restarted = (!state.slots.is_empty()).then(|| {
                (
                    state.slots.clone(),
                    FeedEvent::Snapshot {
                        ticks: state.history.window(),
                        stats: state.history.digit_stats(),
                    },
                )
            });
            (state.generation, restarted)
        };

        if let Some((slots, snapshot)) = restarted {
            fan_out(&slots, &snapshot);
            fan_out(&slots, &FeedEvent::Recovered);
        }

        let subscription = self.open_stream(feed, generation).await?;

        let stale = {
            let mut state = feed.state();
            if state.phase == Phase::Closed || state.generation != generation {
                Some(subscription)
            } else {
                state.upstream = Some(subscription);
                None
            }
        };
        close_upstream(feed.symbol(), stale);

        info!(symbol = feed.symbol(), generation, "Tick stream live");
        feed.ready.send_replace(Readiness::Ready);
        Ok(())
    }

    async fn backfill(&self, symbol: &str, count: u32) -> Result<Vec<Tick>> {
        info!(symbol, count, "Requesting tick history");
        metrics::record_backfill();

        let request = protocol::request(&TicksHistoryRequest::new(symbol, count))?;
        let response = timeout(self.backfill_timeout, self.transport.send(request))
            .await
            .map_err(|_| {
                TickStreamError::TransportTimeout(self.backfill_timeout.as_millis() as u64)
            })??;

        match ParsedMessage::from_value(&response)? {
            ParsedMessage::History(history) => {
                let ticks = history.into_ticks(self.digit_format);
                debug!(symbol, ticks = ticks.len(), "Tick history received");
                Ok(ticks)
            }
            ParsedMessage::Error(e) => Err(e.into()),
            other => Err(TickStreamError::Parse(format!(
                "unexpected response to ticks_history: {:?}",
                other
            ))),
        }
    }

    async fn open_stream(
        self: &Arc<Self>,
        feed: &Arc<Feed>,
        generation: u64,
    ) -> Result<ChannelSubscription> {
        let request = protocol::request(&TicksRequest::subscribe(feed.symbol()))?;

        let weak_inner: Weak<Inner> = Arc::downgrade(self);
        let weak_feed: Weak<Feed> = Arc::downgrade(feed);
        let handler: ChannelHandler = Arc::new(move |event| {
            let (Some(inner), Some(feed)) = (weak_inner.upgrade(), weak_feed.upgrade()) else {
                return;
            };
            inner.on_channel_event(&feed, generation, event);
        });

        let subscription = self.transport.subscribe(request, handler).await?;
        metrics::upstream_opened();
        Ok(subscription)
    }

    fn on_channel_event(self: &Arc<Self>, feed: &Arc<Feed>, generation: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(value) => match ParsedMessage::from_value(&value) {
                Ok(ParsedMessage::Tick(message)) => {
                    feed.push_tick(message.to_tick(self.digit_format), generation)
                }
                Ok(ParsedMessage::Error(e)) => self.on_stream_error(feed, generation, e.into()),
                Ok(other) => debug!(symbol = feed.symbol(), message = ?other, "Ignoring stream message"),
                Err(e) => warn!(symbol = feed.symbol(), error = %e, "Malformed stream message"),
            },
            ChannelEvent::Error(e) => self.on_stream_error(feed, generation, e),
        }
    }

    /// Notify listeners and make the single resubscription attempt
    fn on_stream_error(self: &Arc<Self>, feed: &Arc<Feed>, generation: u64, err: TickStreamError) {
        let (slots, upstream) = {
            let mut state = feed.state();
            if state.generation != generation || state.phase != Phase::Live {
                return;
            }
            state.phase = Phase::Interrupted;
            (state.slots.clone(), state.upstream.take())
        };

        warn!(symbol = feed.symbol(), error = %err, "Tick stream interrupted, resubscribing");
        metrics::record_interruption(feed.symbol());
        close_upstream(feed.symbol(), upstream);
        fan_out(&slots, &FeedEvent::Interrupted(err));

        let inner = self.clone();
        let feed = feed.clone();
        tokio::spawn(async move { inner.resubscribe(&feed).await });
    }

    async fn resubscribe(self: &Arc<Self>, feed: &Arc<Feed>) {
        let generation = {
            let mut state = feed.state();
            if state.phase != Phase::Interrupted {
                return;
            }
            state.generation += 1;
            state.generation
        };

        match self.open_stream(feed, generation).await {
            Ok(subscription) => {
                let (stale, recovered) = {
                    let mut state = feed.state();
                    if state.generation != generation || state.phase == Phase::Closed {
                        (Some(subscription), None)
                    } else {
                        state.upstream = Some(subscription);
                        // A tick may already have moved the feed back to Live
                        let recovered = (state.phase == Phase::Interrupted).then(|| {
                            state.phase = Phase::Live;
                            state.slots.clone()
                        });
                        (None, recovered)
                    }
                };
                close_upstream(feed.symbol(), stale);
                if let Some(slots) = recovered {
                    info!(symbol = feed.symbol(), "Tick stream recovered");
                    fan_out(&slots, &FeedEvent::Recovered);
                }
            }
            Err(e) => {
                let slots = {
                    let mut state = feed.state();
                    if state.generation != generation || state.phase != Phase::Interrupted {
                        return;
                    }
                    state.phase = Phase::Unavailable;
                    state.slots.clone()
                };
                error!(symbol = feed.symbol(), error = %e, "Resubscription failed, stream unavailable");
                fan_out(
                    &slots,
                    &FeedEvent::Unavailable(TickStreamError::StreamInterrupted(e.to_string())),
                );
            }
        }
    }

    /// Undo a failed start without leaking state into the shared map
    fn fail_start(&self, feed: &Arc<Feed>, err: TickStreamError) {
        warn!(symbol = feed.symbol(), error = %err, "Tick stream start failed");

        let (upstream, slots) = {
            let mut state = feed.state();
            if state.phase == Phase::Closed {
                (None, Vec::new())
            } else if state.slots.is_empty() {
                state.phase = Phase::Closed;
                state.history.clear();
                (state.upstream.take(), Vec::new())
            } else {
                state.phase = Phase::Unavailable;
                (state.upstream.take(), state.slots.clone())
            }
        };

        if slots.is_empty() {
            self.remove(feed);
        }
        close_upstream(feed.symbol(), upstream);
        feed.ready.send_replace(Readiness::Failed(err.clone()));
        fan_out(&slots, &FeedEvent::Unavailable(err));
    }

    /// Register a listener slot and hand it the current snapshot
    fn attach(self: &Arc<Self>, feed: &Arc<Feed>, listener: TickListener) -> Option<TickStreamHandle> {
        let slot = Arc::new(ListenerSlot::new(
            self.next_slot_id.fetch_add(1, Ordering::Relaxed),
            listener,
        ));

        // Live ticks wait on the gate until the snapshot is delivered
        let gate = slot.hold();
        let (snapshot, unavailable) = {
            let mut state = feed.state();
            if matches!(state.phase, Phase::Backfilling | Phase::Closed) {
                return None;
            }
            state.slots.push(slot.clone());
            (
                FeedEvent::Snapshot {
                    ticks: state.history.window(),
                    stats: state.history.digit_stats(),
                },
                state.phase == Phase::Unavailable,
            )
        };

        debug!(symbol = feed.symbol(), listener = slot.id(), "Listener attached");
        slot.deliver_held(&snapshot);
        if unavailable {
            slot.deliver_held(&FeedEvent::Unavailable(TickStreamError::StreamInterrupted(
                "stream unavailable".to_string(),
            )));
        }
        drop(gate);

        Some(TickStreamHandle {
            inner: self.clone(),
            feed: feed.clone(),
            slot,
            released: false,
        })
    }

    /// Drop a listener; the last one out tears the feed down
    fn detach(&self, feed: &Arc<Feed>, slot: &ListenerSlot) {
        slot.deactivate();

        let upstream = {
            let mut state = feed.state();
            state.slots.retain(|s| s.id() != slot.id());
            // A restarting leader attaches itself once the backfill lands
            if !state.slots.is_empty() || matches!(state.phase, Phase::Closed | Phase::Backfilling) {
                debug!(symbol = feed.symbol(), listener = slot.id(), "Listener detached");
                return;
            }
            state.phase = Phase::Closed;
            state.history.clear();
            state.upstream.take()
        };

        info!(symbol = feed.symbol(), "Last listener left, closing tick stream");
        self.remove(feed);
        feed.ready.send_replace(Readiness::Closed);
        close_upstream(feed.symbol(), upstream);
    }

    fn remove(&self, feed: &Arc<Feed>) {
        let mut feeds = lock(&self.feeds);
        if feeds
            .get(&feed.instrument)
            .is_some_and(|current| Arc::ptr_eq(current, feed))
        {
            feeds.remove(&feed.instrument);
        }
    }
}

/// Registration of one listener on an instrument feed.
///
/// Dropping the handle unregisters the listener; no callback runs after
/// [`unsubscribe`](Self::unsubscribe) returns.
pub struct TickStreamHandle {
    inner: Arc<Inner>,
    feed: Arc<Feed>,
    slot: Arc<ListenerSlot>,
    released: bool,
}

impl TickStreamHandle {
    pub fn instrument(&self) -> &Instrument {
        &self.feed.instrument
    }

    /// Current window and statistics of the shared feed
    pub fn snapshot(&self) -> (Vec<Tick>, DigitStats) {
        self.feed.snapshot()
    }

    pub fn status(&self) -> Option<FeedStatus> {
        let phase = self.feed.state().phase;
        phase.status()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.detach(&self.feed, &self.slot);
        }
    }
}

impl Drop for TickStreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for TickStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickStreamHandle")
            .field("instrument", &self.feed.instrument)
            .field("listener", &self.slot.id())
            .finish()
    }
}
