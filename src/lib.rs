//! Tick Analysis - live tick streams and last-digit statistics
//!
//! This crate connects to a synthetic-index market-data WebSocket, shares one
//! upstream tick stream per instrument among any number of listeners, and
//! derives per-digit frequency and hot/cold rankings over a bounded window.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod instrument;
pub mod metrics;
pub mod pointer;
pub mod protocol;
pub mod stats;
pub mod transport;

mod sync;

pub use config::Config;
pub use coordinator::{FeedEvent, FeedStatus, FeedSummary, SubscriptionCoordinator, TickStreamHandle};
pub use error::{Result, TickStreamError};
pub use history::{DigitFormat, Tick, TickHistory};
pub use instrument::Instrument;
pub use pointer::{PointerState, PointerStatus, TickPointer};
pub use stats::{ContractPattern, DigitStats, PatternSplit};
pub use transport::{
    ConnectionState, ConnectionStats, SocketStrategy, Transport, TransportController,
};
