//! # market-stream
//! Resilient client for a real-time quote and bar feed delivered as JSON over WebSocket.
//!
//! The crate keeps one socket alive per [`ConnectionManager`]: it optionally probes the backend's
//! `/health` endpoint before connecting, reconnects with capped exponential backoff plus jitter,
//! and falls back to a calm degraded mode once the backend is known to be absent. Inbound frames
//! are routed by the [`MessageDispatcher`] into a [`SharedStore`] that any number of readers can
//! snapshot.
//!
//! ## Example
//! ```rust,no_run
//! use market_stream::{ConnectionState, MarketFeed, SharedStore, StreamConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StreamConfig::new("ws://127.0.0.1:8000/ws");
//!     let feed = MarketFeed::new(config, SharedStore::new());
//!     feed.subscribe(["SPY", "QQQ"]);
//!
//!     feed.manager()
//!         .wait_for(|state| matches!(state, ConnectionState::Open | ConnectionState::Degraded))
//!         .await;
//!
//!     if let Some(quote) = feed.store().quote("SPY") {
//!         println!("SPY last {}", quote.last);
//!     }
//!
//!     feed.manager().disconnect().await;
//! }
//! ```

/// Stream configuration, defaults and environment overlay.
pub mod config;

/// Connection lifecycle: state machine, socket task and manager.
pub mod connection;

/// Routes inbound frames into the store.
pub mod dispatcher;

/// All [`Error`](std::error::Error)s generated in market-stream.
pub mod error;

/// UI-facing subscribe/unsubscribe facade.
pub mod feed;

/// Backend availability probe and its verdict cache.
pub mod probe;

/// Reconnect backoff computation.
pub mod reconnect;

/// Shared market data store.
pub mod store;

/// Wire envelope, payloads and normalised market data types.
pub mod types;

pub use config::{StreamConfig, StreamOptions};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{Dispatched, MessageDispatcher};
pub use error::{ConfigError, StreamError};
pub use feed::MarketFeed;
pub use probe::{AvailabilityCache, BackendProbe};
pub use reconnect::ReconnectPolicy;
pub use store::{ConnectionStatus, FaultKind, MarketDataStore, SharedStore, StreamFault};
pub use types::{ControlFrame, OhlcvBar, Quote, Symbol, WireMessage};
