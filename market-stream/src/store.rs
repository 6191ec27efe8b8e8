//! Shared client-side market data store.
//!
//! The connection layer and the dispatcher write into a [`MarketDataStore`]; any number of
//! consumers (UI panels, the monitor binary) read from it through a cloned [`SharedStore`]
//! handle. Writes bump a revision counter so readers can cheaply detect changes.

use crate::types::{OhlcvBar, Quote, Symbol};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Fallback text when the backend sends an `error` frame without a message.
pub const DEFAULT_FEED_ERROR: &str = "Unknown error from market data feed";

/// Classification of a store-visible fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum FaultKind {
    /// Backend absent or retry budget exhausted; the UI shows a calm offline state
    #[display("backend unavailable")]
    BackendUnavailable,
    /// Socket failed and will not be retried automatically
    #[display("connection error")]
    Connection,
    /// The backend reported an error over an otherwise healthy connection
    #[display("feed error")]
    Feed,
}

/// User-legible fault recorded on the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamFault {
    pub kind: FaultKind,
    pub message: String,
}

impl StreamFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(FaultKind::BackendUnavailable, message)
    }

    pub fn is_backend_unavailable(&self) -> bool {
        self.kind == FaultKind::BackendUnavailable
    }
}

/// Connection flags shown to consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub reconnecting: bool,
    /// Frontend-only mode: no automatic attempts until an explicit retry
    pub degraded: bool,
    pub reconnect_attempt: u32,
    pub last_error: Option<StreamFault>,
    /// Arrival time of the most recent well-formed frame
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Market data shared between the stream client and its consumers.
#[derive(Debug, Clone, Default)]
pub struct MarketDataStore {
    quotes: FnvHashMap<Symbol, Quote>,
    latest_bars: FnvHashMap<Symbol, OhlcvBar>,
    subscriptions: BTreeSet<Symbol>,
    status: ConnectionStatus,
    revision: u64,
}

impl MarketDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quote(&self, symbol: &str) -> Option<&Quote> {
        self.quotes.get(symbol)
    }

    pub fn quotes(&self) -> impl Iterator<Item = &Quote> {
        self.quotes.values()
    }

    pub fn latest_bar(&self, symbol: &str) -> Option<&OhlcvBar> {
        self.latest_bars.get(symbol)
    }

    pub fn subscriptions(&self) -> &BTreeSet<Symbol> {
        &self.subscriptions
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Monotonic counter bumped on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Insert or replace the quote for `quote.symbol` (latest wins).
    pub fn upsert_quote(&mut self, quote: Quote) {
        self.quotes.insert(quote.symbol.clone(), quote);
        self.touch();
    }

    /// Replace the latest bar for `bar.symbol`.
    pub fn set_latest_bar(&mut self, bar: OhlcvBar) {
        self.latest_bars.insert(bar.symbol.clone(), bar);
        self.touch();
    }

    /// Add symbols to the subscription set, returning those that were not already present.
    pub fn add_subscriptions<I, S>(&mut self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let added: Vec<Symbol> = symbols
            .into_iter()
            .map(Into::into)
            .filter(|symbol: &Symbol| !symbol.is_empty())
            .filter(|symbol| self.subscriptions.insert(symbol.clone()))
            .collect();
        if !added.is_empty() {
            self.touch();
        }
        added
    }

    /// Remove symbols from the subscription set, returning those that were present.
    pub fn remove_subscriptions<I, S>(&mut self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let removed: Vec<Symbol> = symbols
            .into_iter()
            .map(Into::into)
            .filter(|symbol: &Symbol| self.subscriptions.remove(symbol))
            .collect();
        if !removed.is_empty() {
            self.touch();
        }
        removed
    }

    pub fn mark_message_received(&mut self, at: DateTime<Utc>) {
        self.status.last_message_at = Some(at);
        self.touch();
    }

    pub fn set_error(&mut self, fault: StreamFault) {
        self.status.last_error = Some(fault);
        self.touch();
    }

    pub fn clear_error(&mut self) {
        if self.status.last_error.take().is_some() {
            self.touch();
        }
    }

    pub fn mark_connected(&mut self) {
        self.status.connected = true;
        self.status.reconnecting = false;
        self.status.degraded = false;
        self.status.reconnect_attempt = 0;
        self.status.last_error = None;
        self.touch();
    }

    pub fn mark_connecting(&mut self) {
        self.status.connected = false;
        self.touch();
    }

    pub fn mark_reconnecting(&mut self, attempt: u32) {
        self.status.connected = false;
        self.status.reconnecting = true;
        self.status.reconnect_attempt = attempt;
        self.touch();
    }

    pub fn mark_degraded(&mut self, fault: StreamFault) {
        self.status.connected = false;
        self.status.reconnecting = false;
        self.status.degraded = true;
        self.status.last_error = Some(fault);
        self.touch();
    }

    /// Clear the degraded flag ahead of an explicit retry.
    pub fn clear_degraded(&mut self) {
        self.status.degraded = false;
        self.status.reconnect_attempt = 0;
        if self
            .status
            .last_error
            .as_ref()
            .is_some_and(StreamFault::is_backend_unavailable)
        {
            self.status.last_error = None;
        }
        self.touch();
    }

    /// Reset connection flags after a manual disconnect. Market data is kept.
    pub fn reset_connection_status(&mut self) {
        self.status = ConnectionStatus {
            last_message_at: self.status.last_message_at,
            ..ConnectionStatus::default()
        };
        self.touch();
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

/// Cloneable handle to a [`MarketDataStore`] shared across tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedStore(Arc<RwLock<MarketDataStore>>);

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with read access.
    pub fn read<R>(&self, f: impl FnOnce(&MarketDataStore) -> R) -> R {
        f(&*self.0.read())
    }

    /// Run `f` with write access.
    pub fn write<R>(&self, f: impl FnOnce(&mut MarketDataStore) -> R) -> R {
        f(&mut *self.0.write())
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.read(|store| store.quote(symbol).cloned())
    }

    pub fn latest_bar(&self, symbol: &str) -> Option<OhlcvBar> {
        self.read(|store| store.latest_bar(symbol).cloned())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.read(|store| store.status().clone())
    }

    pub fn subscriptions(&self) -> Vec<Symbol> {
        self.read(|store| store.subscriptions().iter().cloned().collect())
    }

    pub fn revision(&self) -> u64 {
        self.read(MarketDataStore::revision)
    }

    /// Point-in-time copy of the whole store.
    pub fn snapshot(&self) -> MarketDataStore {
        self.read(MarketDataStore::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(symbol: &str, last: f64) -> Quote {
        Quote {
            symbol: Symbol::new(symbol),
            bid: None,
            ask: None,
            last,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            change: None,
            change_percent: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_quote_latest_wins() {
        let mut store = MarketDataStore::new();
        store.upsert_quote(quote("SPY", 450.0));
        store.upsert_quote(quote("QQQ", 390.0));
        store.upsert_quote(quote("SPY", 451.5));

        assert_eq!(store.quote("SPY").unwrap().last, 451.5);
        assert_eq!(store.quote("QQQ").unwrap().last, 390.0);
        assert_eq!(store.quotes().count(), 2);
        assert_eq!(store.revision(), 3);
    }

    #[test]
    fn test_subscription_set_is_idempotent() {
        let mut store = MarketDataStore::new();
        assert_eq!(store.add_subscriptions(["SPY", "QQQ"]).len(), 2);
        assert!(store.add_subscriptions(["SPY"]).is_empty());
        let revision = store.revision();

        assert_eq!(store.remove_subscriptions(["SPY"]), vec![Symbol::new("SPY")]);
        let after_first: Vec<_> = store.subscriptions().iter().cloned().collect();
        assert!(store.remove_subscriptions(["SPY"]).is_empty());
        let after_second: Vec<_> = store.subscriptions().iter().cloned().collect();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second, vec![Symbol::new("QQQ")]);
        // Only the effective removal bumped the revision
        assert_eq!(store.revision(), revision + 1);
    }

    #[test]
    fn test_empty_symbols_are_not_subscribed() {
        let mut store = MarketDataStore::new();
        assert!(store.add_subscriptions([""]).is_empty());
        assert!(store.subscriptions().is_empty());
    }

    #[test]
    fn test_status_lifecycle() {
        let mut store = MarketDataStore::new();

        store.mark_reconnecting(2);
        assert!(store.status().reconnecting);
        assert_eq!(store.status().reconnect_attempt, 2);
        assert!(store.status().last_error.is_none());

        store.mark_degraded(StreamFault::backend_unavailable("offline"));
        assert!(store.status().degraded);
        assert!(!store.status().reconnecting);
        assert_eq!(
            store.status().last_error.as_ref().unwrap().kind,
            FaultKind::BackendUnavailable
        );

        store.clear_degraded();
        assert!(!store.status().degraded);
        assert!(store.status().last_error.is_none());

        store.mark_connected();
        assert!(store.status().connected);
        assert_eq!(store.status().reconnect_attempt, 0);
    }

    #[test]
    fn test_clear_degraded_keeps_feed_errors() {
        let mut store = MarketDataStore::new();
        store.set_error(StreamFault::new(FaultKind::Feed, "rate limited"));
        store.clear_degraded();
        assert_eq!(
            store.status().last_error,
            Some(StreamFault::new(FaultKind::Feed, "rate limited"))
        );
    }

    #[test]
    fn test_reset_connection_status_keeps_market_data() {
        let mut store = MarketDataStore::new();
        store.upsert_quote(quote("SPY", 450.0));
        store.add_subscriptions(["SPY"]);
        let received = Utc::now();
        store.mark_message_received(received);
        store.mark_connected();

        store.reset_connection_status();

        assert!(!store.status().connected);
        assert_eq!(store.status().last_message_at, Some(received));
        assert!(store.quote("SPY").is_some());
        assert_eq!(store.subscriptions().len(), 1);
    }

    #[test]
    fn test_shared_store_handles_see_same_state() {
        let store = SharedStore::new();
        let reader = store.clone();

        store.write(|store| store.upsert_quote(quote("SPY", 450.25)));

        assert_eq!(reader.quote("SPY").unwrap().last, 450.25);
        assert_eq!(reader.revision(), 1);
        assert!(reader.quote("QQQ").is_none());
    }

    #[test]
    fn test_fault_kind_display() {
        assert_eq!(FaultKind::BackendUnavailable.to_string(), "backend unavailable");
        assert_eq!(FaultKind::Feed.to_string(), "feed error");
    }
}
