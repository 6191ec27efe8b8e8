use crate::config::StreamConfig;
use crate::connection::ConnectionManager;
use crate::probe::AvailabilityCache;
use crate::store::SharedStore;
use crate::types::Symbol;
use std::sync::Arc;
use tracing::debug;

/// UI-facing facade over a [`ConnectionManager`] and its store.
///
/// `subscribe` / `unsubscribe` are the only writers of the store's subscription set. Symbols are
/// recorded first and then forwarded to the feed if the socket is open; while it is not, the
/// manager replays the whole set on the next successful open.
#[derive(Debug)]
pub struct MarketFeed {
    manager: ConnectionManager,
}

impl MarketFeed {
    /// Create a feed with a fresh manager and a private availability cache. Must be called
    /// inside a tokio runtime.
    pub fn new(config: StreamConfig, store: SharedStore) -> Self {
        Self::from_manager(ConnectionManager::new(config, store))
    }

    /// Create a feed whose manager shares `cache` with other feeds.
    pub fn with_cache(
        config: StreamConfig,
        store: SharedStore,
        cache: Arc<AvailabilityCache>,
    ) -> Self {
        Self::from_manager(ConnectionManager::with_cache(config, store, cache))
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn store(&self) -> &SharedStore {
        self.manager.store()
    }

    /// Add `symbols` to the subscription set, returning the ones that were not already present.
    pub fn subscribe<I, S>(&self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let added = self
            .store()
            .write(|store| store.add_subscriptions(symbols));

        if !added.is_empty() && !self.manager.subscribe_symbols(added.iter().cloned()) {
            debug!(symbols = ?added, "subscription queued until the stream opens");
        }
        added
    }

    /// Remove `symbols` from the subscription set, returning the ones that were present.
    /// Removing an absent symbol is a no-op.
    pub fn unsubscribe<I, S>(&self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let removed = self
            .store()
            .write(|store| store.remove_subscriptions(symbols));

        if !removed.is_empty() && !self.manager.unsubscribe_symbols(removed.iter().cloned()) {
            debug!(symbols = ?removed, "unsubscribe recorded while the stream is not open");
        }
        removed
    }

    /// Current subscription set, in symbol order.
    pub fn subscriptions(&self) -> Vec<Symbol> {
        self.store().subscriptions()
    }
}
