//! Inbound frame dispatch.
//!
//! Every text frame from the socket goes through [`MessageDispatcher::handle`], which parses
//! the `{type, timestamp, data}` envelope and routes it to a typed handler writing into the
//! [`SharedStore`]. Nothing here can fail outwards: malformed frames, unknown types and partial
//! payloads are logged and dropped.

use crate::store::{DEFAULT_FEED_ERROR, FaultKind, SharedStore, StreamFault};
use crate::types::{
    BarData, ErrorData, MessageKind, OhlcvBar, Quote, QuoteData, Symbol, WireMessage,
};
use chrono::Utc;
use tracing::{debug, warn};

/// What [`MessageDispatcher::handle`] did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Quote(Symbol),
    Bar(Symbol),
    Heartbeat,
    FeedError(String),
    /// Valid envelope whose type has no handler (`position`, `order`, unknown kinds)
    Unhandled(String),
    /// Envelope or payload could not be used
    Dropped,
}

/// Routes inbound frames into the market data store.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    store: SharedStore,
}

impl MessageDispatcher {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Parse and route one raw text frame.
    pub fn handle(&self, raw: &str) -> Dispatched {
        let message = match serde_json::from_str::<WireMessage>(raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping malformed market data frame");
                debug!("Raw frame: {}", &raw[..floor_char_boundary(raw, 200)]);
                return Dispatched::Dropped;
            }
        };

        self.dispatch(message)
    }

    /// Route an already parsed envelope.
    pub fn dispatch(&self, message: WireMessage) -> Dispatched {
        let received_at = Utc::now();

        match message.message_kind() {
            MessageKind::Quote => {
                let timestamp = message.parsed_timestamp().unwrap_or(received_at);
                let quote = serde_json::from_value::<QuoteData>(message.data)
                    .ok()
                    .and_then(|data| Quote::from_wire(data, timestamp));

                match quote {
                    Some(quote) => {
                        let symbol = quote.symbol.clone();
                        self.store.write(|store| {
                            store.upsert_quote(quote);
                            store.mark_message_received(received_at);
                        });
                        Dispatched::Quote(symbol)
                    }
                    None => {
                        warn!("dropping quote without symbol or last price");
                        Dispatched::Dropped
                    }
                }
            }
            MessageKind::Bar => {
                let bar = serde_json::from_value::<BarData>(message.data)
                    .ok()
                    .and_then(OhlcvBar::from_wire);

                match bar {
                    Some(bar) => {
                        let symbol = bar.symbol.clone();
                        self.store.write(|store| {
                            store.set_latest_bar(bar);
                            store.mark_message_received(received_at);
                        });
                        Dispatched::Bar(symbol)
                    }
                    None => {
                        warn!("dropping bar with missing fields");
                        Dispatched::Dropped
                    }
                }
            }
            MessageKind::Heartbeat => {
                self.store
                    .write(|store| store.mark_message_received(received_at));
                Dispatched::Heartbeat
            }
            MessageKind::Error => {
                let text = serde_json::from_value::<ErrorData>(message.data)
                    .ok()
                    .and_then(|data| data.message)
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FEED_ERROR.to_string());

                warn!(message = %text, "market data feed reported an error");
                self.store.write(|store| {
                    store.set_error(StreamFault::new(FaultKind::Feed, text.clone()));
                    store.mark_message_received(received_at);
                });
                Dispatched::FeedError(text)
            }
            MessageKind::Position | MessageKind::Order | MessageKind::Unknown => {
                debug!(kind = %message.kind, "unhandled market data message type");
                Dispatched::Unhandled(message.kind)
            }
        }
    }
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    (0..=max)
        .rev()
        .find(|index| text.is_char_boundary(*index))
        .unwrap_or(0)
}
