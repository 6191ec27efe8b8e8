/// Wire contract and market data types
///
/// These types match the JSON frames exchanged with the streaming backend:
/// inbound `{type, timestamp, data}` envelopes and outbound control frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

/// Ticker symbol, e.g. "SPY".
pub type Symbol = SmolStr;

/// Inbound message envelope from the streaming backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireMessage {
    /// Message type: "quote", "bar", "position", "order", "error", "heartbeat"
    #[serde(rename = "type")]
    pub kind: String,
    /// ISO8601 time the backend produced the message
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Type-specific payload (deserialize based on `kind`)
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WireMessage {
    /// Classify the `type` field.
    pub fn message_kind(&self) -> MessageKind {
        MessageKind::parse(&self.kind)
    }

    /// Envelope timestamp, if present and valid RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|time| time.with_timezone(&Utc))
    }
}

/// Known inbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Quote,
    Bar,
    Position,
    Order,
    Error,
    Heartbeat,
    Unknown,
}

impl MessageKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "quote" => MessageKind::Quote,
            "bar" => MessageKind::Bar,
            "position" => MessageKind::Position,
            "order" => MessageKind::Order,
            "error" => MessageKind::Error,
            "heartbeat" => MessageKind::Heartbeat,
            _ => MessageKind::Unknown,
        }
    }
}

/// `quote` payload as sent on the wire. Every price field is optional here so that a partial
/// quote can still be inspected; [`Quote::from_wire`] decides what is required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteData {
    #[serde(default)]
    pub symbol: Option<Symbol>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub bid: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub ask: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub last: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub open: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub high: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub low: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub close: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub change: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub change_percent: Option<f64>,
}

/// `bar` payload as sent on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BarData {
    #[serde(default)]
    pub symbol: Option<Symbol>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub time: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub open: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub high: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub low: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub close: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub volume: Option<f64>,
}

/// `error` payload as sent on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub message: Option<String>,
}

/// Latest quote for a symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: Symbol,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// Last traded price
    pub last: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    /// Signed change versus previous close
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Normalise a wire payload. Returns `None` when `symbol` or `last` is missing.
    pub fn from_wire(data: QuoteData, timestamp: DateTime<Utc>) -> Option<Self> {
        let symbol = data.symbol.filter(|symbol| !symbol.is_empty())?;
        let last = data.last?;

        Some(Self {
            symbol,
            bid: data.bid,
            ask: data.ask,
            last,
            open: data.open,
            high: data.high,
            low: data.low,
            close: data.close,
            volume: data.volume,
            change: data.change,
            change_percent: data.change_percent,
            timestamp,
        })
    }

    /// Calculate the bid-ask spread
    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Calculate the mid price
    pub fn mid_price(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }
}

/// Most recent OHLCV bar for a symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OhlcvBar {
    pub symbol: Symbol,
    /// Bar open time, epoch seconds as sent by the backend
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

impl OhlcvBar {
    /// Normalise a wire payload. Returns `None` when any required field is missing.
    pub fn from_wire(data: BarData) -> Option<Self> {
        Some(Self {
            symbol: data.symbol.filter(|symbol| !symbol.is_empty())?,
            time: data.time? as i64,
            open: data.open?,
            high: data.high?,
            low: data.low?,
            close: data.close?,
            volume: data.volume,
        })
    }
}

/// Outbound control frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Subscribe { symbols: Vec<Symbol> },
    Unsubscribe { symbols: Vec<Symbol> },
    Ping,
}

/// Accept a JSON number, a numeric string, or null/absent.
fn de_flexible_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(number)) => number.as_f64(),
        Some(serde_json::Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|value| value.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind_parse() {
        assert_eq!(MessageKind::parse("quote"), MessageKind::Quote);
        assert_eq!(MessageKind::parse("bar"), MessageKind::Bar);
        assert_eq!(MessageKind::parse("heartbeat"), MessageKind::Heartbeat);
        assert_eq!(MessageKind::parse("position"), MessageKind::Position);
        assert_eq!(MessageKind::parse("QUOTE"), MessageKind::Unknown);
        assert_eq!(MessageKind::parse("trade"), MessageKind::Unknown);
    }

    #[test]
    fn test_envelope_tolerates_missing_fields() {
        let message: WireMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(message.message_kind(), MessageKind::Heartbeat);
        assert!(message.timestamp.is_none());
        assert!(message.data.is_null());
    }

    #[test]
    fn test_quote_from_wire_accepts_numeric_strings() {
        let data: QuoteData = serde_json::from_value(json!({
            "symbol": "SPY",
            "bid": "450.20",
            "ask": 450.30,
            "last": 450.25,
            "changePercent": 1.18,
            "volume": null
        }))
        .unwrap();

        let quote = Quote::from_wire(data, Utc::now()).unwrap();
        assert_eq!(quote.symbol, "SPY");
        assert_eq!(quote.bid, Some(450.20));
        assert_eq!(quote.last, 450.25);
        assert_eq!(quote.change_percent, Some(1.18));
        assert_eq!(quote.volume, None);
        assert!((quote.spread().unwrap() - 0.10).abs() < 1e-9);
        assert!((quote.mid_price().unwrap() - 450.25).abs() < 1e-9);
    }

    #[test]
    fn test_quote_from_wire_requires_symbol_and_last() {
        let no_last: QuoteData = serde_json::from_value(json!({"symbol": "SPY"})).unwrap();
        assert!(Quote::from_wire(no_last, Utc::now()).is_none());

        let no_symbol: QuoteData = serde_json::from_value(json!({"last": 1.0})).unwrap();
        assert!(Quote::from_wire(no_symbol, Utc::now()).is_none());

        let bad_last: QuoteData =
            serde_json::from_value(json!({"symbol": "SPY", "last": "n/a"})).unwrap();
        assert!(Quote::from_wire(bad_last, Utc::now()).is_none());
    }

    #[test]
    fn test_bar_from_wire() {
        let data: BarData = serde_json::from_value(json!({
            "symbol": "QQQ",
            "time": 1704067200,
            "open": 400.0,
            "high": 402.5,
            "low": 399.1,
            "close": 401.7
        }))
        .unwrap();

        let bar = OhlcvBar::from_wire(data).unwrap();
        assert_eq!(bar.symbol, "QQQ");
        assert_eq!(bar.time, 1_704_067_200);
        assert_eq!(bar.close, 401.7);
        assert_eq!(bar.volume, None);

        let partial: BarData =
            serde_json::from_value(json!({"symbol": "QQQ", "time": 1, "open": 1.0})).unwrap();
        assert!(OhlcvBar::from_wire(partial).is_none());
    }

    #[test]
    fn test_control_frame_shapes() {
        let subscribe = ControlFrame::Subscribe {
            symbols: vec![Symbol::new("SPY"), Symbol::new("QQQ")],
        };
        assert_eq!(
            serde_json::to_value(&subscribe).unwrap(),
            json!({"type": "subscribe", "symbols": ["SPY", "QQQ"]})
        );

        let unsubscribe = ControlFrame::Unsubscribe {
            symbols: vec![Symbol::new("SPY")],
        };
        assert_eq!(
            serde_json::to_value(&unsubscribe).unwrap(),
            json!({"type": "unsubscribe", "symbols": ["SPY"]})
        );

        assert_eq!(
            serde_json::to_value(ControlFrame::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn test_parsed_timestamp() {
        let message: WireMessage = serde_json::from_value(json!({
            "type": "quote",
            "timestamp": "2024-01-01T00:00:00Z",
            "data": {}
        }))
        .unwrap();
        assert_eq!(
            message.parsed_timestamp().unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );

        let garbage: WireMessage =
            serde_json::from_value(json!({"type": "quote", "timestamp": "yesterday"})).unwrap();
        assert!(garbage.parsed_timestamp().is_none());
    }
}
