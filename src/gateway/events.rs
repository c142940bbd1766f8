//! Inbound exchange event parsing.
//!
//! The market channel delivers `book`, `price_change`, and `trade` events,
//! as JSON text frames or MessagePack binary frames, either a single
//! object or a batch array. Malformed payloads are skipped, never fatal.

use serde::Deserialize;
use tracing::debug;

use crate::models::{de_f64, TradeSide};

use super::book::PriceLevel;

/// A parsed market-channel event.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Book(BookEvent),
    PriceChange(PriceChangeEvent),
    Trade(TradeEvent),
}

impl RawEvent {
    pub fn asset_id(&self) -> &str {
        match self {
            RawEvent::Book(e) => &e.asset_id,
            RawEvent::PriceChange(e) => &e.asset_id,
            RawEvent::Trade(e) => &e.asset_id,
        }
    }

    pub fn ts_ms(&self) -> Option<i64> {
        match self {
            RawEvent::Book(e) => e.ts_ms(),
            RawEvent::PriceChange(e) => e.ts_ms(),
            RawEvent::Trade(e) => e.ts_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLevel {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
}

impl From<&RawLevel> for PriceLevel {
    fn from(l: &RawLevel) -> Self {
        PriceLevel {
            price: l.price,
            size: l.size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookEvent {
    pub asset_id: String,
    #[serde(default, alias = "buys")]
    pub bids: Vec<RawLevel>,
    #[serde(default, alias = "sells")]
    pub asks: Vec<RawLevel>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeEvent {
    pub asset_id: String,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
    /// "BUY" updates the bid ladder, "SELL" the ask ladder.
    pub side: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl PriceChangeEvent {
    pub fn trade_side(&self) -> Option<TradeSide> {
        match self.side.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    pub asset_id: String,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TradeEvent {
    pub fn trade_side(&self) -> Option<TradeSide> {
        match self.side.as_deref().map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("BUY") => Some(TradeSide::Buy),
            Some(s) if s.eq_ignore_ascii_case("SELL") => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

fn parse_ts_ms(raw: Option<&str>) -> Option<i64> {
    let ts: i64 = raw?.trim().parse().ok()?;
    // Exchange timestamps show up in seconds or millis depending on feed.
    if ts < 100_000_000_000 {
        Some(ts * 1000)
    } else {
        Some(ts)
    }
}

impl BookEvent {
    pub fn ts_ms(&self) -> Option<i64> {
        parse_ts_ms(self.timestamp.as_deref())
    }
}

impl PriceChangeEvent {
    pub fn ts_ms(&self) -> Option<i64> {
        parse_ts_ms(self.timestamp.as_deref())
    }
}

impl TradeEvent {
    pub fn ts_ms(&self) -> Option<i64> {
        parse_ts_ms(self.timestamp.as_deref())
    }
}

/// Parse a text frame. `PONG` control text and unknown event types yield
/// an empty batch.
pub fn parse_text_frame(text: &str) -> Vec<RawEvent> {
    if text.eq_ignore_ascii_case("pong") || text.eq_ignore_ascii_case("ping") {
        return Vec::new();
    }
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "unparseable market ws text frame");
            return Vec::new();
        }
    };
    parse_value(value)
}

/// Parse a binary frame: MessagePack first, JSON bytes as fallback.
pub fn parse_binary_frame(bytes: &[u8]) -> Vec<RawEvent> {
    if let Ok(value) = rmp_serde::from_slice::<serde_json::Value>(bytes) {
        return parse_value(value);
    }
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(value) => parse_value(value),
        Err(e) => {
            debug!(error = %e, len = bytes.len(), "unparseable market ws binary frame");
            Vec::new()
        }
    }
}

fn parse_value(value: serde_json::Value) -> Vec<RawEvent> {
    match value {
        serde_json::Value::Array(items) => {
            items.into_iter().filter_map(parse_event).collect()
        }
        other => parse_event(other).into_iter().collect(),
    }
}

fn parse_event(value: serde_json::Value) -> Option<RawEvent> {
    let event_type = value.get("event_type").and_then(|v| v.as_str())?;
    match event_type {
        "book" => match serde_json::from_value::<BookEvent>(value) {
            Ok(e) => Some(RawEvent::Book(e)),
            Err(e) => {
                debug!(error = %e, "malformed book event");
                None
            }
        },
        "price_change" => match serde_json::from_value::<PriceChangeEvent>(value) {
            Ok(e) => Some(RawEvent::PriceChange(e)),
            Err(e) => {
                debug!(error = %e, "malformed price_change event");
                None
            }
        },
        "trade" | "last_trade_price" => match serde_json::from_value::<TradeEvent>(value) {
            Ok(e) => Some(RawEvent::Trade(e)),
            Err(e) => {
                debug!(error = %e, "malformed trade event");
                None
            }
        },
        other => {
            debug!(event_type = %other, "ignoring unknown market event type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_book_event_with_string_prices() {
        let text = r#"{
            "event_type": "book",
            "asset_id": "tok1",
            "bids": [{"price": "0.52", "size": "900"}, {"price": "0.51", "size": "400"}],
            "asks": [{"price": "0.54", "size": "200"}],
            "timestamp": "1700000000123"
        }"#;
        let events = parse_text_frame(text);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RawEvent::Book(b) => {
                assert_eq!(b.asset_id, "tok1");
                assert_eq!(b.bids.len(), 2);
                assert_eq!(b.ts_ms(), Some(1_700_000_000_123));
            }
            other => panic!("expected book event, got {other:?}"),
        }
    }

    #[test]
    fn parses_event_batch() {
        let text = r#"[
            {"event_type": "trade", "asset_id": "tok1", "price": "0.53", "size": "10", "side": "BUY"},
            {"event_type": "price_change", "asset_id": "tok1", "price": "0.52", "size": "0", "side": "BUY"}
        ]"#;
        let events = parse_text_frame(text);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RawEvent::Trade(_)));
        assert!(matches!(events[1], RawEvent::PriceChange(_)));
    }

    #[test]
    fn pong_and_garbage_are_skipped() {
        assert!(parse_text_frame("PONG").is_empty());
        assert!(parse_text_frame("not json").is_empty());
        assert!(parse_text_frame(r#"{"event_type": "tick_size_change"}"#).is_empty());
    }

    #[test]
    fn seconds_timestamps_are_upscaled() {
        let e = TradeEvent {
            asset_id: "t".to_string(),
            price: 0.5,
            size: 1.0,
            side: None,
            timestamp: Some("1700000000".to_string()),
        };
        assert_eq!(e.ts_ms(), Some(1_700_000_000_000));
    }

    #[test]
    fn msgpack_frame_round_trips() {
        let json = serde_json::json!({
            "event_type": "trade",
            "asset_id": "tok9",
            "price": 0.41,
            "size": 25.0,
            "side": "SELL"
        });
        let bytes = rmp_serde::to_vec_named(&json).expect("encode");
        let events = parse_binary_frame(&bytes);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RawEvent::Trade(t) => {
                assert_eq!(t.asset_id, "tok9");
                assert_eq!(t.trade_side(), Some(TradeSide::Sell));
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }
}
