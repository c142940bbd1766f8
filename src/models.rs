//! Core market and trading entities shared across the engine.
//!
//! Catalog rows come from the external discovery component via the state
//! store; ticks are produced by the gateway; actions are produced by
//! strategies and consumed by the execution pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenSide {
    Yes,
    No,
}

impl TokenSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSide::Yes => "YES",
            TokenSide::No => "NO",
        }
    }

    pub fn opposite(&self) -> TokenSide {
        match self {
            TokenSide::Yes => TokenSide::No,
            TokenSide::No => TokenSide::Yes,
        }
    }

    pub fn parse(s: &str) -> Option<TokenSide> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => Some(TokenSide::Yes),
            "NO" => Some(TokenSide::No),
            _ => None,
        }
    }
}

/// Market lifecycle status as reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Active,
    Closed,
    Resolved,
    AcceptingOrders,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
            MarketStatus::AcceptingOrders => "accepting_orders",
        }
    }

    pub fn parse(s: &str) -> Option<MarketStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(MarketStatus::Active),
            "closed" => Some(MarketStatus::Closed),
            "resolved" => Some(MarketStatus::Resolved),
            "accepting_orders" => Some(MarketStatus::AcceptingOrders),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketStatus::Resolved)
    }
}

/// A catalog market row. Identified by an opaque `condition_id` and an
/// integer `market_id`; carries one token per outcome side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market_id: i64,
    pub condition_id: String,
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub category: Option<String>,
    /// Market format classification (e.g. "match_winner", "map_winner").
    pub format: Option<String>,
    pub market_type: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: MarketStatus,
    pub accepting_orders: bool,
    pub resolved_outcome: Option<TokenSide>,
    pub liquidity_usd: Option<f64>,
}

impl MarketInfo {
    /// Whether new OPEN/ADD orders may execute on this market.
    pub fn accepts_orders(&self) -> bool {
        self.accepting_orders && !self.status.is_terminal() && self.status != MarketStatus::Closed
    }

    pub fn token_id(&self, side: TokenSide) -> &str {
        match side {
            TokenSide::Yes => &self.yes_token_id,
            TokenSide::No => &self.no_token_id,
        }
    }

    pub fn side_of_token(&self, token_id: &str) -> Option<TokenSide> {
        if token_id == self.yes_token_id {
            Some(TokenSide::Yes)
        } else if token_id == self.no_token_id {
            Some(TokenSide::No)
        } else {
            None
        }
    }
}

/// Exchange event class carried by a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickEvent {
    Book,
    PriceChange,
    Trade,
}

impl TickEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickEvent::Book => "book",
            TickEvent::PriceChange => "price_change",
            TickEvent::Trade => "trade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Best-of-book quote set for one token side.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Quotes {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub mid: Option<f64>,
    pub last: Option<f64>,
}

impl Quotes {
    /// Complement quotes for the opposite side of a binary market.
    /// A bid on one side is an ask at `1 - p` on the other.
    pub fn complement(&self) -> Quotes {
        Quotes {
            bid: self.ask.map(|a| 1.0 - a),
            ask: self.bid.map(|b| 1.0 - b),
            mid: self.mid.map(|m| 1.0 - m),
            last: self.last.map(|l| 1.0 - l),
        }
    }
}

/// Normalized market event delivered to strategies.
///
/// Immutable once emitted. Ticks for one `token_id` are totally ordered by
/// exchange sequence; no ordering holds across tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub market_id: i64,
    pub condition_id: String,
    pub token_id: String,
    pub token: TokenSide,
    pub event: TickEvent,
    /// Exchange timestamp, unix millis.
    pub ts_ms: i64,
    /// Quotes for the YES side (complemented when the event came in on NO).
    pub yes: Quotes,
    /// Quotes for the NO side.
    pub no: Quotes,
    /// Orderbook spread of the event token's book.
    pub spread: Option<f64>,
    /// Top-5 depth imbalance of the event token's book.
    pub imbalance: Option<f64>,
    pub trade_size: Option<f64>,
    pub trade_side: Option<TradeSide>,
    /// Mid-price velocity over the trailing 60s window, per second.
    pub velocity_1m: Option<f64>,
}

impl Tick {
    pub fn quotes(&self, side: TokenSide) -> &Quotes {
        match side {
            TokenSide::Yes => &self.yes,
            TokenSide::No => &self.no,
        }
    }

    /// Mid price of the token the event arrived on.
    pub fn event_mid(&self) -> Option<f64> {
        self.quotes(self.token).mid
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.ts_ms
    }
}

/// Strategy intent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    OpenLong,
    OpenSpread,
    Close,
    PartialClose,
    Add,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::OpenLong => "OPEN_LONG",
            ActionKind::OpenSpread => "OPEN_SPREAD",
            ActionKind::Close => "CLOSE",
            ActionKind::PartialClose => "PARTIAL_CLOSE",
            ActionKind::Add => "ADD",
        }
    }

    /// Kinds that create or grow exposure, gated by `accepting_orders`.
    pub fn opens_exposure(&self) -> bool {
        matches!(
            self,
            ActionKind::OpenLong | ActionKind::OpenSpread | ActionKind::Add
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

/// A strategy-issued trading intent.
///
/// Referentially transparent with respect to the tick that produced it:
/// the same tick against the same position snapshot yields the same action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub market_id: i64,
    pub condition_id: String,
    pub token: TokenSide,
    /// Notional in quote currency (USD).
    pub size_usd: f64,
    /// Second-leg notional for OPEN_SPREAD.
    pub hedge_size_usd: Option<f64>,
    pub limit_price: Option<f64>,
    pub urgency: Urgency,
    pub reason: String,
}

impl Action {
    pub fn open_long(
        market_id: i64,
        condition_id: &str,
        token: TokenSide,
        size_usd: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind: ActionKind::OpenLong,
            market_id,
            condition_id: condition_id.to_string(),
            token,
            size_usd,
            hedge_size_usd: None,
            limit_price: None,
            urgency: Urgency::Normal,
            reason: reason.into(),
        }
    }

    pub fn close(
        market_id: i64,
        condition_id: &str,
        token: TokenSide,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind: ActionKind::Close,
            market_id,
            condition_id: condition_id.to_string(),
            token,
            size_usd: 0.0,
            hedge_size_usd: None,
            limit_price: None,
            urgency: Urgency::Normal,
            reason: reason.into(),
        }
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_limit(mut self, price: f64) -> Self {
        self.limit_price = Some(price);
        self
    }
}

/// Deserialize an f64 that the exchange may encode as a JSON number or a
/// decimal string.
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("invalid float string")),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> MarketInfo {
        MarketInfo {
            market_id: 7,
            condition_id: "0xabc".to_string(),
            question: "Will it?".to_string(),
            yes_token_id: "ty".to_string(),
            no_token_id: "tn".to_string(),
            category: None,
            format: None,
            market_type: None,
            end_date: None,
            status: MarketStatus::Active,
            accepting_orders: true,
            resolved_outcome: None,
            liquidity_usd: None,
        }
    }

    #[test]
    fn complement_flips_bid_and_ask() {
        let yes = Quotes {
            bid: Some(0.52),
            ask: Some(0.54),
            mid: Some(0.53),
            last: Some(0.53),
        };
        let no = yes.complement();
        assert!((no.bid.unwrap() - 0.46).abs() < 1e-9);
        assert!((no.ask.unwrap() - 0.48).abs() < 1e-9);
        assert!((no.mid.unwrap() - 0.47).abs() < 1e-9);
    }

    #[test]
    fn accepts_orders_requires_flag_and_live_status() {
        let mut m = market();
        assert!(m.accepts_orders());

        m.accepting_orders = false;
        assert!(!m.accepts_orders());

        m.accepting_orders = true;
        m.status = MarketStatus::Resolved;
        assert!(!m.accepts_orders());
    }

    #[test]
    fn side_lookup_by_token() {
        let m = market();
        assert_eq!(m.side_of_token("ty"), Some(TokenSide::Yes));
        assert_eq!(m.side_of_token("tn"), Some(TokenSide::No));
        assert_eq!(m.side_of_token("tz"), None);
    }
}
