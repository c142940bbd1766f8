//! Positions, legs, spreads, and audit decisions.
//!
//! A position accumulates entry fills into an average price and cost
//! basis; exits realize PnL against that average. Every fill appends one
//! leg, so the leg log reconstructs the position exactly. Spreads pair the
//! YES and NO positions a strategy holds on one market.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ActionKind, TokenSide, TradeSide};

/// Shares below this are treated as fully closed (float dust).
pub const SHARE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    Resolved,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<PositionStatus> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            "resolved" => Some(PositionStatus::Resolved),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

/// A confirmed execution against one token, in shares at a price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub token: TokenSide,
    pub side: TradeSide,
    pub price: f64,
    pub shares: f64,
    pub fees_usd: f64,
    pub order_id: Option<String>,
    pub ts_ms: i64,
    pub reason: String,
}

impl Fill {
    pub fn notional_usd(&self) -> f64 {
        self.shares * self.price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub strategy: String,
    pub market_id: i64,
    pub condition_id: String,
    pub token_id: String,
    pub token: TokenSide,
    pub avg_entry_price: f64,
    pub remaining_shares: f64,
    pub cost_basis: f64,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub spread_id: Option<String>,
    pub opened_at_ms: i64,
    pub closed_at_ms: Option<i64>,
    pub close_reason: Option<String>,
}

impl Position {
    pub fn new(
        strategy: &str,
        market_id: i64,
        condition_id: &str,
        token_id: &str,
        token: TokenSide,
        opened_at_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy: strategy.to_string(),
            market_id,
            condition_id: condition_id.to_string(),
            token_id: token_id.to_string(),
            token,
            avg_entry_price: 0.0,
            remaining_shares: 0.0,
            cost_basis: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            spread_id: None,
            opened_at_ms,
            closed_at_ms: None,
            close_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Apply an entry (buy) fill. Cost basis excludes fees.
    pub fn apply_entry(&mut self, shares: f64, price: f64) {
        let notional = shares * price;
        let new_shares = self.remaining_shares + shares;
        let new_cost = self.cost_basis + notional;
        self.remaining_shares = new_shares;
        self.cost_basis = new_cost;
        self.avg_entry_price = if new_shares > 0.0 {
            new_cost / new_shares
        } else {
            price
        };
    }

    /// Apply an exit (sell) fill; returns the realized PnL delta. Shares
    /// are capped at the remainder; dust closes the position.
    pub fn apply_exit(&mut self, shares: f64, price: f64, ts_ms: i64, reason: &str) -> f64 {
        let shares = shares.min(self.remaining_shares);
        if shares <= 0.0 {
            return 0.0;
        }
        let cost_reduced = self.avg_entry_price * shares;
        let realized = shares * price - cost_reduced;

        self.remaining_shares = (self.remaining_shares - shares).max(0.0);
        self.cost_basis = (self.cost_basis - cost_reduced).max(0.0);
        self.realized_pnl += realized;

        if self.remaining_shares <= SHARE_EPSILON {
            self.remaining_shares = 0.0;
            self.cost_basis = 0.0;
            self.status = PositionStatus::Closed;
            self.closed_at_ms = Some(ts_ms);
            self.close_reason = Some(reason.to_string());
        }
        realized
    }

    /// Settle against a resolved market. Pays $1/share when this token is
    /// the winning outcome, $0 otherwise.
    pub fn apply_resolution(&mut self, outcome: TokenSide, ts_ms: i64) -> f64 {
        let payout = if self.token == outcome { 1.0 } else { 0.0 };
        let realized = self.remaining_shares * (payout - self.avg_entry_price);
        let proceeds = self.remaining_shares * payout;

        self.realized_pnl += realized;
        self.remaining_shares = 0.0;
        self.cost_basis = 0.0;
        self.status = PositionStatus::Resolved;
        self.closed_at_ms = Some(ts_ms);
        self.close_reason = Some(format!("resolved_{}", outcome.as_str().to_lowercase()));
        proceeds
    }

    /// Unrealized PnL against a mark price.
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.remaining_shares * (mark - self.avg_entry_price)
    }
}

/// Append-only record of one fill applied to a position. Positive
/// `delta_shares` adds exposure, negative removes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLeg {
    pub id: String,
    pub position_id: String,
    pub ts_ms: i64,
    pub delta_shares: f64,
    pub price: f64,
    pub cost_delta: f64,
    pub trigger_reason: String,
}

impl PositionLeg {
    pub fn entry(position_id: &str, shares: f64, price: f64, ts_ms: i64, reason: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            position_id: position_id.to_string(),
            ts_ms,
            delta_shares: shares,
            price,
            cost_delta: shares * price,
            trigger_reason: reason.to_string(),
        }
    }

    pub fn exit(
        position_id: &str,
        shares: f64,
        price: f64,
        cost_delta: f64,
        ts_ms: i64,
        reason: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            position_id: position_id.to_string(),
            ts_ms,
            delta_shares: -shares,
            price,
            cost_delta,
            trigger_reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadStatus {
    Open,
    Closed,
}

impl SpreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpreadStatus::Open => "open",
            SpreadStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<SpreadStatus> {
        match s {
            "open" => Some(SpreadStatus::Open),
            "closed" => Some(SpreadStatus::Closed),
            _ => None,
        }
    }
}

/// Paired YES+NO holdings by one strategy on one market. Legs reference
/// the spread by id and vice versa; no object cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spread {
    pub id: String,
    pub strategy: String,
    pub market_id: i64,
    pub condition_id: String,
    pub yes_position_id: String,
    pub no_position_id: String,
    pub cost_basis: f64,
    pub realized_pnl: f64,
    pub status: SpreadStatus,
    pub opened_at_ms: i64,
}

impl Spread {
    pub fn link(yes: &Position, no: &Position, ts_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy: yes.strategy.clone(),
            market_id: yes.market_id,
            condition_id: yes.condition_id.clone(),
            yes_position_id: yes.id.clone(),
            no_position_id: no.id.clone(),
            cost_basis: yes.cost_basis + no.cost_basis,
            realized_pnl: yes.realized_pnl + no.realized_pnl,
            status: SpreadStatus::Open,
            opened_at_ms: ts_ms,
        }
    }

    pub fn position_ids(&self) -> [&str; 2] {
        [&self.yes_position_id, &self.no_position_id]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Executed,
    Rejected,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Executed => "executed",
            DecisionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<DecisionStatus> {
        match s {
            "pending" => Some(DecisionStatus::Pending),
            "executed" => Some(DecisionStatus::Executed),
            "rejected" => Some(DecisionStatus::Rejected),
            _ => None,
        }
    }
}

/// Audit row for every action the pipeline saw, accepted or not. The
/// inputs snapshot captures what the gates evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub id: String,
    pub ts_ms: i64,
    pub strategy: String,
    pub market_id: i64,
    pub condition_id: String,
    pub token_id: String,
    pub action: ActionKind,
    pub size_usd: f64,
    pub inputs: serde_json::Value,
    pub status: DecisionStatus,
    pub rejection_reason: Option<String>,
    pub execution_price: Option<f64>,
    pub position_id: Option<String>,
}

impl TradeDecision {
    pub fn executed(&self) -> bool {
        self.status == DecisionStatus::Executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> Position {
        Position::new("scalp", 1, "0xc", "ty", TokenSide::Yes, 0)
    }

    #[test]
    fn entries_average_and_accumulate() {
        let mut p = position();
        p.apply_entry(10.0, 0.40);
        p.apply_entry(10.0, 0.60);
        assert!((p.avg_entry_price - 0.50).abs() < 1e-9);
        assert!((p.cost_basis - 10.0).abs() < 1e-9);
        assert!((p.remaining_shares - 20.0).abs() < 1e-9);
        assert!(p.is_open());
    }

    #[test]
    fn partial_exit_realizes_against_average() {
        let mut p = position();
        p.apply_entry(10.0, 0.50);
        let realized = p.apply_exit(4.0, 0.60, 100, "take_profit");
        assert!((realized - 0.40).abs() < 1e-9);
        assert!((p.remaining_shares - 6.0).abs() < 1e-9);
        assert!((p.cost_basis - 3.0).abs() < 1e-9);
        assert!(p.is_open());
    }

    #[test]
    fn full_exit_closes_position() {
        let mut p = position();
        p.apply_entry(10.0, 0.50);
        p.apply_exit(10.0, 0.45, 123, "stop_loss");
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.closed_at_ms, Some(123));
        assert_eq!(p.remaining_shares, 0.0);
        assert_eq!(p.cost_basis, 0.0);
        assert!((p.realized_pnl + 0.50).abs() < 1e-9);
    }

    #[test]
    fn exit_caps_at_remaining_shares() {
        let mut p = position();
        p.apply_entry(5.0, 0.50);
        let realized = p.apply_exit(50.0, 0.70, 1, "close");
        assert!((realized - 1.0).abs() < 1e-9);
        assert_eq!(p.status, PositionStatus::Closed);
    }

    #[test]
    fn winning_resolution_pays_dollar_per_share() {
        let mut p = position();
        p.apply_entry(10.0, 0.30);
        let proceeds = p.apply_resolution(TokenSide::Yes, 10);
        assert!((proceeds - 10.0).abs() < 1e-9);
        assert!((p.realized_pnl - 7.0).abs() < 1e-9);
        assert_eq!(p.status, PositionStatus::Resolved);
    }

    #[test]
    fn losing_resolution_pays_zero() {
        let mut p = position();
        p.apply_entry(10.0, 0.30);
        let proceeds = p.apply_resolution(TokenSide::No, 10);
        assert_eq!(proceeds, 0.0);
        assert!((p.realized_pnl + 3.0).abs() < 1e-9);
    }

    #[test]
    fn legs_reconstruct_position() {
        let mut p = position();
        let mut legs: Vec<PositionLeg> = Vec::new();

        p.apply_entry(10.0, 0.50);
        legs.push(PositionLeg::entry(&p.id, 10.0, 0.50, 1, "entry"));

        let before_cost = p.cost_basis;
        p.apply_exit(4.0, 0.55, 2, "scale_out");
        legs.push(PositionLeg::exit(
            &p.id,
            4.0,
            0.55,
            p.cost_basis - before_cost,
            2,
            "scale_out",
        ));

        let net_shares: f64 = legs.iter().map(|l| l.delta_shares).sum();
        let net_cost: f64 = legs.iter().map(|l| l.cost_delta).sum();
        assert!((net_shares - p.remaining_shares).abs() < 1e-9);
        assert!((net_cost - p.cost_basis).abs() < 1e-9);
    }
}
