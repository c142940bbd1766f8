//! Per-strategy capital accounting.
//!
//! Cash-based: equity is allocation plus realized PnL; unrealized PnL is
//! tracked for reporting only. The invariant
//! `available + Σ(open cost_basis) ≤ allocated + realized (+ε)` holds
//! because every fill moves cash and cost basis by offsetting amounts,
//! with fees charged to realized PnL.

use serde::{Deserialize, Serialize};

/// Cents tolerance for the accounting invariant.
pub const ACCOUNTING_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    pub strategy: String,
    pub allocated_usd: f64,
    pub available_usd: f64,
    pub total_realized_pnl: f64,
    pub total_unrealized_pnl: f64,
    pub trade_count: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub high_water_mark: f64,
    pub max_drawdown: f64,
    pub is_active: bool,
}

impl StrategyState {
    pub fn new(strategy: &str, allocated_usd: f64) -> Self {
        Self {
            strategy: strategy.to_string(),
            allocated_usd,
            available_usd: allocated_usd,
            total_realized_pnl: 0.0,
            total_unrealized_pnl: 0.0,
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            high_water_mark: allocated_usd,
            max_drawdown: 0.0,
            is_active: true,
        }
    }

    /// Cash equity: allocation plus realized PnL.
    pub fn equity(&self) -> f64 {
        self.allocated_usd + self.total_realized_pnl
    }

    /// Current peak-relative decline, in [0, 1].
    pub fn drawdown_pct(&self) -> f64 {
        if self.high_water_mark <= 0.0 {
            return 0.0;
        }
        ((self.high_water_mark - self.equity()) / self.high_water_mark).clamp(0.0, 1.0)
    }

    /// Debit cash for an entry: notional goes to cost basis, fees to
    /// realized PnL.
    pub fn debit_entry(&mut self, notional_usd: f64, fees_usd: f64) {
        self.available_usd = (self.available_usd - notional_usd - fees_usd).max(0.0);
        if fees_usd != 0.0 {
            self.record_realized(-fees_usd, false);
        }
        self.trade_count += 1;
    }

    /// Credit proceeds of an exit and book its realized PnL (net of fees).
    pub fn credit_exit(&mut self, proceeds_usd: f64, realized_pnl: f64, fees_usd: f64) {
        self.available_usd += (proceeds_usd - fees_usd).max(0.0);
        self.trade_count += 1;
        self.record_realized(realized_pnl - fees_usd, true);
    }

    /// Book a realized PnL event, updating the high-water mark and max
    /// drawdown. `count_outcome` marks a closed round trip for win/loss
    /// tallies (fee debits are not outcomes).
    pub fn record_realized(&mut self, pnl: f64, count_outcome: bool) {
        self.total_realized_pnl += pnl;
        if count_outcome {
            if pnl > 0.0 {
                self.win_count += 1;
            } else if pnl < 0.0 {
                self.loss_count += 1;
            }
        }

        let equity = self.equity();
        if equity > self.high_water_mark {
            self.high_water_mark = equity;
        } else if self.high_water_mark > 0.0 {
            let drawdown = (self.high_water_mark - equity) / self.high_water_mark;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
    }

    pub fn win_rate(&self) -> f64 {
        let outcomes = self.win_count + self.loss_count;
        if outcomes == 0 {
            return 0.0;
        }
        self.win_count as f64 / outcomes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_then_winning_exit_balances() {
        let mut s = StrategyState::new("scalp", 100.0);
        // Buy $10 notional, no fees.
        s.debit_entry(10.0, 0.0);
        assert!((s.available_usd - 90.0).abs() < 1e-9);

        // Sell for $12 proceeds, $2 realized.
        s.credit_exit(12.0, 2.0, 0.0);
        assert!((s.available_usd - 102.0).abs() < 1e-9);
        assert!((s.total_realized_pnl - 2.0).abs() < 1e-9);
        assert_eq!(s.win_count, 1);
        assert!((s.equity() - 102.0).abs() < 1e-9);
        assert!((s.high_water_mark - 102.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_peak_decline() {
        let mut s = StrategyState::new("swing", 100.0);
        s.record_realized(20.0, true); // hwm 120
        s.record_realized(-30.0, true); // equity 90, dd 25%
        assert!((s.high_water_mark - 120.0).abs() < 1e-9);
        assert!((s.max_drawdown - 0.25).abs() < 1e-9);
        assert!((s.drawdown_pct() - 0.25).abs() < 1e-9);

        s.record_realized(40.0, true); // new peak 130
        assert!((s.high_water_mark - 130.0).abs() < 1e-9);
        assert!((s.max_drawdown - 0.25).abs() < 1e-9); // max sticks
        assert_eq!(s.drawdown_pct(), 0.0);
    }

    #[test]
    fn fees_hit_realized_but_not_outcomes() {
        let mut s = StrategyState::new("fees", 50.0);
        s.debit_entry(10.0, 0.05);
        assert!((s.available_usd - 39.95).abs() < 1e-9);
        assert!((s.total_realized_pnl + 0.05).abs() < 1e-9);
        assert_eq!(s.win_count + s.loss_count, 0);
    }

    #[test]
    fn invariant_holds_through_round_trip() {
        let mut s = StrategyState::new("inv", 100.0);
        let mut open_cost = 0.0;

        s.debit_entry(25.0, 0.10);
        open_cost += 25.0;
        assert!(
            s.available_usd + open_cost
                <= s.allocated_usd + s.total_realized_pnl + ACCOUNTING_EPSILON
        );

        // Exit half at a loss.
        open_cost -= 12.5;
        s.credit_exit(11.0, -1.5, 0.10);
        assert!(
            s.available_usd + open_cost
                <= s.allocated_usd + s.total_realized_pnl + ACCOUNTING_EPSILON
        );
    }
}
