//! Swing-rebalance: band entries, trim rallies, add to dips.

use std::collections::HashMap;

use crate::config::{ConfigError, StrategyConfig};
use crate::models::{Action, ActionKind, TokenSide, Urgency};
use crate::state::Position;

use super::params::ParamTable;
use super::{Strategy, StrategyCaps, TickContext};

const KNOWN_KEYS: &[&str] = &[
    "entry_price_min",
    "entry_price_max",
    "fixed_size_usd",
    "rebalance_pct",
    "trim_fraction",
    "add_fraction",
    "max_adds",
    "stop_loss_pct",
    "max_spread",
    "max_position_usd",
    "max_positions",
];

pub struct SwingRebalance {
    caps: StrategyCaps,
    entry_price_min: f64,
    entry_price_max: f64,
    fixed_size_usd: f64,
    rebalance_pct: f64,
    trim_fraction: f64,
    add_fraction: f64,
    max_adds: u32,
    stop_loss_pct: f64,
    /// Adds issued per position id; dropped when the position closes.
    adds_issued: HashMap<String, u32>,
}

impl SwingRebalance {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        let table = ParamTable::new(name, &cfg.params, KNOWN_KEYS)?;
        let mut caps = StrategyCaps::new(name, "1.1.0");
        caps.max_spread = table.f64("max_spread", 0.04)?;
        caps.max_position_usd = table.f64("max_position_usd", caps.max_position_usd)?;
        caps.max_positions = table.u64("max_positions", caps.max_positions as u64)? as usize;

        Ok(Self {
            caps,
            entry_price_min: table.f64("entry_price_min", 0.40)?,
            entry_price_max: table.f64("entry_price_max", 0.60)?,
            fixed_size_usd: table.f64("fixed_size_usd", 10.0)?,
            rebalance_pct: table.f64("rebalance_pct", 0.10)?,
            trim_fraction: table.f64("trim_fraction", 0.5)?.clamp(0.05, 1.0),
            add_fraction: table.f64("add_fraction", 0.5)?.clamp(0.05, 1.0),
            max_adds: table.u64("max_adds", 2)? as u32,
            stop_loss_pct: table.f64("stop_loss_pct", 0.20)?,
            adds_issued: HashMap::new(),
        })
    }
}

impl Strategy for SwingRebalance {
    fn caps(&self) -> &StrategyCaps {
        &self.caps
    }

    fn on_tick(&mut self, ctx: &TickContext<'_>) -> Option<Action> {
        if ctx.tick.token != TokenSide::Yes {
            return None;
        }
        let mid = ctx.tick.yes.mid?;
        if mid < self.entry_price_min || mid > self.entry_price_max {
            return None;
        }
        Some(Action::open_long(
            ctx.market.market_id,
            &ctx.market.condition_id,
            TokenSide::Yes,
            self.fixed_size_usd,
            format!("swing entry at mid {mid:.3}"),
        ))
    }

    fn on_position_update(&mut self, position: &Position, ctx: &TickContext<'_>) -> Option<Action> {
        let mid = ctx.tick.quotes(position.token).mid?;
        let avg = position.avg_entry_price;

        if mid <= avg * (1.0 - self.stop_loss_pct) {
            self.adds_issued.remove(&position.id);
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "stop_loss",
            ));
        }

        // Trim into strength.
        if mid >= avg * (1.0 + self.rebalance_pct) {
            let trim_usd = self.trim_fraction * position.remaining_shares * mid;
            if trim_usd > 0.0 {
                return Some(Action {
                    kind: ActionKind::PartialClose,
                    market_id: ctx.market.market_id,
                    condition_id: ctx.market.condition_id.clone(),
                    token: position.token,
                    size_usd: trim_usd,
                    hedge_size_usd: None,
                    limit_price: None,
                    urgency: Urgency::Normal,
                    reason: format!("rebalance trim at mid {mid:.3}"),
                });
            }
        }

        // Add into weakness, a bounded number of times.
        if mid <= avg * (1.0 - self.rebalance_pct) {
            let issued = self.adds_issued.entry(position.id.clone()).or_insert(0);
            if *issued < self.max_adds {
                *issued += 1;
                return Some(Action {
                    kind: ActionKind::Add,
                    market_id: ctx.market.market_id,
                    condition_id: ctx.market.condition_id.clone(),
                    token: position.token,
                    size_usd: self.add_fraction * position.cost_basis,
                    hedge_size_usd: None,
                    limit_price: None,
                    urgency: Urgency::Normal,
                    reason: format!("rebalance add at mid {mid:.3}"),
                });
            }
        }

        None
    }
}
