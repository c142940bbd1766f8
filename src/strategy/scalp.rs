//! Scalp: capture wide spreads with quick in-and-out entries.

use crate::config::{ConfigError, StrategyConfig};
use crate::models::{Action, Urgency};
use crate::state::Position;

use super::params::ParamTable;
use super::{Strategy, StrategyCaps, TickContext};

const KNOWN_KEYS: &[&str] = &[
    "min_entry_spread",
    "price_min",
    "price_max",
    "fixed_size_usd",
    "take_profit_pct",
    "stop_loss_pct",
    "time_stop_minutes",
    "max_spread",
    "max_position_usd",
    "max_positions",
];

pub struct Scalp {
    caps: StrategyCaps,
    min_entry_spread: f64,
    price_min: f64,
    price_max: f64,
    fixed_size_usd: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    time_stop_minutes: f64,
}

impl Scalp {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        let table = ParamTable::new(name, &cfg.params, KNOWN_KEYS)?;
        let mut caps = StrategyCaps::new(name, "2.0.1");
        // A scalp needs room between the touch prices to pay for itself.
        caps.min_spread = table.f64("min_entry_spread", 0.02)?;
        caps.max_spread = table.f64("max_spread", 0.08)?;
        caps.max_position_usd = table.f64("max_position_usd", caps.max_position_usd)?;
        caps.max_positions = table.u64("max_positions", caps.max_positions as u64)? as usize;

        Ok(Self {
            min_entry_spread: caps.min_spread,
            price_min: table.f64("price_min", 0.30)?,
            price_max: table.f64("price_max", 0.70)?,
            fixed_size_usd: table.f64("fixed_size_usd", 5.0)?,
            take_profit_pct: table.f64("take_profit_pct", 0.04)?,
            stop_loss_pct: table.f64("stop_loss_pct", 0.03)?,
            time_stop_minutes: table.f64("time_stop_minutes", 30.0)?,
            caps,
        })
    }
}

impl Strategy for Scalp {
    fn caps(&self) -> &StrategyCaps {
        &self.caps
    }

    fn on_tick(&mut self, ctx: &TickContext<'_>) -> Option<Action> {
        let spread = ctx.tick.spread?;
        if spread < self.min_entry_spread {
            return None;
        }
        let mid = ctx.tick.event_mid()?;
        if mid < self.price_min || mid > self.price_max {
            return None;
        }
        Some(
            Action::open_long(
                ctx.market.market_id,
                &ctx.market.condition_id,
                ctx.tick.token,
                self.fixed_size_usd,
                format!("scalp spread {spread:.3} at mid {mid:.3}"),
            )
            .with_urgency(Urgency::Low),
        )
    }

    fn on_position_update(&mut self, position: &Position, ctx: &TickContext<'_>) -> Option<Action> {
        let mid = ctx.tick.quotes(position.token).mid?;
        let avg = position.avg_entry_price;

        if mid >= avg * (1.0 + self.take_profit_pct) {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "take_profit",
            ));
        }
        if mid <= avg * (1.0 - self.stop_loss_pct) {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "stop_loss",
            ));
        }
        let held_minutes = (ctx.tick.ts_ms - position.opened_at_ms) as f64 / 60_000.0;
        if held_minutes >= self.time_stop_minutes {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "time_stop",
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, TokenSide};
    use crate::strategy::testutil::{ctx, market, tick_on};

    fn strategy() -> Scalp {
        Scalp::from_config("scalp", &StrategyConfig::default()).expect("build")
    }

    #[test]
    fn tight_spread_is_not_worth_scalping() {
        let m = market(1);
        let tick = tick_on(&m, TokenSide::Yes, 0.50, 0.51);
        assert!(strategy().on_tick(&ctx(&tick, &m)).is_none());
    }

    #[test]
    fn wide_spread_in_band_enters() {
        let m = market(1);
        let tick = tick_on(&m, TokenSide::Yes, 0.48, 0.52);
        let action = strategy().on_tick(&ctx(&tick, &m)).expect("entry");
        assert_eq!(action.kind, ActionKind::OpenLong);
        assert_eq!(action.urgency, Urgency::Low);
    }

    #[test]
    fn time_stop_fires_after_hold_window() {
        let m = market(1);
        let mut s = strategy();
        let mut position = Position::new("scalp", 1, "0xc1", "y1", TokenSide::Yes, 0);
        position.apply_entry(10.0, 0.50);
        position.opened_at_ms = 0;

        let mut tick = tick_on(&m, TokenSide::Yes, 0.49, 0.51);
        tick.ts_ms = 31 * 60_000;
        let action = s
            .on_position_update(&position, &ctx(&tick, &m))
            .expect("time stop");
        assert_eq!(action.reason, "time_stop");
    }
}
