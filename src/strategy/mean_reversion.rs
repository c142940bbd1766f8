//! Mean-reversion: fade velocity spikes back toward the hour's level.

use crate::config::{ConfigError, StrategyConfig};
use crate::models::{Action, TokenSide};
use crate::state::Position;

use super::params::ParamTable;
use super::{Strategy, StrategyCaps, TickContext};

const KNOWN_KEYS: &[&str] = &[
    "velocity_threshold",
    "price_min",
    "price_max",
    "fixed_size_usd",
    "take_profit_pct",
    "stop_loss_pct",
    "max_hold_minutes",
    "max_spread",
    "max_position_usd",
    "max_positions",
];

pub struct MeanReversion {
    caps: StrategyCaps,
    velocity_threshold: f64,
    price_min: f64,
    price_max: f64,
    fixed_size_usd: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    max_hold_minutes: f64,
}

impl MeanReversion {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        let table = ParamTable::new(name, &cfg.params, KNOWN_KEYS)?;
        let mut caps = StrategyCaps::new(name, "1.0.0");
        caps.max_spread = table.f64("max_spread", 0.04)?;
        caps.max_position_usd = table.f64("max_position_usd", caps.max_position_usd)?;
        caps.max_positions = table.u64("max_positions", caps.max_positions as u64)? as usize;

        Ok(Self {
            caps,
            // Mid moving 3 cents over the minute.
            velocity_threshold: table.f64("velocity_threshold", 0.0005)?,
            price_min: table.f64("price_min", 0.20)?,
            price_max: table.f64("price_max", 0.80)?,
            fixed_size_usd: table.f64("fixed_size_usd", 5.0)?,
            take_profit_pct: table.f64("take_profit_pct", 0.05)?,
            stop_loss_pct: table.f64("stop_loss_pct", 0.05)?,
            max_hold_minutes: table.f64("max_hold_minutes", 60.0)?,
        })
    }
}

impl Strategy for MeanReversion {
    fn caps(&self) -> &StrategyCaps {
        &self.caps
    }

    fn on_tick(&mut self, ctx: &TickContext<'_>) -> Option<Action> {
        let velocity = ctx.tick.velocity_1m?;
        // Velocity is quoted on the YES mid regardless of event token.
        let yes_velocity = match ctx.tick.token {
            TokenSide::Yes => velocity,
            TokenSide::No => -velocity,
        };

        // A spike up in YES is faded by buying NO, and vice versa.
        let side = if yes_velocity >= self.velocity_threshold {
            TokenSide::No
        } else if yes_velocity <= -self.velocity_threshold {
            TokenSide::Yes
        } else {
            return None;
        };

        let mid = ctx.tick.quotes(side).mid?;
        if mid < self.price_min || mid > self.price_max {
            return None;
        }
        Some(Action::open_long(
            ctx.market.market_id,
            &ctx.market.condition_id,
            side,
            self.fixed_size_usd,
            format!("fade velocity {yes_velocity:+.5}/s into {} at {mid:.3}", side.as_str()),
        ))
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
        if held_minutes >= self.max_hold_minutes {
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
    use crate::models::ActionKind;
    use crate::strategy::testutil::{ctx, market, tick_on};

    fn strategy() -> MeanReversion {
        MeanReversion::from_config("mean_reversion", &StrategyConfig::default()).expect("build")
    }

    #[test]
    fn fades_up_spike_by_buying_no() {
        let m = market(1);
        let mut tick = tick_on(&m, TokenSide::Yes, 0.54, 0.56);
        tick.velocity_1m = Some(0.001);
        let action = strategy().on_tick(&ctx(&tick, &m)).expect("fade");
        assert_eq!(action.kind, ActionKind::OpenLong);
        assert_eq!(action.token, TokenSide::No);
    }

    #[test]
    fn fades_down_spike_by_buying_yes() {
        let m = market(1);
        let mut tick = tick_on(&m, TokenSide::Yes, 0.54, 0.56);
        tick.velocity_1m = Some(-0.001);
        let action = strategy().on_tick(&ctx(&tick, &m)).expect("fade");
        assert_eq!(action.token, TokenSide::Yes);
    }

    #[test]
    fn calm_tape_is_left_alone() {
        let m = market(1);
        let mut tick = tick_on(&m, TokenSide::Yes, 0.54, 0.56);
        tick.velocity_1m = Some(0.0001);
        assert!(strategy().on_tick(&ctx(&tick, &m)).is_none());
    }

    #[test]
    fn no_side_velocity_is_mirrored() {
        let m = market(1);
        // Event on NO with positive velocity means YES is falling.
        let mut tick = tick_on(&m, TokenSide::No, 0.44, 0.46);
        tick.velocity_1m = Some(0.001);
        let action = strategy().on_tick(&ctx(&tick, &m)).expect("fade");
        assert_eq!(action.token, TokenSide::Yes);
    }
}
