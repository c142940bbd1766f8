//! Favorite-hedge: ride the favorite, lock gains with the opposite leg.
//!
//! Enters the YES side of a market whose favorite trades in a band; when
//! the price runs far enough, buys the NO side sized as a fraction of the
//! YES cost basis. The paired legs become a spread, so further rallies are
//! partially insured regardless of the final outcome.

use crate::config::{ConfigError, StrategyConfig};
use crate::models::{Action, TokenSide, Urgency};
use crate::state::Position;

use super::params::ParamTable;
use super::{Strategy, StrategyCaps, TickContext};

const KNOWN_KEYS: &[&str] = &[
    "entry_price_min",
    "entry_price_max",
    "hedge_trigger",
    "hedge_ratio",
    "fixed_size_usd",
    "stop_loss_pct",
    "max_spread",
    "max_position_usd",
    "max_positions",
];

pub struct FavoriteHedge {
    caps: StrategyCaps,
    entry_price_min: f64,
    entry_price_max: f64,
    hedge_trigger: f64,
    hedge_ratio: f64,
    fixed_size_usd: f64,
    stop_loss_pct: f64,
}

impl FavoriteHedge {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        let table = ParamTable::new(name, &cfg.params, KNOWN_KEYS)?;
        let mut caps = StrategyCaps::new(name, "1.0.3");
        caps.max_spread = table.f64("max_spread", 0.04)?;
        caps.max_position_usd = table.f64("max_position_usd", caps.max_position_usd)?;
        caps.max_positions = table.u64("max_positions", caps.max_positions as u64)? as usize;

        Ok(Self {
            caps,
            entry_price_min: table.f64("entry_price_min", 0.58)?,
            entry_price_max: table.f64("entry_price_max", 0.80)?,
            hedge_trigger: table.f64("hedge_trigger", 0.85)?,
            hedge_ratio: table.f64("hedge_ratio", 0.33)?,
            fixed_size_usd: table.f64("fixed_size_usd", 20.0)?,
            stop_loss_pct: table.f64("stop_loss_pct", 0.15)?,
        })
    }
}

impl Strategy for FavoriteHedge {
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
        // Don't step in front of a falling favorite.
        if ctx.tick.velocity_1m.unwrap_or(0.0) < 0.0 {
            return None;
        }
        Some(Action::open_long(
            ctx.market.market_id,
            &ctx.market.condition_id,
            TokenSide::Yes,
            self.fixed_size_usd,
            format!("favorite at mid {mid:.3}"),
        ))
    }

    fn on_position_update(&mut self, position: &Position, ctx: &TickContext<'_>) -> Option<Action> {
        // The NO leg is the hedge; it is managed through the spread.
        if position.token != TokenSide::Yes {
            return None;
        }
        let mid = ctx.tick.yes.mid?;

        if position.spread_id.is_none() && mid >= self.hedge_trigger {
            let hedge_size = self.hedge_ratio * position.cost_basis;
            if hedge_size > 0.0 {
                return Some(
                    Action::open_long(
                        ctx.market.market_id,
                        &ctx.market.condition_id,
                        TokenSide::No,
                        hedge_size,
                        format!("hedge lock at yes mid {mid:.3}"),
                    )
                    .with_urgency(Urgency::High),
                );
            }
        }

        if mid <= position.avg_entry_price * (1.0 - self.stop_loss_pct) {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                TokenSide::Yes,
                "stop_loss",
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

    fn strategy() -> FavoriteHedge {
        FavoriteHedge::from_config("favorite_hedge", &StrategyConfig::default()).expect("build")
    }

    #[test]
    fn enters_favorite_in_band() {
        let m = market(1);
        let tick = tick_on(&m, TokenSide::Yes, 0.59, 0.61);
        let action = strategy().on_tick(&ctx(&tick, &m)).expect("entry");
        assert_eq!(action.kind, ActionKind::OpenLong);
        assert_eq!(action.token, TokenSide::Yes);
        assert!((action.size_usd - 20.0).abs() < 1e-9);
    }

    #[test]
    fn skips_longshots_and_near_certainties() {
        let m = market(1);
        let mut s = strategy();
        let cheap = tick_on(&m, TokenSide::Yes, 0.30, 0.32);
        assert!(s.on_tick(&ctx(&cheap, &m)).is_none());
        let rich = tick_on(&m, TokenSide::Yes, 0.90, 0.92);
        assert!(s.on_tick(&ctx(&rich, &m)).is_none());
    }

    #[test]
    fn hedges_no_leg_after_rise() {
        let m = market(1);
        let mut s = strategy();
        let mut position = Position::new("favorite_hedge", 1, "0xc1", "y1", TokenSide::Yes, 0);
        // avg 0.60, $20 notional.
        position.apply_entry(20.0 / 0.60, 0.60);

        let tick = tick_on(&m, TokenSide::Yes, 0.84, 0.86);
        let action = s
            .on_position_update(&position, &ctx(&tick, &m))
            .expect("hedge");
        assert_eq!(action.kind, ActionKind::OpenLong);
        assert_eq!(action.token, TokenSide::No);
        assert!((action.size_usd - 6.60).abs() < 1e-6);
        assert_eq!(action.urgency, Urgency::High);
    }

    #[test]
    fn hedged_position_is_not_rehedged() {
        let m = market(1);
        let mut s = strategy();
        let mut position = Position::new("favorite_hedge", 1, "0xc1", "y1", TokenSide::Yes, 0);
        position.apply_entry(20.0 / 0.60, 0.60);
        position.spread_id = Some("spread-1".to_string());

        let tick = tick_on(&m, TokenSide::Yes, 0.88, 0.90);
        assert!(s.on_position_update(&position, &ctx(&tick, &m)).is_none());
    }

    #[test]
    fn stops_out_of_fading_favorite() {
        let m = market(1);
        let mut s = strategy();
        let mut position = Position::new("favorite_hedge", 1, "0xc1", "y1", TokenSide::Yes, 0);
        position.apply_entry(20.0 / 0.60, 0.60);

        let tick = tick_on(&m, TokenSide::Yes, 0.49, 0.51);
        let action = s
            .on_position_update(&position, &ctx(&tick, &m))
            .expect("stop");
        assert_eq!(action.kind, ActionKind::Close);
        assert_eq!(action.reason, "stop_loss");
    }
}
