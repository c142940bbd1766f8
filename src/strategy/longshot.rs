//! Longshot buyers: cheap tails with positive tape.
//!
//! `longshot` buys any token trading under a ceiling price while the 60s
//! velocity points up; `map_longshot` is the same book restricted to
//! map-style esports formats, where tails reprice violently on round wins.

use crate::config::{ConfigError, StrategyConfig};
use crate::models::Action;
use crate::state::Position;

use super::params::ParamTable;
use super::{Strategy, StrategyCaps, TickContext};

const KNOWN_KEYS: &[&str] = &[
    "max_entry_price",
    "min_velocity",
    "fixed_size_usd",
    "take_profit_price",
    "stop_loss_price",
    "formats",
    "max_spread",
    "max_position_usd",
    "max_positions",
];

struct LongshotCore {
    caps: StrategyCaps,
    max_entry_price: f64,
    min_velocity: f64,
    fixed_size_usd: f64,
    take_profit_price: f64,
    stop_loss_price: f64,
}

impl LongshotCore {
    fn from_config(
        name: &str,
        cfg: &StrategyConfig,
        default_ceiling: f64,
        default_formats: &[&str],
    ) -> Result<Self, ConfigError> {
        let table = ParamTable::new(name, &cfg.params, KNOWN_KEYS)?;
        let mut caps = StrategyCaps::new(name, "0.9.2");
        caps.formats = table.string_list("formats", default_formats)?;
        caps.max_spread = table.f64("max_spread", 0.05)?;
        caps.max_position_usd = table.f64("max_position_usd", 25.0)?;
        caps.max_positions = table.u64("max_positions", caps.max_positions as u64)? as usize;

        Ok(Self {
            caps,
            max_entry_price: table.f64("max_entry_price", default_ceiling)?,
            min_velocity: table.f64("min_velocity", 0.0)?,
            fixed_size_usd: table.f64("fixed_size_usd", 5.0)?,
            take_profit_price: table.f64("take_profit_price", 0.35)?,
            stop_loss_price: table.f64("stop_loss_price", 0.02)?,
        })
    }

    fn entry(&self, ctx: &TickContext<'_>) -> Option<Action> {
        let mid = ctx.tick.event_mid()?;
        if mid > self.max_entry_price {
            return None;
        }
        let velocity = ctx.tick.velocity_1m?;
        if velocity <= self.min_velocity {
            return None;
        }
        Some(Action::open_long(
            ctx.market.market_id,
            &ctx.market.condition_id,
            ctx.tick.token,
            self.fixed_size_usd,
            format!("longshot at {mid:.3}, velocity {velocity:+.5}/s"),
        ))
    }

    fn manage(&self, position: &Position, ctx: &TickContext<'_>) -> Option<Action> {
        let mid = ctx.tick.quotes(position.token).mid?;
        if mid >= self.take_profit_price {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "take_profit",
            ));
        }
        if mid <= self.stop_loss_price {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "tail_collapsed",
            ));
        }
        None
    }
}

pub struct Longshot {
    core: LongshotCore,
}

impl Longshot {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            core: LongshotCore::from_config(name, cfg, 0.10, &[])?,
        })
    }
}

impl Strategy for Longshot {
    fn caps(&self) -> &StrategyCaps {
        &self.core.caps
    }

    fn on_tick(&mut self, ctx: &TickContext<'_>) -> Option<Action> {
        self.core.entry(ctx)
    }

    fn on_position_update(&mut self, position: &Position, ctx: &TickContext<'_>) -> Option<Action> {
        self.core.manage(position, ctx)
    }
}

pub struct MapLongshot {
    core: LongshotCore,
}

impl MapLongshot {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            core: LongshotCore::from_config(name, cfg, 0.15, &["map_winner"])?,
        })
    }
}

impl Strategy for MapLongshot {
    fn caps(&self) -> &StrategyCaps {
        &self.core.caps
    }

    fn on_tick(&mut self, ctx: &TickContext<'_>) -> Option<Action> {
        self.core.entry(ctx)
    }

    fn on_position_update(&mut self, position: &Position, ctx: &TickContext<'_>) -> Option<Action> {
        self.core.manage(position, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, TokenSide};
    use crate::strategy::testutil::{ctx, market, tick_on};

    #[test]
    fn buys_cheap_tail_with_positive_velocity() {
        let m = market(1);
        let mut s = Longshot::from_config("longshot", &StrategyConfig::default()).expect("build");

        let mut tick = tick_on(&m, TokenSide::Yes, 0.07, 0.09);
        tick.velocity_1m = Some(0.0004);
        let action = s.on_tick(&ctx(&tick, &m)).expect("entry");
        assert_eq!(action.kind, ActionKind::OpenLong);

        tick.velocity_1m = Some(-0.0001);
        assert!(s.on_tick(&ctx(&tick, &m)).is_none());
        tick.velocity_1m = None;
        assert!(s.on_tick(&ctx(&tick, &m)).is_none());
    }

    #[test]
    fn ceiling_price_is_respected() {
        let m = market(1);
        let mut s = Longshot::from_config("longshot", &StrategyConfig::default()).expect("build");
        let mut tick = tick_on(&m, TokenSide::Yes, 0.14, 0.16);
        tick.velocity_1m = Some(0.001);
        assert!(s.on_tick(&ctx(&tick, &m)).is_none());
    }

    #[test]
    fn map_variant_declares_format_caps() {
        let s =
            MapLongshot::from_config("map_longshot", &StrategyConfig::default()).expect("build");
        assert_eq!(s.caps().formats, vec!["map_winner".to_string()]);
    }

    #[test]
    fn exits_on_repricing_or_collapse() {
        let m = market(1);
        let mut s = Longshot::from_config("longshot", &StrategyConfig::default()).expect("build");
        let mut position = Position::new("longshot", 1, "0xc1", "y1", TokenSide::Yes, 0);
        position.apply_entry(50.0, 0.08);

        let up = tick_on(&m, TokenSide::Yes, 0.36, 0.38);
        assert_eq!(
            s.on_position_update(&position, &ctx(&up, &m)).unwrap().reason,
            "take_profit"
        );

        let down = tick_on(&m, TokenSide::Yes, 0.01, 0.03);
        assert_eq!(
            s.on_position_update(&position, &ctx(&down, &m)).unwrap().reason,
            "tail_collapsed"
        );
    }
}
