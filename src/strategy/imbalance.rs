//! Book-imbalance entries.
//!
//! Buys a side when the top-of-book depth leans heavily toward the bids of
//! that side's token inside a price band. `book_imbalance` works the YES
//! ladder, `no_bias` mirrors it on NO with an optional seeded entry
//! probability to stagger correlated entries across instances.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{ConfigError, StrategyConfig};
use crate::models::{Action, TokenSide};
use crate::state::Position;

use super::params::ParamTable;
use super::{Strategy, StrategyCaps, TickContext};

const KNOWN_KEYS: &[&str] = &[
    "min_imbalance",
    "price_min",
    "price_max",
    "max_spread",
    "fixed_size_usd",
    "take_profit_pct",
    "stop_loss_pct",
    "exit_imbalance",
    "entry_probability",
    "max_position_usd",
    "max_positions",
];

#[derive(Debug, Clone)]
struct ImbalanceParams {
    min_imbalance: f64,
    price_min: f64,
    price_max: f64,
    fixed_size_usd: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    exit_imbalance: f64,
    entry_probability: f64,
}

struct ImbalanceCore {
    caps: StrategyCaps,
    params: ImbalanceParams,
    side: TokenSide,
    rng: ChaCha8Rng,
}

impl ImbalanceCore {
    fn from_config(
        name: &str,
        cfg: &StrategyConfig,
        side: TokenSide,
    ) -> Result<Self, ConfigError> {
        let table = ParamTable::new(name, &cfg.params, KNOWN_KEYS)?;
        let params = ImbalanceParams {
            min_imbalance: table.f64("min_imbalance", 0.5)?,
            price_min: table.f64("price_min", 0.35)?,
            price_max: table.f64("price_max", 0.75)?,
            fixed_size_usd: table.f64("fixed_size_usd", 10.0)?,
            take_profit_pct: table.f64("take_profit_pct", 0.08)?,
            stop_loss_pct: table.f64("stop_loss_pct", 0.06)?,
            exit_imbalance: table.f64("exit_imbalance", 0.0)?,
            entry_probability: table.f64("entry_probability", 1.0)?.clamp(0.0, 1.0),
        };

        let mut caps = StrategyCaps::new(name, "1.2.0");
        caps.max_spread = table.f64("max_spread", 0.03)?;
        caps.max_position_usd = table.f64("max_position_usd", caps.max_position_usd)?;
        caps.max_positions = table.u64("max_positions", caps.max_positions as u64)? as usize;

        Ok(Self {
            caps,
            params,
            side,
            rng: ChaCha8Rng::seed_from_u64(table.seed()?),
        })
    }

    fn entry(&mut self, ctx: &TickContext<'_>) -> Option<Action> {
        // Only the target side's own ladder is meaningful for the signal.
        if ctx.tick.token != self.side {
            return None;
        }
        let imbalance = ctx.tick.imbalance?;
        if imbalance < self.params.min_imbalance {
            return None;
        }
        let mid = ctx.tick.quotes(self.side).mid?;
        if mid < self.params.price_min || mid > self.params.price_max {
            return None;
        }
        if self.params.entry_probability < 1.0
            && self.rng.gen::<f64>() >= self.params.entry_probability
        {
            return None;
        }
        Some(Action::open_long(
            ctx.market.market_id,
            &ctx.market.condition_id,
            self.side,
            self.params.fixed_size_usd,
            format!("imbalance {imbalance:.2} at mid {mid:.3}"),
        ))
    }

    fn manage(&self, position: &Position, ctx: &TickContext<'_>) -> Option<Action> {
        let mid = ctx.tick.quotes(position.token).mid?;
        let avg = position.avg_entry_price;

        if mid >= avg * (1.0 + self.params.take_profit_pct) {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "take_profit",
            ));
        }
        if mid <= avg * (1.0 - self.params.stop_loss_pct) {
            return Some(Action::close(
                ctx.market.market_id,
                &ctx.market.condition_id,
                position.token,
                "stop_loss",
            ));
        }
        // Signal decay: the book flipped against us.
        if ctx.tick.token == position.token {
            if let Some(imbalance) = ctx.tick.imbalance {
                if imbalance < self.params.exit_imbalance {
                    return Some(Action::close(
                        ctx.market.market_id,
                        &ctx.market.condition_id,
                        position.token,
                        "imbalance_decay",
                    ));
                }
            }
        }
        None
    }
}

pub struct BookImbalance {
    core: ImbalanceCore,
}

impl BookImbalance {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            core: ImbalanceCore::from_config(name, cfg, TokenSide::Yes)?,
        })
    }
}

impl Strategy for BookImbalance {
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

pub struct NoBias {
    core: ImbalanceCore,
}

impl NoBias {
    pub fn from_config(name: &str, cfg: &StrategyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            core: ImbalanceCore::from_config(name, cfg, TokenSide::No)?,
        })
    }
}

impl Strategy for NoBias {
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
    use crate::models::ActionKind;
    use crate::strategy::testutil::{ctx, market, tick_on};

    fn strategy(min_imbalance: f64, size: f64) -> BookImbalance {
        let mut cfg = StrategyConfig::default();
        cfg.params.insert(
            "min_imbalance".to_string(),
            toml::Value::Float(min_imbalance),
        );
        cfg.params
            .insert("fixed_size_usd".to_string(), toml::Value::Float(size));
        BookImbalance::from_config("book_imbalance", &cfg).expect("build")
    }

    #[test]
    fn weak_imbalance_yields_no_action() {
        let m = market(1);
        let mut tick = tick_on(&m, TokenSide::Yes, 0.52, 0.54);
        tick.imbalance = Some((1300.0 - 500.0) / 1800.0); // ≈0.44

        let mut s = strategy(0.5, 1.1);
        assert!(s.on_tick(&ctx(&tick, &m)).is_none());
    }

    #[test]
    fn strong_imbalance_in_band_opens_long() {
        let m = market(1);
        let mut tick = tick_on(&m, TokenSide::Yes, 0.52, 0.54);
        tick.imbalance = Some((1500.0 - 200.0) / 1700.0); // ≈0.76

        let mut s = strategy(0.5, 1.1);
        let action = s.on_tick(&ctx(&tick, &m)).expect("action");
        assert_eq!(action.kind, ActionKind::OpenLong);
        assert_eq!(action.token, TokenSide::Yes);
        assert!((action.size_usd - 1.1).abs() < 1e-9);
    }

    #[test]
    fn entry_outside_price_band_is_skipped() {
        let m = market(1);
        let mut tick = tick_on(&m, TokenSide::Yes, 0.88, 0.90);
        tick.imbalance = Some(0.9);
        let mut s = strategy(0.5, 1.1);
        assert!(s.on_tick(&ctx(&tick, &m)).is_none());
    }

    #[test]
    fn take_profit_and_stop_loss_close() {
        let m = market(1);
        let mut s = strategy(0.5, 1.1);
        let mut position = Position::new("book_imbalance", 1, "0xc1", "y1", TokenSide::Yes, 0);
        position.apply_entry(10.0, 0.50);

        let mut up = tick_on(&m, TokenSide::Yes, 0.55, 0.57);
        up.imbalance = Some(0.5);
        let action = s.on_position_update(&position, &ctx(&up, &m)).expect("tp");
        assert_eq!(action.kind, ActionKind::Close);
        assert_eq!(action.reason, "take_profit");

        let mut down = tick_on(&m, TokenSide::Yes, 0.44, 0.46);
        down.imbalance = Some(0.5);
        let action = s.on_position_update(&position, &ctx(&down, &m)).expect("sl");
        assert_eq!(action.reason, "stop_loss");
    }

    #[test]
    fn imbalance_decay_closes() {
        let m = market(1);
        let mut s = strategy(0.5, 1.1);
        let mut position = Position::new("book_imbalance", 1, "0xc1", "y1", TokenSide::Yes, 0);
        position.apply_entry(10.0, 0.50);

        let mut flat = tick_on(&m, TokenSide::Yes, 0.50, 0.52);
        flat.imbalance = Some(-0.3);
        let action = s
            .on_position_update(&position, &ctx(&flat, &m))
            .expect("decay");
        assert_eq!(action.reason, "imbalance_decay");
    }

    #[test]
    fn no_bias_mirrors_on_no_token() {
        let m = market(1);
        let mut cfg = StrategyConfig::default();
        cfg.params
            .insert("min_imbalance".to_string(), toml::Value::Float(0.4));
        let mut s = NoBias::from_config("no_bias", &cfg).expect("build");

        let mut tick = tick_on(&m, TokenSide::No, 0.45, 0.47);
        tick.imbalance = Some(0.6);
        let action = s.on_tick(&ctx(&tick, &m)).expect("action");
        assert_eq!(action.token, TokenSide::No);

        // YES-token ticks are not its signal.
        let mut yes_tick = tick_on(&m, TokenSide::Yes, 0.53, 0.55);
        yes_tick.imbalance = Some(0.9);
        assert!(s.on_tick(&ctx(&yes_tick, &m)).is_none());
    }
}
