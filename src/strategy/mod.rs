//! Strategy Runtime.
//!
//! Strategies are pure decision producers: `on_tick` proposes entries when
//! the strategy holds nothing on the market, `on_position_update` manages
//! an open position. Both see an immutable tick context and return at most
//! one action. No I/O, no clocks; randomness is seeded at construction so
//! the same inputs always yield the same action.

pub mod params;

mod favorite_hedge;
mod imbalance;
mod longshot;
mod mean_reversion;
mod scalp;
mod swing_rebalance;

pub use favorite_hedge::FavoriteHedge;
pub use imbalance::{BookImbalance, NoBias};
pub use longshot::{Longshot, MapLongshot};
pub use mean_reversion::MeanReversion;
pub use scalp::Scalp;
pub use swing_rebalance::SwingRebalance;

use std::collections::BTreeMap;

use crate::config::{ConfigError, StrategyConfig};
use crate::models::{Action, MarketInfo, Tick};
use crate::state::Position;

/// Static capability declarations, read by the router (filtering) and the
/// execution pipeline (sizing caps).
#[derive(Debug, Clone)]
pub struct StrategyCaps {
    pub name: String,
    pub version: &'static str,
    /// Accepted market formats; empty accepts all.
    pub formats: Vec<String>,
    /// Accepted market types; empty accepts all.
    pub market_types: Vec<String>,
    pub max_position_usd: f64,
    pub max_positions: usize,
    pub min_spread: f64,
    pub max_spread: f64,
}

impl StrategyCaps {
    pub fn new(name: &str, version: &'static str) -> Self {
        Self {
            name: name.to_string(),
            version,
            formats: Vec::new(),
            market_types: Vec::new(),
            max_position_usd: 100.0,
            max_positions: 5,
            min_spread: 0.0,
            max_spread: 0.10,
        }
    }
}

/// Read-only view of the strategy's accounting, captured at dispatch time.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyStateView {
    pub available_usd: f64,
    pub equity: f64,
    pub open_positions: usize,
}

/// Everything a strategy may look at for one tick.
pub struct TickContext<'a> {
    pub tick: &'a Tick,
    pub market: &'a MarketInfo,
    pub state: StrategyStateView,
}

pub trait Strategy: Send {
    fn caps(&self) -> &StrategyCaps;

    /// Extra pre-filter on top of the declared capability filter.
    fn filter_tick(&self, _tick: &Tick) -> bool {
        true
    }

    /// Entry path: invoked only when no open position exists for
    /// `(strategy, market)`.
    fn on_tick(&mut self, ctx: &TickContext<'_>) -> Option<Action>;

    /// Management path: invoked only when an open position exists.
    fn on_position_update(&mut self, position: &Position, ctx: &TickContext<'_>) -> Option<Action>;
}

type Factory = fn(&str, &StrategyConfig) -> Result<Box<dyn Strategy>, ConfigError>;

/// Maps variant names to factories. Unknown names and unknown parameter
/// keys are configuration errors, fatal at boot.
pub struct StrategyRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl StrategyRegistry {
    pub fn builtin() -> Self {
        let mut factories: BTreeMap<&'static str, Factory> = BTreeMap::new();
        factories.insert("scalp", |name, cfg| {
            Ok(Box::new(Scalp::from_config(name, cfg)?))
        });
        factories.insert("favorite_hedge", |name, cfg| {
            Ok(Box::new(FavoriteHedge::from_config(name, cfg)?))
        });
        factories.insert("swing_rebalance", |name, cfg| {
            Ok(Box::new(SwingRebalance::from_config(name, cfg)?))
        });
        factories.insert("map_longshot", |name, cfg| {
            Ok(Box::new(MapLongshot::from_config(name, cfg)?))
        });
        factories.insert("longshot", |name, cfg| {
            Ok(Box::new(Longshot::from_config(name, cfg)?))
        });
        factories.insert("book_imbalance", |name, cfg| {
            Ok(Box::new(BookImbalance::from_config(name, cfg)?))
        });
        factories.insert("no_bias", |name, cfg| {
            Ok(Box::new(NoBias::from_config(name, cfg)?))
        });
        factories.insert("mean_reversion", |name, cfg| {
            Ok(Box::new(MeanReversion::from_config(name, cfg)?))
        });
        Self { factories }
    }

    pub fn known_names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn build(
        &self,
        name: &str,
        cfg: &StrategyConfig,
    ) -> Result<Box<dyn Strategy>, ConfigError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "unknown strategy '{name}' (known: {})",
                self.known_names().join(", ")
            ))
        })?;
        factory(name, cfg)
    }

    /// Build every enabled strategy from the configuration.
    pub fn build_enabled(
        &self,
        strategies: &BTreeMap<String, StrategyConfig>,
    ) -> Result<Vec<Box<dyn Strategy>>, ConfigError> {
        let mut built = Vec::new();
        for (name, cfg) in strategies {
            if !cfg.enabled {
                continue;
            }
            built.push(self.build(name, cfg)?);
        }
        Ok(built)
    }
}
