//! State Manager: authoritative accounting.
//!
//! Owns positions, spreads, per-strategy capital, cooldowns, and the
//! decision log. All mutations for one `(strategy, market)` key run under
//! that key's async mutex, held across the cache update and the store
//! write, so no two fills for the same key interleave. Reads are served
//! from in-memory caches as cloned snapshots and never lock writers out.

pub mod accounts;
pub mod position;
pub mod store;

pub use accounts::{StrategyState, ACCOUNTING_EPSILON};
pub use position::{
    DecisionStatus, Fill, Position, PositionLeg, PositionStatus, Spread, SpreadStatus,
    TradeDecision, SHARE_EPSILON,
};
pub use store::StateStore;

use anyhow::{anyhow, Result};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::models::{TokenSide, TradeSide};

type MarketKey = (String, i64);
type PositionKey = (String, i64, TokenSide);

#[derive(Default)]
struct Caches {
    /// Open positions and recently-terminal ones kept for reporting.
    positions: HashMap<String, Position>,
    open_by_key: HashMap<PositionKey, String>,
    spreads: HashMap<String, Spread>,
    open_spread_by_key: HashMap<MarketKey, String>,
    strategies: HashMap<String, StrategyState>,
    cooldowns: HashMap<MarketKey, i64>,
    recent_orders: HashMap<(String, String), i64>,
}

pub struct StateManager {
    store: StateStore,
    caches: RwLock<Caches>,
    write_locks: SyncMutex<HashMap<MarketKey, Arc<AsyncMutex<()>>>>,
}

impl StateManager {
    /// Open against the store and rebuild the in-memory caches.
    pub async fn open(store: StateStore) -> Result<Arc<Self>> {
        let mut caches = Caches::default();

        for state in store.load_strategy_states().await? {
            caches.strategies.insert(state.strategy.clone(), state);
        }
        for position in store.load_open_positions().await? {
            caches.open_by_key.insert(
                (position.strategy.clone(), position.market_id, position.token),
                position.id.clone(),
            );
            caches.positions.insert(position.id.clone(), position);
        }
        for spread in store.load_open_spreads().await? {
            caches
                .open_spread_by_key
                .insert((spread.strategy.clone(), spread.market_id), spread.id.clone());
            caches.spreads.insert(spread.id.clone(), spread);
        }
        for (strategy, market_id, ts) in store.load_cooldowns().await? {
            caches.cooldowns.insert((strategy, market_id), ts);
        }
        for (strategy, token_id, ts) in store.load_recent_orders().await? {
            caches.recent_orders.insert((strategy, token_id), ts);
        }

        info!(
            strategies = caches.strategies.len(),
            open_positions = caches.positions.len(),
            open_spreads = caches.spreads.len(),
            "state manager loaded"
        );

        Ok(Arc::new(Self {
            store,
            caches: RwLock::new(caches),
            write_locks: SyncMutex::new(HashMap::new()),
        }))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn key_lock(&self, strategy: &str, market_id: i64) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .lock()
            .entry((strategy.to_string(), market_id))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Strategy accounts
    // ------------------------------------------------------------------

    /// Create the accounting bucket if absent; re-point the allocation if
    /// the configuration changed it.
    pub async fn register_strategy(&self, name: &str, allocation_usd: f64) -> Result<()> {
        let state = {
            let mut caches = self.caches.write();
            match caches.strategies.get_mut(name) {
                Some(existing) => {
                    if (existing.allocated_usd - allocation_usd).abs() > f64::EPSILON {
                        let delta = allocation_usd - existing.allocated_usd;
                        existing.allocated_usd = allocation_usd;
                        existing.available_usd = (existing.available_usd + delta).max(0.0);
                        existing.high_water_mark = existing.high_water_mark.max(existing.equity());
                    }
                    existing.clone()
                }
                None => {
                    let state = StrategyState::new(name, allocation_usd);
                    caches.strategies.insert(name.to_string(), state.clone());
                    state
                }
            }
        };
        self.store.upsert_strategy_state(&state).await
    }

    pub fn strategy_state(&self, name: &str) -> Option<StrategyState> {
        self.caches.read().strategies.get(name).cloned()
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.caches.read().strategies.keys().cloned().collect()
    }

    pub fn has_capacity(&self, strategy: &str, size_usd: f64) -> bool {
        self.caches
            .read()
            .strategies
            .get(strategy)
            .map(|s| s.is_active && s.available_usd >= size_usd)
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Read snapshots
    // ------------------------------------------------------------------

    pub fn get_position(&self, strategy: &str, market_id: i64, token: TokenSide) -> Option<Position> {
        let caches = self.caches.read();
        let id = caches
            .open_by_key
            .get(&(strategy.to_string(), market_id, token))?;
        caches.positions.get(id).cloned()
    }

    pub fn position_by_id(&self, position_id: &str) -> Option<Position> {
        self.caches.read().positions.get(position_id).cloned()
    }

    /// All open positions a strategy holds on one market (either side).
    pub fn open_positions_on(&self, strategy: &str, market_id: i64) -> Vec<Position> {
        let caches = self.caches.read();
        [TokenSide::Yes, TokenSide::No]
            .into_iter()
            .filter_map(|side| {
                caches
                    .open_by_key
                    .get(&(strategy.to_string(), market_id, side))
                    .and_then(|id| caches.positions.get(id))
                    .cloned()
            })
            .collect()
    }

    pub fn open_position_count(&self, strategy: &str) -> usize {
        self.caches
            .read()
            .open_by_key
            .keys()
            .filter(|(s, _, _)| s == strategy)
            .count()
    }

    pub fn open_position_count_total(&self) -> usize {
        self.caches.read().open_by_key.len()
    }

    /// Sum of open cost bases for one strategy.
    pub fn total_exposure(&self, strategy: &str) -> f64 {
        let caches = self.caches.read();
        caches
            .open_by_key
            .iter()
            .filter(|((s, _, _), _)| s == strategy)
            .filter_map(|(_, id)| caches.positions.get(id))
            .map(|p| p.cost_basis)
            .sum()
    }

    pub fn get_spread(&self, strategy: &str, market_id: i64) -> Option<Spread> {
        let caches = self.caches.read();
        let id = caches
            .open_spread_by_key
            .get(&(strategy.to_string(), market_id))?;
        caches.spreads.get(id).cloned()
    }

    // ------------------------------------------------------------------
    // Cooldowns & recent orders
    // ------------------------------------------------------------------

    pub fn is_in_cooldown(
        &self,
        strategy: &str,
        market_id: i64,
        cooldown_minutes: f64,
        now_ms: i64,
    ) -> bool {
        let caches = self.caches.read();
        let Some(last_entry) = caches
            .cooldowns
            .get(&(strategy.to_string(), market_id))
            .copied()
        else {
            return false;
        };
        let cooldown_ms = (cooldown_minutes * 60_000.0) as i64;
        now_ms - last_entry <= cooldown_ms
    }

    /// Recorded at execution success; readable immediately.
    pub async fn set_cooldown(&self, strategy: &str, market_id: i64, now_ms: i64) -> Result<()> {
        self.caches
            .write()
            .cooldowns
            .insert((strategy.to_string(), market_id), now_ms);
        self.store.upsert_cooldown(strategy, market_id, now_ms).await
    }

    pub fn last_order_at(&self, strategy: &str, token_id: &str) -> Option<i64> {
        self.caches
            .read()
            .recent_orders
            .get(&(strategy.to_string(), token_id.to_string()))
            .copied()
    }

    pub async fn note_order(&self, strategy: &str, token_id: &str, now_ms: i64) -> Result<()> {
        self.caches
            .write()
            .recent_orders
            .insert((strategy.to_string(), token_id.to_string()), now_ms);
        self.store.upsert_recent_order(strategy, token_id, now_ms).await
    }

    // ------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------

    pub async fn record_decision(&self, decision: &TradeDecision) -> Result<()> {
        self.store.insert_decision(decision).await
    }

    pub async fn finalize_decision(
        &self,
        id: &str,
        status: DecisionStatus,
        rejection_reason: Option<&str>,
        execution_price: Option<f64>,
        position_id: Option<&str>,
    ) -> Result<()> {
        self.store
            .finalize_decision(id, status, rejection_reason, execution_price, position_id)
            .await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Apply a confirmed fill for `(strategy, market)`. Serialized per key.
    pub async fn record_fill(
        &self,
        strategy: &str,
        market_id: i64,
        condition_id: &str,
        token_id: &str,
        fill: &Fill,
    ) -> Result<Position> {
        let lock = self.key_lock(strategy, market_id);
        let _guard = lock.lock().await;
        self.record_fill_locked(strategy, market_id, condition_id, token_id, fill)
            .await
    }

    async fn record_fill_locked(
        &self,
        strategy: &str,
        market_id: i64,
        condition_id: &str,
        token_id: &str,
        fill: &Fill,
    ) -> Result<Position> {
        if !(fill.shares > 0.0) || !(fill.price > 0.0 && fill.price < 1.0) {
            return Err(anyhow!(
                "invalid fill: {} shares at {}",
                fill.shares,
                fill.price
            ));
        }

        let key: PositionKey = (strategy.to_string(), market_id, fill.token);

        // Work on clones; caches are swapped only after the store accepts.
        let (mut position, created) = {
            let caches = self.caches.read();
            match caches
                .open_by_key
                .get(&key)
                .and_then(|id| caches.positions.get(id))
            {
                Some(p) => (p.clone(), false),
                None => {
                    if fill.side == TradeSide::Sell {
                        return Err(anyhow!(
                            "sell fill without open position for {strategy}/{market_id}/{}",
                            fill.token.as_str()
                        ));
                    }
                    (
                        Position::new(
                            strategy,
                            market_id,
                            condition_id,
                            token_id,
                            fill.token,
                            fill.ts_ms,
                        ),
                        true,
                    )
                }
            }
        };

        let mut strategy_state = self
            .caches
            .read()
            .strategies
            .get(strategy)
            .cloned()
            .ok_or_else(|| anyhow!("unknown strategy {strategy}"))?;

        let leg = match fill.side {
            TradeSide::Buy => {
                position.apply_entry(fill.shares, fill.price);
                strategy_state.debit_entry(fill.notional_usd(), fill.fees_usd);
                PositionLeg::entry(&position.id, fill.shares, fill.price, fill.ts_ms, &fill.reason)
            }
            TradeSide::Sell => {
                let cost_before = position.cost_basis;
                let shares = fill.shares.min(position.remaining_shares);
                let realized = position.apply_exit(shares, fill.price, fill.ts_ms, &fill.reason);
                let proceeds = shares * fill.price;
                strategy_state.credit_exit(proceeds, realized, fill.fees_usd);
                PositionLeg::exit(
                    &position.id,
                    shares,
                    fill.price,
                    position.cost_basis - cost_before,
                    fill.ts_ms,
                    &fill.reason,
                )
            }
        };

        // Durable writes before the caches observe the new state.
        self.store.upsert_position(&position).await?;
        self.store.insert_leg(&leg).await?;
        self.store.upsert_strategy_state(&strategy_state).await?;

        {
            let mut caches = self.caches.write();
            if position.is_open() {
                caches.open_by_key.insert(key.clone(), position.id.clone());
            } else {
                caches.open_by_key.remove(&key);
            }
            caches.positions.insert(position.id.clone(), position.clone());
            caches
                .strategies
                .insert(strategy.to_string(), strategy_state);
        }

        if created {
            self.maybe_link_spread(&position).await?;
        } else {
            self.refresh_spread_of(&position).await?;
        }

        Ok(self
            .position_by_id(&position.id)
            .unwrap_or(position))
    }

    /// Close a position entirely at `exit_price`. Serialized per key.
    pub async fn close_position(
        &self,
        position_id: &str,
        exit_price: f64,
        reason: &str,
        ts_ms: i64,
    ) -> Result<Position> {
        let position = self
            .position_by_id(position_id)
            .ok_or_else(|| anyhow!("unknown position {position_id}"))?;
        if !position.is_open() {
            return Err(anyhow!("position {position_id} is not open"));
        }
        let fill = Fill {
            token: position.token,
            side: TradeSide::Sell,
            price: exit_price,
            shares: position.remaining_shares,
            fees_usd: 0.0,
            order_id: None,
            ts_ms,
            reason: reason.to_string(),
        };
        self.record_fill(
            &position.strategy.clone(),
            position.market_id,
            &position.condition_id.clone(),
            &position.token_id.clone(),
            &fill,
        )
        .await
    }

    /// Settle every open position on a resolved market. YES outcome pays
    /// $1/share on YES tokens and $0 on NO, and vice versa.
    pub async fn apply_resolution(
        &self,
        market_id: i64,
        outcome: TokenSide,
        ts_ms: i64,
    ) -> Result<Vec<Position>> {
        let holders: Vec<(String, String)> = {
            let caches = self.caches.read();
            caches
                .open_by_key
                .iter()
                .filter(|((_, m, _), _)| *m == market_id)
                .map(|((s, _, _), id)| (s.clone(), id.clone()))
                .collect()
        };

        let mut settled = Vec::with_capacity(holders.len());
        for (strategy, position_id) in holders {
            let lock = self.key_lock(&strategy, market_id);
            let _guard = lock.lock().await;

            let Some(mut position) = self.position_by_id(&position_id) else {
                continue;
            };
            if !position.is_open() {
                continue;
            }
            let Some(mut strategy_state) = self.strategy_state(&strategy) else {
                warn!(strategy = %strategy, "resolution for unregistered strategy");
                continue;
            };

            let shares = position.remaining_shares;
            let avg = position.avg_entry_price;
            let proceeds = position.apply_resolution(outcome, ts_ms);
            let realized = shares * ((if position.token == outcome { 1.0 } else { 0.0 }) - avg);

            strategy_state.available_usd += proceeds;
            strategy_state.record_realized(realized, true);

            let leg = PositionLeg::exit(
                &position.id,
                shares,
                if position.token == outcome { 1.0 } else { 0.0 },
                -(shares * avg),
                ts_ms,
                position.close_reason.as_deref().unwrap_or("resolved"),
            );

            self.store.upsert_position(&position).await?;
            self.store.insert_leg(&leg).await?;
            self.store.upsert_strategy_state(&strategy_state).await?;

            {
                let mut caches = self.caches.write();
                caches
                    .open_by_key
                    .remove(&(strategy.clone(), market_id, position.token));
                caches.positions.insert(position.id.clone(), position.clone());
                caches.strategies.insert(strategy.clone(), strategy_state);
            }
            self.refresh_spread_of(&position).await?;
            settled.push(position);
        }

        Ok(settled)
    }

    /// Link freshly-opened opposite-side positions into a spread.
    async fn maybe_link_spread(&self, position: &Position) -> Result<()> {
        let opposite = self.get_position(
            &position.strategy,
            position.market_id,
            position.token.opposite(),
        );
        let Some(opposite) = opposite else {
            return Ok(());
        };
        if position.spread_id.is_some() || opposite.spread_id.is_some() {
            return Ok(());
        }

        let (yes, no) = match position.token {
            TokenSide::Yes => (position.clone(), opposite),
            TokenSide::No => (opposite, position.clone()),
        };
        let spread = Spread::link(&yes, &no, position.opened_at_ms);

        let mut yes = yes;
        let mut no = no;
        yes.spread_id = Some(spread.id.clone());
        no.spread_id = Some(spread.id.clone());

        self.store.upsert_spread(&spread).await?;
        self.store.upsert_position(&yes).await?;
        self.store.upsert_position(&no).await?;

        let mut caches = self.caches.write();
        caches
            .open_spread_by_key
            .insert((spread.strategy.clone(), spread.market_id), spread.id.clone());
        caches.positions.insert(yes.id.clone(), yes);
        caches.positions.insert(no.id.clone(), no);
        caches.spreads.insert(spread.id.clone(), spread);
        Ok(())
    }

    /// Keep a spread's aggregates in sync with its legs; close it once
    /// both legs are terminal.
    async fn refresh_spread_of(&self, position: &Position) -> Result<()> {
        let Some(spread_id) = position.spread_id.clone() else {
            return Ok(());
        };
        let Some(mut spread) = self.caches.read().spreads.get(&spread_id).cloned() else {
            return Ok(());
        };

        let legs: Vec<Position> = spread
            .position_ids()
            .iter()
            .filter_map(|id| self.position_by_id(id))
            .collect();
        spread.cost_basis = legs.iter().map(|p| p.cost_basis).sum();
        spread.realized_pnl = legs.iter().map(|p| p.realized_pnl).sum();
        let all_terminal = legs.len() == 2 && legs.iter().all(|p| !p.is_open());
        if all_terminal {
            spread.status = SpreadStatus::Closed;
        }

        self.store.upsert_spread(&spread).await?;

        let mut caches = self.caches.write();
        if all_terminal {
            caches
                .open_spread_by_key
                .remove(&(spread.strategy.clone(), spread.market_id));
        }
        caches.spreads.insert(spread.id.clone(), spread);
        Ok(())
    }

    /// Fail-closed marker for mutations that could not complete; the
    /// restart path reconciles from exchange truth plus the decision log.
    pub async fn mark_inconsistency(&self, kind: &str, payload: serde_json::Value) {
        if let Err(e) = self.store.insert_reconcile_marker(kind, &payload).await {
            warn!(error = %e, kind = %kind, "failed to persist reconcile marker");
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Dashboard snapshot. `mark` supplies a mid price per token id for
    /// unrealized PnL; unknown tokens fall back to entry price.
    pub fn stats_snapshot(&self, mark: impl Fn(&str) -> Option<f64>) -> serde_json::Value {
        let caches = self.caches.read();
        let strategies: Vec<serde_json::Value> = caches
            .strategies
            .values()
            .map(|s| {
                let open: Vec<&Position> = caches
                    .open_by_key
                    .iter()
                    .filter(|((name, _, _), _)| name == &s.strategy)
                    .filter_map(|(_, id)| caches.positions.get(id))
                    .collect();
                let unrealized: f64 = open
                    .iter()
                    .map(|p| p.unrealized_pnl(mark(&p.token_id).unwrap_or(p.avg_entry_price)))
                    .sum();
                serde_json::json!({
                    "strategy": s.strategy,
                    "allocated_usd": s.allocated_usd,
                    "available_usd": s.available_usd,
                    "equity": s.equity(),
                    "realized_pnl": s.total_realized_pnl,
                    "unrealized_pnl": unrealized,
                    "open_positions": open.len(),
                    "trade_count": s.trade_count,
                    "win_rate": s.win_rate(),
                    "high_water_mark": s.high_water_mark,
                    "max_drawdown": s.max_drawdown,
                    "drawdown_pct": s.drawdown_pct(),
                    "is_active": s.is_active,
                })
            })
            .collect();

        serde_json::json!({
            "strategies": strategies,
            "open_positions_total": caches.open_by_key.len(),
            "open_spreads_total": caches.open_spread_by_key.len(),
        })
    }
}
