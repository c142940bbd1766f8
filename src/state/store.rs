//! SQLite persistence for the state manager.
//!
//! WAL-journaled single connection behind an async mutex. In-memory maps
//! are accelerators only; everything here is the durable source of truth
//! and rebuilds them on startup. The decision log is append-only except
//! for the pending→final transition of live submissions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{ActionKind, MarketInfo, MarketStatus, TokenSide};

use super::accounts::StrategyState;
use super::position::{
    DecisionStatus, Position, PositionLeg, PositionStatus, Spread, SpreadStatus, TradeDecision,
};

#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open state db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory state db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                condition_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                token TEXT NOT NULL,
                avg_entry_price REAL NOT NULL,
                remaining_shares REAL NOT NULL,
                cost_basis REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                status TEXT NOT NULL,
                spread_id TEXT,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                close_reason TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_key
             ON positions(strategy, market_id, token, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS position_legs (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                delta_shares REAL NOT NULL,
                price REAL NOT NULL,
                cost_delta REAL NOT NULL,
                trigger_reason TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_legs_position ON position_legs(position_id, ts ASC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS spreads (
                id TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                condition_id TEXT NOT NULL,
                yes_position_id TEXT NOT NULL,
                no_position_id TEXT NOT NULL,
                cost_basis REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                status TEXT NOT NULL,
                opened_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_spreads_key ON spreads(strategy, market_id, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategy_state (
                strategy TEXT PRIMARY KEY,
                allocated_usd REAL NOT NULL,
                available_usd REAL NOT NULL,
                total_realized_pnl REAL NOT NULL,
                total_unrealized_pnl REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                win_count INTEGER NOT NULL,
                loss_count INTEGER NOT NULL,
                high_water_mark REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                is_active INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_decisions (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                strategy TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                condition_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                action TEXT NOT NULL,
                size_usd REAL NOT NULL,
                inputs TEXT NOT NULL,
                status TEXT NOT NULL,
                rejection_reason TEXT,
                execution_price REAL,
                position_id TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_decisions_ts ON trade_decisions(ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_decisions_key
             ON trade_decisions(strategy, market_id, ts DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cooldowns (
                strategy TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                last_entry_at INTEGER NOT NULL,
                PRIMARY KEY (strategy, market_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS recent_orders (
                strategy TEXT NOT NULL,
                token_id TEXT NOT NULL,
                last_order_at INTEGER NOT NULL,
                PRIMARY KEY (strategy, token_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS markets (
                id INTEGER PRIMARY KEY,
                condition_id TEXT NOT NULL,
                question TEXT NOT NULL DEFAULT '',
                yes_token_id TEXT NOT NULL,
                no_token_id TEXT NOT NULL,
                category TEXT,
                format TEXT,
                market_type TEXT,
                end_date TEXT,
                status TEXT NOT NULL,
                accepting_orders INTEGER NOT NULL DEFAULT 1,
                resolved_outcome TEXT,
                liquidity_usd REAL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS reconcile_markers (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS engine_stats (
                ts INTEGER PRIMARY KEY,
                snapshot TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Positions & legs
    // ------------------------------------------------------------------

    pub async fn upsert_position(&self, p: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions \
             (id, strategy, market_id, condition_id, token_id, token, avg_entry_price, \
              remaining_shares, cost_basis, realized_pnl, status, spread_id, opened_at, \
              closed_at, close_reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
             ON CONFLICT(id) DO UPDATE SET \
                avg_entry_price = excluded.avg_entry_price, \
                remaining_shares = excluded.remaining_shares, \
                cost_basis = excluded.cost_basis, \
                realized_pnl = excluded.realized_pnl, \
                status = excluded.status, \
                spread_id = excluded.spread_id, \
                closed_at = excluded.closed_at, \
                close_reason = excluded.close_reason",
            params![
                &p.id,
                &p.strategy,
                p.market_id,
                &p.condition_id,
                &p.token_id,
                p.token.as_str(),
                p.avg_entry_price,
                p.remaining_shares,
                p.cost_basis,
                p.realized_pnl,
                p.status.as_str(),
                p.spread_id.as_deref(),
                p.opened_at_ms,
                p.closed_at_ms,
                p.close_reason.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
        let token: String = row.get(5)?;
        let status: String = row.get(10)?;
        Ok(Position {
            id: row.get(0)?,
            strategy: row.get(1)?,
            market_id: row.get(2)?,
            condition_id: row.get(3)?,
            token_id: row.get(4)?,
            token: TokenSide::parse(&token).unwrap_or(TokenSide::Yes),
            avg_entry_price: row.get(6)?,
            remaining_shares: row.get(7)?,
            cost_basis: row.get(8)?,
            realized_pnl: row.get(9)?,
            status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Closed),
            spread_id: row.get(11)?,
            opened_at_ms: row.get(12)?,
            closed_at_ms: row.get(13)?,
            close_reason: row.get(14)?,
        })
    }

    const POSITION_COLS: &'static str = "id, strategy, market_id, condition_id, token_id, token, \
        avg_entry_price, remaining_shares, cost_basis, realized_pnl, status, spread_id, \
        opened_at, closed_at, close_reason";

    pub async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE status = 'open' ORDER BY opened_at ASC",
            Self::POSITION_COLS
        ))?;
        let rows = stmt.query_map([], Self::position_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE id = ?1 LIMIT 1",
            Self::POSITION_COLS
        ))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::position_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn insert_leg(&self, leg: &PositionLeg) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO position_legs (id, position_id, ts, delta_shares, price, cost_delta, trigger_reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &leg.id,
                &leg.position_id,
                leg.ts_ms,
                leg.delta_shares,
                leg.price,
                leg.cost_delta,
                &leg.trigger_reason,
            ],
        )?;
        Ok(())
    }

    pub async fn load_legs(&self, position_id: &str) -> Result<Vec<PositionLeg>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, position_id, ts, delta_shares, price, cost_delta, trigger_reason \
             FROM position_legs WHERE position_id = ?1 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![position_id], |row| {
            Ok(PositionLeg {
                id: row.get(0)?,
                position_id: row.get(1)?,
                ts_ms: row.get(2)?,
                delta_shares: row.get(3)?,
                price: row.get(4)?,
                cost_delta: row.get(5)?,
                trigger_reason: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Spreads
    // ------------------------------------------------------------------

    pub async fn upsert_spread(&self, s: &Spread) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO spreads \
             (id, strategy, market_id, condition_id, yes_position_id, no_position_id, \
              cost_basis, realized_pnl, status, opened_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(id) DO UPDATE SET \
                cost_basis = excluded.cost_basis, \
                realized_pnl = excluded.realized_pnl, \
                status = excluded.status",
            params![
                &s.id,
                &s.strategy,
                s.market_id,
                &s.condition_id,
                &s.yes_position_id,
                &s.no_position_id,
                s.cost_basis,
                s.realized_pnl,
                s.status.as_str(),
                s.opened_at_ms,
            ],
        )?;
        Ok(())
    }

    pub async fn load_open_spreads(&self) -> Result<Vec<Spread>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy, market_id, condition_id, yes_position_id, no_position_id, \
                    cost_basis, realized_pnl, status, opened_at \
             FROM spreads WHERE status = 'open'",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(8)?;
            Ok(Spread {
                id: row.get(0)?,
                strategy: row.get(1)?,
                market_id: row.get(2)?,
                condition_id: row.get(3)?,
                yes_position_id: row.get(4)?,
                no_position_id: row.get(5)?,
                cost_basis: row.get(6)?,
                realized_pnl: row.get(7)?,
                status: SpreadStatus::parse(&status).unwrap_or(SpreadStatus::Closed),
                opened_at_ms: row.get(9)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Strategy state
    // ------------------------------------------------------------------

    pub async fn upsert_strategy_state(&self, s: &StrategyState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_state \
             (strategy, allocated_usd, available_usd, total_realized_pnl, total_unrealized_pnl, \
              trade_count, win_count, loss_count, high_water_mark, max_drawdown, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(strategy) DO UPDATE SET \
                allocated_usd = excluded.allocated_usd, \
                available_usd = excluded.available_usd, \
                total_realized_pnl = excluded.total_realized_pnl, \
                total_unrealized_pnl = excluded.total_unrealized_pnl, \
                trade_count = excluded.trade_count, \
                win_count = excluded.win_count, \
                loss_count = excluded.loss_count, \
                high_water_mark = excluded.high_water_mark, \
                max_drawdown = excluded.max_drawdown, \
                is_active = excluded.is_active",
            params![
                &s.strategy,
                s.allocated_usd,
                s.available_usd,
                s.total_realized_pnl,
                s.total_unrealized_pnl,
                s.trade_count as i64,
                s.win_count as i64,
                s.loss_count as i64,
                s.high_water_mark,
                s.max_drawdown,
                s.is_active as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn load_strategy_states(&self) -> Result<Vec<StrategyState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT strategy, allocated_usd, available_usd, total_realized_pnl, \
                    total_unrealized_pnl, trade_count, win_count, loss_count, \
                    high_water_mark, max_drawdown, is_active \
             FROM strategy_state ORDER BY strategy ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StrategyState {
                strategy: row.get(0)?,
                allocated_usd: row.get(1)?,
                available_usd: row.get(2)?,
                total_realized_pnl: row.get(3)?,
                total_unrealized_pnl: row.get(4)?,
                trade_count: row.get::<_, i64>(5)? as u64,
                win_count: row.get::<_, i64>(6)? as u64,
                loss_count: row.get::<_, i64>(7)? as u64,
                high_water_mark: row.get(8)?,
                max_drawdown: row.get(9)?,
                is_active: row.get::<_, i64>(10)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------

    pub async fn insert_decision(&self, d: &TradeDecision) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trade_decisions \
             (id, ts, strategy, market_id, condition_id, token_id, action, size_usd, inputs, \
              status, rejection_reason, execution_price, position_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &d.id,
                d.ts_ms,
                &d.strategy,
                d.market_id,
                &d.condition_id,
                &d.token_id,
                d.action.as_str(),
                d.size_usd,
                d.inputs.to_string(),
                d.status.as_str(),
                d.rejection_reason.as_deref(),
                d.execution_price,
                d.position_id.as_deref(),
            ],
        )?;
        Ok(())
    }

    /// Pending→final transition for live submissions.
    pub async fn finalize_decision(
        &self,
        id: &str,
        status: DecisionStatus,
        rejection_reason: Option<&str>,
        execution_price: Option<f64>,
        position_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trade_decisions SET \
                status = ?2, rejection_reason = ?3, execution_price = ?4, position_id = ?5 \
             WHERE id = ?1",
            params![id, status.as_str(), rejection_reason, execution_price, position_id],
        )?;
        Ok(())
    }

    pub async fn list_decisions(&self, limit: usize) -> Result<Vec<TradeDecision>> {
        let limit = limit.clamp(1, 10_000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, strategy, market_id, condition_id, token_id, action, size_usd, \
                    inputs, status, rejection_reason, execution_price, position_id \
             FROM trade_decisions ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let action: String = row.get(6)?;
            let inputs: String = row.get(8)?;
            let status: String = row.get(9)?;
            Ok(TradeDecision {
                id: row.get(0)?,
                ts_ms: row.get(1)?,
                strategy: row.get(2)?,
                market_id: row.get(3)?,
                condition_id: row.get(4)?,
                token_id: row.get(5)?,
                action: parse_action(&action),
                size_usd: row.get(7)?,
                inputs: serde_json::from_str(&inputs).unwrap_or(serde_json::Value::Null),
                status: DecisionStatus::parse(&status).unwrap_or(DecisionStatus::Rejected),
                rejection_reason: row.get(10)?,
                execution_price: row.get(11)?,
                position_id: row.get(12)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Cooldowns & recent orders
    // ------------------------------------------------------------------

    pub async fn upsert_cooldown(&self, strategy: &str, market_id: i64, ts_ms: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cooldowns (strategy, market_id, last_entry_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(strategy, market_id) DO UPDATE SET last_entry_at = excluded.last_entry_at",
            params![strategy, market_id, ts_ms],
        )?;
        Ok(())
    }

    pub async fn load_cooldowns(&self) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT strategy, market_id, last_entry_at FROM cooldowns")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn upsert_recent_order(
        &self,
        strategy: &str,
        token_id: &str,
        ts_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO recent_orders (strategy, token_id, last_order_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(strategy, token_id) DO UPDATE SET last_order_at = excluded.last_order_at",
            params![strategy, token_id, ts_ms],
        )?;
        Ok(())
    }

    pub async fn load_recent_orders(&self) -> Result<Vec<(String, String, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT strategy, token_id, last_order_at FROM recent_orders")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get(2)?,
            ))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Market catalog (written by discovery, read here)
    // ------------------------------------------------------------------

    pub async fn load_markets(&self) -> Result<Vec<MarketInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, condition_id, question, yes_token_id, no_token_id, category, format, \
                    market_type, end_date, status, accepting_orders, resolved_outcome, liquidity_usd \
             FROM markets",
        )?;
        let rows = stmt.query_map([], |row| {
            let end_date: Option<String> = row.get(8)?;
            let status: String = row.get(9)?;
            let outcome: Option<String> = row.get(11)?;
            Ok(MarketInfo {
                market_id: row.get(0)?,
                condition_id: row.get(1)?,
                question: row.get(2)?,
                yes_token_id: row.get(3)?,
                no_token_id: row.get(4)?,
                category: row.get(5)?,
                format: row.get(6)?,
                market_type: row.get(7)?,
                end_date: end_date
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                status: MarketStatus::parse(&status).unwrap_or(MarketStatus::Closed),
                accepting_orders: row.get::<_, i64>(10)? != 0,
                resolved_outcome: outcome.as_deref().and_then(TokenSide::parse),
                liquidity_usd: row.get(12)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Discovery-side writer, used by fixtures and tooling.
    pub async fn upsert_market(&self, m: &MarketInfo) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO markets \
             (id, condition_id, question, yes_token_id, no_token_id, category, format, \
              market_type, end_date, status, accepting_orders, resolved_outcome, liquidity_usd) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(id) DO UPDATE SET \
                question = excluded.question, \
                category = excluded.category, \
                format = excluded.format, \
                market_type = excluded.market_type, \
                end_date = excluded.end_date, \
                status = excluded.status, \
                accepting_orders = excluded.accepting_orders, \
                resolved_outcome = excluded.resolved_outcome, \
                liquidity_usd = excluded.liquidity_usd",
            params![
                m.market_id,
                &m.condition_id,
                &m.question,
                &m.yes_token_id,
                &m.no_token_id,
                m.category.as_deref(),
                m.format.as_deref(),
                m.market_type.as_deref(),
                m.end_date.map(|dt| dt.to_rfc3339()),
                m.status.as_str(),
                m.accepting_orders as i64,
                m.resolved_outcome.map(|o| o.as_str()),
                m.liquidity_usd,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation & stats
    // ------------------------------------------------------------------

    pub async fn insert_reconcile_marker(&self, kind: &str, payload: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO reconcile_markers (id, ts, kind, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                uuid::Uuid::new_v4().to_string(),
                chrono::Utc::now().timestamp_millis(),
                kind,
                payload.to_string(),
            ],
        )?;
        Ok(())
    }

    pub async fn insert_stats_snapshot(&self, ts_ms: i64, snapshot: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO engine_stats (ts, snapshot) VALUES (?1, ?2)",
            params![ts_ms, snapshot.to_string()],
        )?;
        Ok(())
    }
}

fn parse_action(s: &str) -> ActionKind {
    match s {
        "OPEN_LONG" => ActionKind::OpenLong,
        "OPEN_SPREAD" => ActionKind::OpenSpread,
        "CLOSE" => ActionKind::Close,
        "PARTIAL_CLOSE" => ActionKind::PartialClose,
        "ADD" => ActionKind::Add,
        _ => ActionKind::OpenLong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position() -> Position {
        let mut p = Position::new("scalp", 9, "0xc9", "ty9", TokenSide::Yes, 1_000);
        p.apply_entry(10.0, 0.5);
        p
    }

    #[tokio::test]
    async fn position_round_trip() {
        let store = StateStore::open_in_memory().expect("store");
        let p = sample_position();
        store.upsert_position(&p).await.expect("upsert");

        let open = store.load_open_positions().await.expect("load");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, p.id);
        assert_eq!(open[0].token, TokenSide::Yes);
        assert!((open[0].cost_basis - 5.0).abs() < 1e-9);

        let mut closed = p.clone();
        closed.apply_exit(10.0, 0.6, 2_000, "close");
        store.upsert_position(&closed).await.expect("update");
        assert!(store.load_open_positions().await.unwrap().is_empty());

        let fetched = store.get_position(&p.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PositionStatus::Closed);
        assert_eq!(fetched.close_reason.as_deref(), Some("close"));
    }

    #[tokio::test]
    async fn legs_persist_in_order() {
        let store = StateStore::open_in_memory().expect("store");
        let p = sample_position();
        store
            .insert_leg(&PositionLeg::entry(&p.id, 10.0, 0.5, 1, "entry"))
            .await
            .expect("leg1");
        store
            .insert_leg(&PositionLeg::exit(&p.id, 4.0, 0.55, -2.0, 2, "scale_out"))
            .await
            .expect("leg2");

        let legs = store.load_legs(&p.id).await.expect("legs");
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].trigger_reason, "entry");
        assert!(legs[1].delta_shares < 0.0);
    }

    #[tokio::test]
    async fn decision_pending_to_final() {
        let store = StateStore::open_in_memory().expect("store");
        let d = TradeDecision {
            id: "d1".to_string(),
            ts_ms: 1,
            strategy: "scalp".to_string(),
            market_id: 9,
            condition_id: "0xc9".to_string(),
            token_id: "ty9".to_string(),
            action: ActionKind::OpenLong,
            size_usd: 10.0,
            inputs: serde_json::json!({"mid": 0.5}),
            status: DecisionStatus::Pending,
            rejection_reason: None,
            execution_price: None,
            position_id: None,
        };
        store.insert_decision(&d).await.expect("insert");
        store
            .finalize_decision("d1", DecisionStatus::Executed, None, Some(0.52), Some("p1"))
            .await
            .expect("finalize");

        let rows = store.list_decisions(10).await.expect("list");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].executed());
        assert_eq!(rows[0].execution_price, Some(0.52));
        assert_eq!(rows[0].position_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn market_catalog_round_trip() {
        let store = StateStore::open_in_memory().expect("store");
        let m = MarketInfo {
            market_id: 42,
            condition_id: "0x2a".to_string(),
            question: "q".to_string(),
            yes_token_id: "y42".to_string(),
            no_token_id: "n42".to_string(),
            category: Some("esports".to_string()),
            format: Some("map_winner".to_string()),
            market_type: None,
            end_date: None,
            status: MarketStatus::Active,
            accepting_orders: true,
            resolved_outcome: None,
            liquidity_usd: Some(1234.5),
        };
        store.upsert_market(&m).await.expect("upsert");

        let markets = store.load_markets().await.expect("load");
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].format.as_deref(), Some("map_winner"));
        assert!(markets[0].accepts_orders());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("state.db");
        let db_path = db_path.to_str().unwrap();

        let p = sample_position();
        {
            let store = StateStore::open(db_path).expect("open");
            store.upsert_position(&p).await.expect("upsert");
            store
                .upsert_cooldown("scalp", p.market_id, 7_000)
                .await
                .expect("cooldown");
        }

        let store = StateStore::open(db_path).expect("reopen");
        let open = store.load_open_positions().await.expect("load");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, p.id);
        assert_eq!(
            store.load_cooldowns().await.unwrap(),
            vec![("scalp".to_string(), p.market_id, 7_000)]
        );
    }

    #[tokio::test]
    async fn cooldowns_and_recent_orders_persist() {
        let store = StateStore::open_in_memory().expect("store");
        store.upsert_cooldown("scalp", 9, 5_000).await.unwrap();
        store.upsert_cooldown("scalp", 9, 6_000).await.unwrap();
        store
            .upsert_recent_order("scalp", "ty9", 6_500)
            .await
            .unwrap();

        let cds = store.load_cooldowns().await.unwrap();
        assert_eq!(cds, vec![("scalp".to_string(), 9, 6_000)]);
        let ros = store.load_recent_orders().await.unwrap();
        assert_eq!(ros, vec![("scalp".to_string(), "ty9".to_string(), 6_500)]);
    }
}
