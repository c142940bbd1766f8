//! End-to-end paper-mode scenarios through the real pipeline.
//!
//! Each test drives strategy → action → gates → paper fill → state with a
//! stubbed market-data source, asserting the decision log and accounting
//! after every step.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::MarketCatalog;
use crate::config::Config;
use crate::gateway::book::{BookSnapshot, PriceLevel};
use crate::models::{
    Action, ActionKind, MarketInfo, MarketStatus, Quotes, Tick, TickEvent, TokenSide,
};
use crate::router::ActionEnvelope;
use crate::state::{DecisionStatus, StateManager, StateStore, ACCOUNTING_EPSILON};
use crate::strategy::{
    BookImbalance, FavoriteHedge, Strategy, StrategyCaps, StrategyStateView, TickContext,
};

use super::{ExecutionPipeline, MarketDataSource, ProcessOutcome};

/// Serves canned books per token; errors for unknown tokens (fail-closed).
#[derive(Default)]
struct StubDataSource {
    books: RwLock<HashMap<String, BookSnapshot>>,
    fee_bps: RwLock<HashMap<String, f64>>,
}

impl StubDataSource {
    fn set_book(&self, token_id: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
        let snapshot = BookSnapshot::from_levels(
            bids.iter()
                .map(|&(price, size)| PriceLevel { price, size })
                .collect(),
            asks.iter()
                .map(|&(price, size)| PriceLevel { price, size })
                .collect(),
            Utc::now().timestamp_millis(),
            0,
        );
        self.books.write().insert(token_id.to_string(), snapshot);
    }
}

#[async_trait]
impl MarketDataSource for StubDataSource {
    async fn fresh_book(&self, token_id: &str) -> anyhow::Result<BookSnapshot> {
        self.books
            .read()
            .get(token_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no book for {token_id}"))
    }

    async fn fee_rate_bps(&self, token_id: &str) -> anyhow::Result<f64> {
        Ok(self.fee_bps.read().get(token_id).copied().unwrap_or(0.0))
    }
}

struct Harness {
    pipeline: Arc<ExecutionPipeline>,
    state: Arc<StateManager>,
    data: Arc<StubDataSource>,
    market: MarketInfo,
}

async fn harness(strategy_name: &str, config: Config) -> Harness {
    let market = MarketInfo {
        market_id: 1,
        condition_id: "0xc1".to_string(),
        question: "Team A to win?".to_string(),
        yes_token_id: "ty".to_string(),
        no_token_id: "tn".to_string(),
        category: Some("esports".to_string()),
        format: None,
        market_type: None,
        end_date: None,
        status: MarketStatus::Active,
        accepting_orders: true,
        resolved_outcome: None,
        liquidity_usd: Some(10_000.0),
    };
    let catalog = MarketCatalog::new();
    catalog.replace_all(vec![market.clone()]);

    let state = StateManager::open(StateStore::open_in_memory().unwrap())
        .await
        .unwrap();
    state.register_strategy(strategy_name, 100.0).await.unwrap();

    let data = Arc::new(StubDataSource::default());
    let mut caps_map = HashMap::new();
    let mut caps = StrategyCaps::new(strategy_name, "test");
    caps.max_spread = 0.10;
    caps_map.insert(strategy_name.to_string(), caps);

    let pipeline = ExecutionPipeline::new(
        Arc::new(config),
        caps_map,
        catalog.clone(),
        state.clone(),
        data.clone(),
        Arc::new(super::PaperClient::new()),
    );

    Harness {
        pipeline,
        state,
        data,
        market,
    }
}

fn fresh_tick(market: &MarketInfo, bid: f64, ask: f64, imbalance: f64) -> Tick {
    let quotes = Quotes {
        bid: Some(bid),
        ask: Some(ask),
        mid: Some((bid + ask) / 2.0),
        last: None,
    };
    Tick {
        market_id: market.market_id,
        condition_id: market.condition_id.clone(),
        token_id: market.yes_token_id.clone(),
        token: TokenSide::Yes,
        event: TickEvent::Book,
        ts_ms: Utc::now().timestamp_millis(),
        yes: quotes,
        no: quotes.complement(),
        spread: Some(ask - bid),
        imbalance: Some(imbalance),
        trade_size: None,
        trade_side: None,
        velocity_1m: None,
    }
}

fn view() -> StrategyStateView {
    StrategyStateView {
        available_usd: 100.0,
        equity: 100.0,
        open_positions: 0,
    }
}

#[tokio::test]
async fn book_imbalance_entry_end_to_end() {
    let h = harness("book_imbalance", Config::paper_default()).await;
    let mut cfg = crate::config::StrategyConfig::default();
    cfg.params
        .insert("fixed_size_usd".to_string(), toml::Value::Float(1.1));
    let mut strategy = BookImbalance::from_config("book_imbalance", &cfg).unwrap();

    // First tick: imbalance (1300-500)/1800 ≈ 0.44, below the 0.5 bar.
    let weak = {
        let mut t = fresh_tick(&h.market, 0.52, 0.54, (1300.0 - 500.0) / 1800.0);
        t.spread = Some(0.02);
        t
    };
    let ctx = TickContext {
        tick: &weak,
        market: &h.market,
        state: view(),
    };
    assert!(strategy.on_tick(&ctx).is_none());

    // Second tick: bids [(0.52, 1500)], asks [(0.54, 200)] ⇒ ≈0.76.
    let strong = fresh_tick(&h.market, 0.52, 0.54, (1500.0 - 200.0) / 1700.0);
    let ctx = TickContext {
        tick: &strong,
        market: &h.market,
        state: view(),
    };
    let action = strategy.on_tick(&ctx).expect("entry action");
    assert_eq!(action.kind, ActionKind::OpenLong);
    assert!((action.size_usd - 1.10).abs() < 1e-9);

    h.data.set_book("ty", &[(0.52, 1500.0)], &[(0.54, 200.0)]);
    let outcome = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action,
            tick: strong,
        })
        .await
        .expect("process");

    let ProcessOutcome::Executed { position_ids, price, .. } = outcome else {
        panic!("expected execution, got {outcome:?}");
    };
    // Crosses the ask with size-scaled slippage.
    assert!(price >= 0.54 && price < 0.545);

    let position = h
        .state
        .get_position("book_imbalance", 1, TokenSide::Yes)
        .expect("position opened");
    assert_eq!(position.id, position_ids[0]);
    assert!((position.remaining_shares - 1.10 / price).abs() < 1e-9);
    assert!((position.remaining_shares - 2.037).abs() < 0.01);
    assert!((position.cost_basis - 1.10).abs() < 1e-9);

    // Exactly one executed decision, one leg, cooldown set.
    let decisions = h.state.store().list_decisions(10).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].executed());
    assert_eq!(decisions[0].position_id.as_deref(), Some(position.id.as_str()));
    let legs = h.state.store().load_legs(&position.id).await.unwrap();
    assert_eq!(legs.len(), 1);
    assert!(h
        .state
        .is_in_cooldown("book_imbalance", 1, 30.0, Utc::now().timestamp_millis()));

    // Capital accounting invariant.
    let s = h.state.strategy_state("book_imbalance").unwrap();
    assert!(
        s.available_usd + position.cost_basis
            <= s.allocated_usd + s.total_realized_pnl + ACCOUNTING_EPSILON
    );
}

#[tokio::test]
async fn stale_signal_is_rejected_with_no_mutation() {
    let h = harness("book_imbalance", Config::paper_default()).await;
    h.data.set_book("ty", &[(0.52, 900.0)], &[(0.54, 200.0)]);

    let mut tick = fresh_tick(&h.market, 0.52, 0.54, 0.76);
    tick.ts_ms = Utc::now().timestamp_millis() - 7_000; // 7s old, limit 5s

    let action = Action::open_long(1, "0xc1", TokenSide::Yes, 1.1, "entry");
    let outcome = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action,
            tick,
        })
        .await
        .expect("process");

    let ProcessOutcome::Rejected { reason, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(reason, "signal_age");

    let decisions = h.state.store().list_decisions(10).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].status, DecisionStatus::Rejected);
    assert_eq!(decisions[0].rejection_reason.as_deref(), Some("signal_age"));
    assert!(h
        .state
        .get_position("book_imbalance", 1, TokenSide::Yes)
        .is_none());
}

#[tokio::test]
async fn duplicate_entry_guard_sees_first_fill() {
    let h = harness("book_imbalance", Config::paper_default()).await;
    h.data.set_book("ty", &[(0.52, 1500.0)], &[(0.54, 200.0)]);

    let tick = fresh_tick(&h.market, 0.52, 0.54, 0.76);
    let action = Action::open_long(1, "0xc1", TokenSide::Yes, 1.1, "entry");

    // Two qualifying actions in quick succession: the first fills, the
    // second must observe the mutation and reject.
    let first = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action: action.clone(),
            tick: tick.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(first, ProcessOutcome::Executed { .. }));

    let second = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action,
            tick,
        })
        .await
        .unwrap();
    let ProcessOutcome::Rejected { reason, .. } = second else {
        panic!("expected duplicate rejection");
    };
    assert_eq!(reason, "duplicate_position");

    let decisions = h.state.store().list_decisions(10).await.unwrap();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions.iter().filter(|d| d.executed()).count(), 1);
}

#[tokio::test]
async fn hedge_on_rise_builds_spread_and_settles() {
    let h = harness("favorite_hedge", Config::paper_default()).await;
    let mut strategy =
        FavoriteHedge::from_config("favorite_hedge", &crate::config::StrategyConfig::default())
            .unwrap();

    // Existing YES position: avg 0.60, $20 notional.
    h.data.set_book("ty", &[(0.59, 500.0)], &[(0.61, 500.0)]);
    h.data.set_book("tn", &[(0.14, 500.0)], &[(0.16, 500.0)]);
    h.state
        .record_fill(
            "favorite_hedge",
            1,
            "0xc1",
            "ty",
            &crate::state::Fill {
                token: TokenSide::Yes,
                side: crate::models::TradeSide::Buy,
                price: 0.60,
                shares: 20.0 / 0.60,
                fees_usd: 0.0,
                order_id: None,
                ts_ms: 1,
                reason: "entry".to_string(),
            },
        )
        .await
        .unwrap();

    // Favorite runs to 0.85: the strategy answers with a NO hedge.
    let tick = fresh_tick(&h.market, 0.84, 0.86, 0.0);
    let position = h
        .state
        .get_position("favorite_hedge", 1, TokenSide::Yes)
        .unwrap();
    let ctx = TickContext {
        tick: &tick,
        market: &h.market,
        state: view(),
    };
    let action = strategy
        .on_position_update(&position, &ctx)
        .expect("hedge action");
    assert_eq!(action.token, TokenSide::No);
    assert!((action.size_usd - 6.60).abs() < 1e-6);

    let outcome = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "favorite_hedge".to_string(),
            action,
            tick,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Executed { .. }));

    // Both legs exist and reference the same spread.
    let spread = h.state.get_spread("favorite_hedge", 1).expect("spread");
    let yes = h
        .state
        .get_position("favorite_hedge", 1, TokenSide::Yes)
        .unwrap();
    let no = h
        .state
        .get_position("favorite_hedge", 1, TokenSide::No)
        .unwrap();
    assert_eq!(yes.spread_id.as_deref(), Some(spread.id.as_str()));
    assert_eq!(no.spread_id.as_deref(), Some(spread.id.as_str()));

    // YES resolution: YES leg pays $1/share, NO leg pays nothing.
    let settled = h
        .state
        .apply_resolution(1, TokenSide::Yes, Utc::now().timestamp_millis())
        .await
        .unwrap();
    assert_eq!(settled.len(), 2);
    let yes_settled = settled.iter().find(|p| p.token == TokenSide::Yes).unwrap();
    let no_settled = settled.iter().find(|p| p.token == TokenSide::No).unwrap();
    // YES: shares·(1 − 0.60).
    assert!((yes_settled.realized_pnl - (20.0 / 0.60) * 0.40).abs() < 1e-6);
    // NO leg loses its entire cost basis.
    assert!(no_settled.realized_pnl < 0.0);
    assert!(h.state.get_spread("favorite_hedge", 1).is_none());
}

#[tokio::test]
async fn cooldown_blocks_reopen_then_releases() {
    let mut config = Config::paper_default();
    config.safety.recent_order_window_minutes = 0.0;
    let h = harness("book_imbalance", config).await;
    h.data.set_book("ty", &[(0.52, 1500.0)], &[(0.54, 200.0)]);

    let open = Action::open_long(1, "0xc1", TokenSide::Yes, 1.1, "entry");
    let tick = fresh_tick(&h.market, 0.52, 0.54, 0.76);
    let first = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action: open.clone(),
            tick: tick.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(first, ProcessOutcome::Executed { .. }));

    // Close the position, then try to re-enter inside the cooldown.
    let close = Action::close(1, "0xc1", TokenSide::Yes, "exit");
    let closed = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action: close,
            tick: tick.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(closed, ProcessOutcome::Executed { .. }));

    let reopen = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action: open.clone(),
            tick: tick.clone(),
        })
        .await
        .unwrap();
    let ProcessOutcome::Rejected { reason, .. } = reopen else {
        panic!("expected cooldown rejection");
    };
    assert_eq!(reason, "cooldown");

    // Expire the cooldown by backdating the recorded entry time.
    h.state
        .set_cooldown(
            "book_imbalance",
            1,
            Utc::now().timestamp_millis() - 31 * 60_000,
        )
        .await
        .unwrap();
    let tick = fresh_tick(&h.market, 0.52, 0.54, 0.76);
    let reopened = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action: open,
            tick,
        })
        .await
        .unwrap();
    assert!(matches!(reopened, ProcessOutcome::Executed { .. }));
}

#[tokio::test]
async fn book_fetch_failure_fails_closed() {
    let h = harness("book_imbalance", Config::paper_default()).await;
    // No stub book installed for "ty".
    let tick = fresh_tick(&h.market, 0.52, 0.54, 0.76);
    let action = Action::open_long(1, "0xc1", TokenSide::Yes, 1.1, "entry");
    let outcome = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action,
            tick,
        })
        .await
        .unwrap();
    let ProcessOutcome::Rejected { reason, .. } = outcome else {
        panic!("expected fail-closed rejection");
    };
    assert_eq!(reason, "book_unavailable");
}

#[tokio::test]
async fn fee_gate_uses_exchange_rate_and_tolerates_lookup_failure() {
    let h = harness("book_imbalance", Config::paper_default()).await;
    h.data.set_book("ty", &[(0.52, 1500.0)], &[(0.54, 200.0)]);
    h.data
        .fee_bps
        .write()
        .insert("ty".to_string(), 1_000.0); // 10%, above the 200 bps cap

    let tick = fresh_tick(&h.market, 0.52, 0.54, 0.76);
    let action = Action::open_long(1, "0xc1", TokenSide::Yes, 1.1, "entry");
    let outcome = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "book_imbalance".to_string(),
            action,
            tick,
        })
        .await
        .unwrap();
    let ProcessOutcome::Rejected { reason, .. } = outcome else {
        panic!("expected fee rejection");
    };
    assert_eq!(reason, "fee_rate");
}

#[tokio::test]
async fn partial_close_trims_and_keeps_position_open() {
    let mut config = Config::paper_default();
    config.safety.recent_order_window_minutes = 0.0;
    let h = harness("swing_rebalance", config).await;
    h.data.set_book("ty", &[(0.55, 500.0)], &[(0.57, 500.0)]);
    h.state
        .record_fill(
            "swing_rebalance",
            1,
            "0xc1",
            "ty",
            &crate::state::Fill {
                token: TokenSide::Yes,
                side: crate::models::TradeSide::Buy,
                price: 0.50,
                shares: 20.0,
                fees_usd: 0.0,
                order_id: None,
                ts_ms: 1,
                reason: "entry".to_string(),
            },
        )
        .await
        .unwrap();

    let tick = fresh_tick(&h.market, 0.55, 0.57, 0.0);
    let action = Action {
        kind: ActionKind::PartialClose,
        market_id: 1,
        condition_id: "0xc1".to_string(),
        token: TokenSide::Yes,
        size_usd: 5.6, // ≈10 shares at mid 0.56
        hedge_size_usd: None,
        limit_price: None,
        urgency: crate::models::Urgency::Normal,
        reason: "trim".to_string(),
    };
    let outcome = h
        .pipeline
        .process(ActionEnvelope {
            strategy: "swing_rebalance".to_string(),
            action,
            tick,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Executed { .. }));

    let position = h
        .state
        .get_position("swing_rebalance", 1, TokenSide::Yes)
        .expect("still open");
    assert!(position.is_open());
    assert!((position.remaining_shares - 10.0).abs() < 0.1);
    assert!(position.realized_pnl > 0.0);
}
