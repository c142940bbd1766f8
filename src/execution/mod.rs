//! Execution & Safety Pipeline.
//!
//! Turns strategy actions into durable outcomes: size, gate, price, route
//! to the paper or live order client, and mutate the state manager, with
//! one TradeDecision row per action, written before any mutation.
//! Actions are consumed sequentially from the router channel, so a fill is
//! visible to the very next gate check (the duplicate-position guard).

pub mod client;
pub mod gates;
pub mod pricing;

#[cfg(test)]
mod pipeline_test;

pub use client::{
    ClobCredentials, ExchangeRestClient, LiveClient, OrderAck, OrderClient, OrderRequest,
    OrderState, PaperClient,
};
pub use gates::{GateContext, Rejection};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::MarketCatalog;
use crate::config::{Config, OrderType, TradeMode};
use crate::gateway::book::BookSnapshot;
use crate::gateway::MarketDataGateway;
use crate::models::{Action, ActionKind, MarketInfo, TradeSide, Urgency};
use crate::router::ActionEnvelope;
use crate::state::{
    DecisionStatus, Fill, Position, StateManager, TradeDecision,
};
use crate::strategy::StrategyCaps;

/// Fresh market data for the gate checks. Injected so paper trading and
/// tests never touch the network.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fail-closed: an error here rejects the action.
    async fn fresh_book(&self, token_id: &str) -> Result<BookSnapshot>;
    /// Non-fatal: errors are treated as a zero fee.
    async fn fee_rate_bps(&self, token_id: &str) -> Result<f64>;
}

/// Live-session source: the gateway's book is authoritative while fresh;
/// REST is the fallback after reconnects or for unsubscribed tokens.
pub struct GatewayDataSource {
    gateway: Arc<MarketDataGateway>,
    rest: ExchangeRestClient,
    book_timeout: Duration,
}

impl GatewayDataSource {
    pub fn new(
        gateway: Arc<MarketDataGateway>,
        rest: ExchangeRestClient,
        book_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            rest,
            book_timeout,
        }
    }
}

#[async_trait]
impl MarketDataSource for GatewayDataSource {
    async fn fresh_book(&self, token_id: &str) -> Result<BookSnapshot> {
        if let Some(book) = self.gateway.book(token_id) {
            return Ok((*book).clone());
        }
        self.rest.fetch_book(token_id, self.book_timeout).await
    }

    async fn fee_rate_bps(&self, token_id: &str) -> Result<f64> {
        self.rest.fee_rate_bps(token_id).await
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub executed: AtomicU64,
    pub rejected: AtomicU64,
    pub partial_fills: AtomicU64,
    pub submit_errors: AtomicU64,
    consecutive_submit_errors: AtomicU64,
}

/// Consecutive submit failures before the pipeline reports degraded health.
const DEGRADED_THRESHOLD: u64 = 5;

#[derive(Debug)]
pub enum ProcessOutcome {
    Executed {
        decision_id: String,
        position_ids: Vec<String>,
        price: f64,
    },
    Rejected {
        decision_id: String,
        reason: String,
    },
}

pub struct ExecutionPipeline {
    config: Arc<Config>,
    caps: HashMap<String, StrategyCaps>,
    catalog: Arc<MarketCatalog>,
    state: Arc<StateManager>,
    data: Arc<dyn MarketDataSource>,
    client: Arc<dyn OrderClient>,
    stats: PipelineStats,
}

impl ExecutionPipeline {
    pub fn new(
        config: Arc<Config>,
        caps: HashMap<String, StrategyCaps>,
        catalog: Arc<MarketCatalog>,
        state: Arc<StateManager>,
        data: Arc<dyn MarketDataSource>,
        client: Arc<dyn OrderClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            caps,
            catalog,
            state,
            data,
            client,
            stats: PipelineStats::default(),
        })
    }

    /// Consume actions until the router side closes. In-flight work
    /// finishes before this returns, which is the shutdown grace contract.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ActionEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            let strategy = envelope.strategy.clone();
            let kind = envelope.action.kind;
            if let Err(e) = self.process(envelope).await {
                error!(strategy = %strategy, kind = kind.as_str(), error = %e, "action processing failed");
            }
        }
        info!("execution pipeline stopped");
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "executed": self.stats.executed.load(Ordering::Relaxed),
            "rejected": self.stats.rejected.load(Ordering::Relaxed),
            "partial_fills": self.stats.partial_fills.load(Ordering::Relaxed),
            "submit_errors": self.stats.submit_errors.load(Ordering::Relaxed),
        })
    }

    pub async fn process(&self, envelope: ActionEnvelope) -> Result<ProcessOutcome> {
        let now_ms = Utc::now().timestamp_millis();
        let ActionEnvelope {
            strategy,
            action,
            tick,
        } = envelope;

        let Some(market) = self.catalog.get(action.market_id) else {
            return self
                .reject(&strategy, &action, &tick.token_id, serde_json::json!({}), "market_unknown", now_ms)
                .await;
        };
        let Some(caps) = self.caps.get(&strategy).cloned() else {
            return self
                .reject(&strategy, &action, &tick.token_id, serde_json::json!({}), "unknown_strategy", now_ms)
                .await;
        };

        match action.kind {
            ActionKind::OpenLong | ActionKind::Add | ActionKind::OpenSpread => {
                self.execute_entry(&strategy, &caps, &market, action, &tick, now_ms)
                    .await
            }
            ActionKind::Close | ActionKind::PartialClose => {
                self.execute_exit(&strategy, &caps, &market, action, &tick, now_ms)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    async fn execute_entry(
        &self,
        strategy: &str,
        caps: &StrategyCaps,
        market: &MarketInfo,
        action: Action,
        tick: &crate::models::Tick,
        now_ms: i64,
    ) -> Result<ProcessOutcome> {
        let outcome = self
            .entry_leg(strategy, caps, market, action.clone(), tick, now_ms)
            .await?;

        // A spread entry fills its second leg right behind the first, on
        // its own decision row.
        if action.kind == ActionKind::OpenSpread
            && matches!(outcome, ProcessOutcome::Executed { .. })
        {
            let hedge_action = Action {
                kind: ActionKind::OpenLong,
                token: action.token.opposite(),
                size_usd: action.hedge_size_usd.unwrap_or(action.size_usd),
                hedge_size_usd: None,
                ..action.clone()
            };
            if let Err(e) = self
                .entry_leg(strategy, caps, market, hedge_action, tick, now_ms)
                .await
            {
                warn!(strategy = %strategy, market_id = market.market_id, error = %e, "spread hedge leg failed");
            }
        }

        // Entering a market starts its cooldown clock.
        if matches!(action.kind, ActionKind::OpenLong | ActionKind::OpenSpread)
            && matches!(outcome, ProcessOutcome::Executed { .. })
        {
            self.state
                .set_cooldown(strategy, market.market_id, now_ms)
                .await?;
        }

        Ok(outcome)
    }

    async fn entry_leg(
        &self,
        strategy: &str,
        caps: &StrategyCaps,
        market: &MarketInfo,
        action: Action,
        tick: &crate::models::Tick,
        now_ms: i64,
    ) -> Result<ProcessOutcome> {
        let token_id = market.token_id(action.token).to_string();

        // Fresh book fetch failures fail closed.
        let fresh = match self.data.fresh_book(&token_id).await {
            Ok(book) => book,
            Err(e) => {
                warn!(token_id = %token_id, error = %e, "fresh book unavailable");
                return self
                    .reject(strategy, &action, &token_id, serde_json::json!({}), "book_unavailable", now_ms)
                    .await;
            }
        };
        let fee_bps = match self.data.fee_rate_bps(&token_id).await {
            Ok(bps) => bps,
            Err(e) => {
                debug!(token_id = %token_id, error = %e, "fee lookup failed, assuming 0");
                0.0
            }
        };

        let sizing = self.config.sizing_for(strategy);
        let available = self
            .state
            .strategy_state(strategy)
            .map(|s| s.available_usd)
            .unwrap_or(0.0);
        let sized_usd = pricing::size_entry(action.size_usd, &sizing, caps, available);
        let inputs = inputs_snapshot(tick, &fresh, fee_bps, sized_usd, self.config.mode);

        if sized_usd <= 0.0 {
            return self
                .reject(strategy, &action, &token_id, inputs, "invalid_size", now_ms)
                .await;
        }

        let gate_result = gates::run_gates(&GateContext {
            strategy,
            action: &action,
            tick,
            market,
            caps,
            safety: &self.config.safety,
            risk: &self.config.risk,
            sized_usd,
            fresh_book: &fresh,
            fee_bps,
            now_ms,
            polling_mode: self.config.settings.polling_mode,
            state: &self.state,
        });
        if let Err(rejection) = gate_result {
            debug!(
                strategy = %strategy,
                market_id = market.market_id,
                gate = rejection.code,
                detail = %rejection.detail,
                "entry rejected"
            );
            return self
                .reject(strategy, &action, &token_id, inputs, rejection.code, now_ms)
                .await;
        }

        let order_type = if action.urgency == Urgency::High {
            OrderType::Market
        } else {
            self.config.order_type_for(strategy)
        };
        let Some(base) = pricing::base_price(&fresh, TradeSide::Buy) else {
            return self
                .reject(strategy, &action, &token_id, inputs, "no_liquidity", now_ms)
                .await;
        };
        let price = match order_type {
            OrderType::Market => pricing::effective_price(base, TradeSide::Buy, sized_usd),
            OrderType::Limit => {
                let mid = fresh.mid_price().unwrap_or(base);
                action
                    .limit_price
                    .unwrap_or_else(|| pricing::limit_price(mid, TradeSide::Buy, self.config.execution.limit_offset_bps))
            }
        };

        self.submit_and_record(
            strategy,
            market,
            &token_id,
            &action,
            tick,
            inputs,
            sized_usd,
            price,
            order_type,
            TradeSide::Buy,
            fee_bps,
            now_ms,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    async fn execute_exit(
        &self,
        strategy: &str,
        caps: &StrategyCaps,
        market: &MarketInfo,
        action: Action,
        tick: &crate::models::Tick,
        now_ms: i64,
    ) -> Result<ProcessOutcome> {
        let Some(position) = self
            .state
            .get_position(strategy, market.market_id, action.token)
        else {
            return self
                .reject(
                    strategy,
                    &action,
                    market.token_id(action.token),
                    serde_json::json!({}),
                    "position_not_found",
                    now_ms,
                )
                .await;
        };

        // Closing a spread closes both legs; the paired leg rides on the
        // same decision.
        let paired_leg = if action.kind == ActionKind::Close {
            position.spread_id.as_ref().and_then(|_| {
                self.state
                    .get_position(strategy, market.market_id, action.token.opposite())
            })
        } else {
            None
        };

        let token_id = position.token_id.clone();
        let fresh = match self.data.fresh_book(&token_id).await {
            Ok(book) => book,
            Err(e) => {
                warn!(token_id = %token_id, error = %e, "fresh book unavailable for exit");
                return self
                    .reject(strategy, &action, &token_id, serde_json::json!({}), "book_unavailable", now_ms)
                    .await;
            }
        };
        let fee_bps = self.data.fee_rate_bps(&token_id).await.unwrap_or(0.0);

        let exit_shares = match action.kind {
            ActionKind::PartialClose => {
                let mid = fresh.mid_price().unwrap_or(position.avg_entry_price);
                if mid <= 0.0 {
                    position.remaining_shares
                } else {
                    (action.size_usd / mid).min(position.remaining_shares)
                }
            }
            _ => position.remaining_shares,
        };
        let Some(base) = pricing::base_price(&fresh, TradeSide::Sell) else {
            return self
                .reject(strategy, &action, &token_id, serde_json::json!({}), "no_liquidity", now_ms)
                .await;
        };
        let sized_usd = exit_shares * base;
        let inputs = inputs_snapshot(tick, &fresh, fee_bps, sized_usd, self.config.mode);

        let gate_result = gates::run_gates(&GateContext {
            strategy,
            action: &action,
            tick,
            market,
            caps,
            safety: &self.config.safety,
            risk: &self.config.risk,
            sized_usd,
            fresh_book: &fresh,
            fee_bps,
            now_ms,
            polling_mode: self.config.settings.polling_mode,
            state: &self.state,
        });
        if let Err(rejection) = gate_result {
            return self
                .reject(strategy, &action, &token_id, inputs, rejection.code, now_ms)
                .await;
        }

        let price = pricing::effective_price(base, TradeSide::Sell, sized_usd);
        let outcome = self
            .submit_and_record(
                strategy,
                market,
                &token_id,
                &action,
                tick,
                inputs,
                sized_usd,
                price,
                OrderType::Market,
                TradeSide::Sell,
                fee_bps,
                now_ms,
            )
            .await?;

        // Second spread leg, executed right behind the first.
        if let Some(paired) = paired_leg {
            if matches!(outcome, ProcessOutcome::Executed { .. }) {
                let paired_token = paired.token_id.clone();
                if let Ok(paired_book) = self.data.fresh_book(&paired_token).await {
                    if let Some(paired_bid) = paired_book.best_bid() {
                        let paired_size = paired.remaining_shares * paired_bid;
                        let paired_price =
                            pricing::effective_price(paired_bid, TradeSide::Sell, paired_size);
                        let fill = Fill {
                            token: paired.token,
                            side: TradeSide::Sell,
                            price: paired_price,
                            shares: paired.remaining_shares,
                            fees_usd: 0.0,
                            order_id: None,
                            ts_ms: now_ms,
                            reason: format!("spread_close: {}", action.reason),
                        };
                        if let Err(e) = self
                            .deliver_fill(strategy, market, &paired_token, &fill, OrderType::Market)
                            .await
                        {
                            self.state
                                .mark_inconsistency(
                                    "spread_leg_close_failed",
                                    serde_json::json!({
                                        "position_id": paired.id,
                                        "error": e.to_string(),
                                    }),
                                )
                                .await;
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn submit_and_record(
        &self,
        strategy: &str,
        market: &MarketInfo,
        token_id: &str,
        action: &Action,
        _tick: &crate::models::Tick,
        inputs: serde_json::Value,
        sized_usd: f64,
        price: f64,
        order_type: OrderType,
        side: TradeSide,
        fee_bps: f64,
        now_ms: i64,
    ) -> Result<ProcessOutcome> {
        let decision_id = Uuid::new_v4().to_string();

        match self.config.mode {
            TradeMode::Paper => {
                // Verdict first, then the simulated fill mutates state.
                let decision = TradeDecision {
                    id: decision_id.clone(),
                    ts_ms: now_ms,
                    strategy: strategy.to_string(),
                    market_id: market.market_id,
                    condition_id: market.condition_id.clone(),
                    token_id: token_id.to_string(),
                    action: action.kind,
                    size_usd: sized_usd,
                    inputs,
                    status: DecisionStatus::Executed,
                    rejection_reason: None,
                    execution_price: Some(price),
                    position_id: None,
                };
                self.state.record_decision(&decision).await?;
                self.state.note_order(strategy, token_id, now_ms).await?;

                let fill = Fill {
                    token: action.token,
                    side,
                    price,
                    shares: sized_usd / price,
                    fees_usd: 0.0,
                    order_id: Some(format!("paper:{decision_id}")),
                    ts_ms: now_ms,
                    reason: action.reason.clone(),
                };
                let position = self
                    .deliver_fill(strategy, market, token_id, &fill, order_type)
                    .await?;
                self.state
                    .finalize_decision(
                        &decision_id,
                        DecisionStatus::Executed,
                        None,
                        Some(price),
                        Some(&position.id),
                    )
                    .await?;

                self.stats.executed.fetch_add(1, Ordering::Relaxed);
                info!(
                    strategy = %strategy,
                    market_id = market.market_id,
                    kind = action.kind.as_str(),
                    side = ?side,
                    price = price,
                    size_usd = sized_usd,
                    mode = "paper",
                    "trade executed"
                );
                Ok(ProcessOutcome::Executed {
                    decision_id,
                    position_ids: vec![position.id],
                    price,
                })
            }
            TradeMode::Live => {
                // Pending decision before submission; finalized either way.
                let decision = TradeDecision {
                    id: decision_id.clone(),
                    ts_ms: now_ms,
                    strategy: strategy.to_string(),
                    market_id: market.market_id,
                    condition_id: market.condition_id.clone(),
                    token_id: token_id.to_string(),
                    action: action.kind,
                    size_usd: sized_usd,
                    inputs,
                    status: DecisionStatus::Pending,
                    rejection_reason: None,
                    execution_price: None,
                    position_id: None,
                };
                self.state.record_decision(&decision).await?;
                self.state.note_order(strategy, token_id, now_ms).await?;

                let request = OrderRequest {
                    client_order_id: decision_id.clone(),
                    token_id: token_id.to_string(),
                    side,
                    order_type,
                    price,
                    size_usd: sized_usd,
                };

                match self.submit_live(&request).await {
                    Ok((filled_shares, fill_price, partial)) => {
                        let fees_usd = fill_price * filled_shares * fee_bps / 10_000.0;
                        let fill = Fill {
                            token: action.token,
                            side,
                            price: fill_price,
                            shares: filled_shares,
                            fees_usd,
                            order_id: Some(request.client_order_id.clone()),
                            ts_ms: now_ms,
                            reason: action.reason.clone(),
                        };
                        let position = self
                            .deliver_fill(strategy, market, token_id, &fill, order_type)
                            .await?;
                        self.state
                            .finalize_decision(
                                &decision_id,
                                DecisionStatus::Executed,
                                None,
                                Some(fill_price),
                                Some(&position.id),
                            )
                            .await?;

                        self.stats.executed.fetch_add(1, Ordering::Relaxed);
                        if partial {
                            self.stats.partial_fills.fetch_add(1, Ordering::Relaxed);
                        }
                        self.stats.consecutive_submit_errors.store(0, Ordering::Relaxed);
                        info!(
                            strategy = %strategy,
                            market_id = market.market_id,
                            kind = action.kind.as_str(),
                            side = ?side,
                            price = fill_price,
                            shares = filled_shares,
                            partial = partial,
                            mode = "live",
                            "trade executed"
                        );
                        Ok(ProcessOutcome::Executed {
                            decision_id,
                            position_ids: vec![position.id],
                            price: fill_price,
                        })
                    }
                    Err(e) => {
                        self.stats.submit_errors.fetch_add(1, Ordering::Relaxed);
                        let streak = self
                            .stats
                            .consecutive_submit_errors
                            .fetch_add(1, Ordering::Relaxed)
                            + 1;
                        if streak >= DEGRADED_THRESHOLD {
                            warn!(streak, "execution degraded: repeated submission failures");
                        }
                        let reason = if e.to_string().contains("unconfirmed") {
                            "fill_timeout"
                        } else {
                            "submit_failed"
                        };
                        self.state
                            .finalize_decision(&decision_id, DecisionStatus::Rejected, Some(reason), None, None)
                            .await?;
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(strategy = %strategy, error = %e, reason, "live submission failed");
                        Ok(ProcessOutcome::Rejected {
                            decision_id,
                            reason: reason.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Submit with retry/backoff, await the fill, cancel residuals.
    /// Returns `(filled_shares, avg_price, was_partial)`.
    async fn submit_live(&self, request: &OrderRequest) -> Result<(f64, f64, bool)> {
        let max_attempts = self.config.execution.max_retry_attempts.max(1);
        let mut backoff = Duration::from_millis(200);
        let mut attempt = 0;

        let ack = loop {
            match self.client.submit(request).await {
                Ok(ack) => break ack,
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(e.context("order submission exhausted retries"));
                    }
                    warn!(error = %e, attempt, "order submission failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        };

        // Poll for the fill within the bounded order timeout; limit orders
        // in spread mode are upgraded to market after their posting window.
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.execution.order_timeout_seconds.max(1));
        let limit_deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.execution.spread_timeout_seconds.max(1));
        let mut order_id = ack.order_id.clone();
        let mut upgraded = false;

        loop {
            match self.client.order_state(&order_id).await {
                Ok(state) if state.status == "filled" => {
                    let price = state.avg_price.unwrap_or(request.price);
                    // Some responses omit the fill size on full fills.
                    let shares = if state.filled_shares > 0.0 {
                        state.filled_shares
                    } else {
                        request.shares()
                    };
                    return Ok((shares, price, false));
                }
                Ok(state) if state.is_terminal() => {
                    return Err(anyhow!("order {} ended {}", order_id, state.status));
                }
                Ok(state) => {
                    let now = tokio::time::Instant::now();
                    if request.order_type == OrderType::Limit && !upgraded && now >= limit_deadline
                    {
                        // Unfilled passive order: cross the book instead.
                        let _ = self.client.cancel(&order_id).await;
                        let market_req = OrderRequest {
                            order_type: OrderType::Market,
                            price: pricing::effective_price(
                                request.price,
                                request.side,
                                request.size_usd,
                            ),
                            ..request.clone()
                        };
                        let ack = self.client.submit(&market_req).await?;
                        order_id = ack.order_id;
                        upgraded = true;
                        continue;
                    }
                    if now >= deadline {
                        // Cancel the residual; keep whatever filled.
                        if self.client.cancel(&order_id).await.is_err() {
                            self.state
                                .mark_inconsistency(
                                    "unconfirmed_order",
                                    serde_json::json!({
                                        "order_id": order_id,
                                        "client_order_id": request.client_order_id,
                                    }),
                                )
                                .await;
                            return Err(anyhow!("unconfirmed order {order_id}"));
                        }
                        if state.filled_shares > 0.0 {
                            let price = state.avg_price.unwrap_or(request.price);
                            return Ok((state.filled_shares, price, true));
                        }
                        return Err(anyhow!("order {order_id} unfilled within timeout"));
                    }
                    sleep(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "order status poll failed");
                    sleep(Duration::from_millis(500)).await;
                    if tokio::time::Instant::now() >= deadline {
                        self.state
                            .mark_inconsistency(
                                "unconfirmed_order",
                                serde_json::json!({
                                    "order_id": order_id,
                                    "client_order_id": request.client_order_id,
                                }),
                            )
                            .await;
                        return Err(anyhow!("unconfirmed order {order_id}"));
                    }
                }
            }
        }
    }

    async fn deliver_fill(
        &self,
        strategy: &str,
        market: &MarketInfo,
        token_id: &str,
        fill: &Fill,
        _order_type: OrderType,
    ) -> Result<Position> {
        self.state
            .record_fill(strategy, market.market_id, &market.condition_id, token_id, fill)
            .await
    }

    async fn reject(
        &self,
        strategy: &str,
        action: &Action,
        token_id: &str,
        inputs: serde_json::Value,
        reason: &str,
        now_ms: i64,
    ) -> Result<ProcessOutcome> {
        let decision = TradeDecision {
            id: Uuid::new_v4().to_string(),
            ts_ms: now_ms,
            strategy: strategy.to_string(),
            market_id: action.market_id,
            condition_id: action.condition_id.clone(),
            token_id: token_id.to_string(),
            action: action.kind,
            size_usd: action.size_usd,
            inputs,
            status: DecisionStatus::Rejected,
            rejection_reason: Some(reason.to_string()),
            execution_price: None,
            position_id: None,
        };
        self.state.record_decision(&decision).await?;
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(ProcessOutcome::Rejected {
            decision_id: decision.id,
            reason: reason.to_string(),
        })
    }
}

fn inputs_snapshot(
    tick: &crate::models::Tick,
    fresh: &BookSnapshot,
    fee_bps: f64,
    sized_usd: f64,
    mode: TradeMode,
) -> serde_json::Value {
    serde_json::json!({
        "tick": {
            "event": tick.event.as_str(),
            "ts_ms": tick.ts_ms,
            "token": tick.token.as_str(),
            "yes_mid": tick.yes.mid,
            "no_mid": tick.no.mid,
            "spread": tick.spread,
            "imbalance": tick.imbalance,
            "velocity_1m": tick.velocity_1m,
        },
        "fresh_book": {
            "best_bid": fresh.best_bid(),
            "best_ask": fresh.best_ask(),
            "mid": fresh.mid_price(),
            "spread": fresh.spread(),
        },
        "fee_bps": fee_bps,
        "sized_usd": sized_usd,
        "mode": mode.as_str(),
    })
}
