//! Tick Router.
//!
//! Single entry point for gateway ticks: applies each strategy's declared
//! capability filter, enriches with the catalog row, and hands the tick to
//! that strategy's worker. Every worker owns its strategy instance and a
//! bounded drop-oldest queue, so one slow strategy cannot stall the rest,
//! and per-token ordering survives end to end. A strategy panic is caught,
//! counted, and logged; it never reaches another strategy or the router.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::catalog::MarketCatalog;
use crate::gateway::queue::{OverflowPolicy, TickQueue};
use crate::models::{Action, MarketInfo, Tick};
#[cfg(test)]
use crate::models::TokenSide;
use crate::state::StateManager;
use crate::strategy::{Strategy, StrategyCaps, StrategyStateView, TickContext};

/// Capability filter derived from a strategy's static declarations.
#[derive(Debug, Clone)]
pub struct TickFilter {
    pub allowed_formats: Vec<String>,
    pub allowed_market_types: Vec<String>,
    pub min_spread: f64,
    pub max_spread: f64,
}

impl TickFilter {
    pub fn from_caps(caps: &StrategyCaps) -> Self {
        Self {
            allowed_formats: caps.formats.clone(),
            allowed_market_types: caps.market_types.clone(),
            min_spread: caps.min_spread,
            max_spread: caps.max_spread,
        }
    }

    pub fn accepts(&self, tick: &Tick, market: &MarketInfo) -> bool {
        if !self.allowed_formats.is_empty() {
            match market.format.as_deref() {
                Some(format) if self.allowed_formats.iter().any(|f| f == format) => {}
                _ => return false,
            }
        }
        if !self.allowed_market_types.is_empty() {
            match market.market_type.as_deref() {
                Some(mt) if self.allowed_market_types.iter().any(|t| t == mt) => {}
                _ => return false,
            }
        }
        if let Some(spread) = tick.spread {
            if spread < self.min_spread || spread > self.max_spread {
                return false;
            }
        }
        true
    }
}

/// An accepted strategy intent, paired with the tick that produced it so
/// the execution gates can check freshness and deviation against it.
#[derive(Debug, Clone)]
pub struct ActionEnvelope {
    pub strategy: String,
    pub action: Action,
    pub tick: Tick,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub delivered: AtomicU64,
    pub filtered: AtomicU64,
    pub failed_ticks: AtomicU64,
    pub actions_emitted: AtomicU64,
}

struct StrategyWorker {
    name: String,
    filter: TickFilter,
    queue: Arc<TickQueue>,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Per-strategy worker queue depth.
    pub worker_queue_capacity: usize,
    /// Router → execution channel depth.
    pub action_channel_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            worker_queue_capacity: 256,
            action_channel_capacity: 128,
        }
    }
}

pub struct TickRouter {
    catalog: Arc<MarketCatalog>,
    workers: Vec<StrategyWorker>,
    unknown_market_drops: AtomicU64,
}

impl TickRouter {
    /// Register strategies, one worker each, and return the action stream
    /// the execution pipeline consumes.
    pub fn new(
        cfg: RouterConfig,
        strategies: Vec<Box<dyn Strategy>>,
        catalog: Arc<MarketCatalog>,
        state: Arc<StateManager>,
    ) -> (Self, mpsc::Receiver<ActionEnvelope>) {
        let (action_tx, action_rx) = mpsc::channel(cfg.action_channel_capacity.max(1));

        let workers = strategies
            .into_iter()
            .map(|strategy| {
                Self::register(
                    strategy,
                    cfg.worker_queue_capacity,
                    catalog.clone(),
                    state.clone(),
                    action_tx.clone(),
                )
            })
            .collect();

        (
            Self {
                catalog,
                workers,
                unknown_market_drops: AtomicU64::new(0),
            },
            action_rx,
        )
    }

    fn register(
        strategy: Box<dyn Strategy>,
        queue_capacity: usize,
        catalog: Arc<MarketCatalog>,
        state: Arc<StateManager>,
        action_tx: mpsc::Sender<ActionEnvelope>,
    ) -> StrategyWorker {
        let caps = strategy.caps().clone();
        let name = caps.name.clone();
        let filter = TickFilter::from_caps(&caps);
        let queue = TickQueue::new(queue_capacity, OverflowPolicy::DropOldest);
        let stats = Arc::new(WorkerStats::default());

        let handle = tokio::spawn(worker_loop(
            strategy,
            name.clone(),
            queue.clone(),
            catalog,
            state,
            action_tx,
            stats.clone(),
        ));

        info!(strategy = %name, version = caps.version, "strategy registered");
        StrategyWorker {
            name,
            filter,
            queue,
            stats,
            handle,
        }
    }

    /// Fan one tick out to every interested strategy.
    pub fn on_tick(&self, tick: &Tick) {
        let Some(market) = self.catalog.get(tick.market_id) else {
            self.unknown_market_drops.fetch_add(1, Ordering::Relaxed);
            return;
        };

        for worker in &self.workers {
            if !worker.filter.accepts(tick, &market) {
                worker.stats.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            worker.queue.push(tick.clone());
        }
    }

    /// Consume the gateway stream until it closes.
    pub async fn run(&self, ticks: Arc<TickQueue>) {
        while let Some(tick) = ticks.recv().await {
            self.on_tick(&tick);
        }
        info!("tick stream closed; router stopping");
    }

    /// Close worker queues and wait for strategies to drain.
    pub async fn shutdown(self) {
        for worker in &self.workers {
            worker.queue.close();
        }
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!(strategy = %worker.name, error = %e, "strategy worker join failed");
            }
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let workers: Vec<serde_json::Value> = self
            .workers
            .iter()
            .map(|w| {
                serde_json::json!({
                    "strategy": w.name,
                    "delivered": w.stats.delivered.load(Ordering::Relaxed),
                    "filtered": w.stats.filtered.load(Ordering::Relaxed),
                    "failed_ticks": w.stats.failed_ticks.load(Ordering::Relaxed),
                    "actions_emitted": w.stats.actions_emitted.load(Ordering::Relaxed),
                    "queue_dropped": w.queue.dropped(),
                })
            })
            .collect();
        serde_json::json!({
            "workers": workers,
            "unknown_market_drops": self.unknown_market_drops.load(Ordering::Relaxed),
        })
    }
}

async fn worker_loop(
    strategy: Box<dyn Strategy>,
    name: String,
    queue: Arc<TickQueue>,
    catalog: Arc<MarketCatalog>,
    state: Arc<StateManager>,
    action_tx: mpsc::Sender<ActionEnvelope>,
    stats: Arc<WorkerStats>,
) {
    let mut strategy = strategy;

    while let Some(tick) = queue.recv().await {
        let Some(market) = catalog.get(tick.market_id) else {
            continue;
        };

        let view = state
            .strategy_state(&name)
            .map(|s| StrategyStateView {
                available_usd: s.available_usd,
                equity: s.equity(),
                open_positions: state.open_position_count(&name),
            })
            .unwrap_or_default();

        // Position on the event token wins; otherwise any open leg on the
        // market routes to the management path.
        let open = state.open_positions_on(&name, tick.market_id);
        let position = open
            .iter()
            .find(|p| p.token == tick.token)
            .or_else(|| open.first())
            .cloned();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if !strategy.filter_tick(&tick) {
                return DispatchOutcome::Filtered;
            }
            let ctx = TickContext {
                tick: &tick,
                market: &market,
                state: view,
            };
            let action = match position.as_ref() {
                Some(position) => strategy.on_position_update(position, &ctx),
                None => strategy.on_tick(&ctx),
            };
            DispatchOutcome::Done(action)
        }));

        match outcome {
            Ok(DispatchOutcome::Filtered) => {
                stats.filtered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(DispatchOutcome::Done(action)) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                if let Some(action) = action {
                    stats.actions_emitted.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        strategy = %name,
                        market_id = tick.market_id,
                        kind = action.kind.as_str(),
                        size_usd = action.size_usd,
                        reason = %action.reason,
                        "strategy action"
                    );
                    let envelope = ActionEnvelope {
                        strategy: name.clone(),
                        action,
                        tick: tick.clone(),
                    };
                    if action_tx.send(envelope).await.is_err() {
                        // Execution side is gone; nothing left to do here.
                        break;
                    }
                }
            }
            Err(panic) => {
                stats.failed_ticks.fetch_add(1, Ordering::Relaxed);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(
                    strategy = %name,
                    market_id = tick.market_id,
                    token_id = %tick.token_id,
                    event = tick.event.as_str(),
                    ts_ms = tick.ts_ms,
                    panic = %message,
                    "strategy panicked on tick"
                );
            }
        }
    }
}

enum DispatchOutcome {
    Filtered,
    Done(Option<Action>),
}
