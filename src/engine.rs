//! Engine assembly and lifecycle.
//!
//! Boot order: config sanity → store → state manager → strategies →
//! gateway → router → pipeline, then the periodic loops (catalog refresh,
//! resolution settlement, stats). Shutdown drains in dependency order:
//! gateway ingress stops, router queues drain, in-flight executions get a
//! grace period, state is already durable by construction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::catalog::MarketCatalog;
use crate::config::{Config, TradeMode};
use crate::execution::{
    ClobCredentials, ExchangeRestClient, ExecutionPipeline, GatewayDataSource, LiveClient,
    OrderClient, PaperClient,
};
use crate::gateway::{GatewayConfig, MarketDataGateway};
use crate::router::{RouterConfig, TickRouter};
use crate::state::{StateManager, StateStore};
use crate::strategy::StrategyRegistry;

/// Shutdown grace for in-flight executions.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("state store error: {0}")]
    Store(String),
    #[error("credentials error: {0}")]
    Credentials(String),
}

impl EngineError {
    /// Process exit code contract: 1 config, 2 store, 3 credentials.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::Store(_) => 2,
            EngineError::Credentials(_) => 3,
        }
    }
}

pub async fn run(config: Config) -> Result<(), EngineError> {
    let config = Arc::new(config);

    if config.mode == TradeMode::Live && !config.exchange.has_credentials() {
        return Err(EngineError::Credentials(
            "live mode requires CLOB_API_KEY, CLOB_SECRET, CLOB_PASSPHRASE".to_string(),
        ));
    }
    if config.strategies.values().filter(|s| s.enabled).count() == 0 {
        return Err(EngineError::Config(
            "no enabled strategies configured".to_string(),
        ));
    }

    // Persistent store and authoritative state.
    let store = StateStore::open(&config.database_path)
        .map_err(|e| EngineError::Store(format!("{e:#}")))?;
    let state = StateManager::open(store)
        .await
        .map_err(|e| EngineError::Store(format!("{e:#}")))?;

    // Strategies: build first so configuration errors abort before any
    // network activity.
    let registry = StrategyRegistry::builtin();
    let strategies = registry
        .build_enabled(&config.strategies)
        .map_err(|e| EngineError::Config(e.to_string()))?;
    let caps: HashMap<String, crate::strategy::StrategyCaps> = strategies
        .iter()
        .map(|s| (s.caps().name.clone(), s.caps().clone()))
        .collect();
    for strategy in strategies.iter() {
        let name = &strategy.caps().name;
        let allocation = config
            .strategies
            .get(name.as_str())
            .map(|s| s.allocation_usd)
            .unwrap_or(0.0);
        state
            .register_strategy(name, allocation)
            .await
            .map_err(|e| EngineError::Store(format!("{e:#}")))?;
    }

    // Market catalog, written by discovery, read here.
    let catalog = MarketCatalog::new();
    match state.store().load_markets().await {
        Ok(markets) => {
            info!(markets = markets.len(), "catalog loaded");
            catalog.replace_all(markets);
        }
        Err(e) => warn!(error = %e, "catalog load failed; starting empty"),
    }

    // Shutdown plumbing.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx.clone());

    // Market data gateway.
    let gateway_cfg = GatewayConfig::with_url(&config.exchange.ws_url);
    let (gateway, ticks) = MarketDataGateway::spawn(gateway_cfg, catalog.clone(), shutdown_rx.clone());
    let initial_tokens = catalog.subscribable_tokens(&config.filters);
    info!(tokens = initial_tokens.len(), "initial subscription membership");
    gateway.subscribe(initial_tokens);

    // Execution side.
    let rest = ExchangeRestClient::new(&config.exchange.rest_url)
        .map_err(|e| EngineError::Config(format!("{e:#}")))?;
    let client: Arc<dyn OrderClient> = match config.mode {
        TradeMode::Paper => Arc::new(PaperClient::new()),
        TradeMode::Live => {
            let creds = ClobCredentials {
                api_key: config.exchange.api_key.clone().unwrap_or_default(),
                secret: config.exchange.api_secret.clone().unwrap_or_default(),
                passphrase: config.exchange.api_passphrase.clone().unwrap_or_default(),
            };
            Arc::new(
                LiveClient::new(
                    &config.exchange.rest_url,
                    creds,
                    Duration::from_millis(config.execution.min_submit_interval_ms),
                    Duration::from_secs(config.execution.order_timeout_seconds),
                )
                .map_err(|e| EngineError::Credentials(format!("{e:#}")))?,
            )
        }
    };
    let data = Arc::new(GatewayDataSource::new(
        gateway.clone(),
        rest,
        Duration::from_secs(config.execution.book_fetch_timeout_seconds),
    ));

    let (router, action_rx) = TickRouter::new(
        RouterConfig::default(),
        strategies,
        catalog.clone(),
        state.clone(),
    );
    let router = Arc::new(router);
    let pipeline = ExecutionPipeline::new(
        config.clone(),
        caps,
        catalog.clone(),
        state.clone(),
        data,
        client,
    );

    info!(
        mode = config.mode.as_str(),
        strategies = router.stats()["workers"].as_array().map(|w| w.len()).unwrap_or(0),
        "engine started"
    );

    // Main loops.
    let router_task = {
        let router = router.clone();
        let ticks = ticks.clone();
        tokio::spawn(async move { router.run(ticks).await })
    };
    let pipeline_task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(action_rx).await })
    };
    let lifecycle_task = tokio::spawn(lifecycle_loop(
        config.clone(),
        catalog.clone(),
        state.clone(),
        gateway.clone(),
        shutdown_rx.clone(),
    ));
    let stats_task = tokio::spawn(stats_loop(
        state.clone(),
        gateway.clone(),
        router.clone(),
        pipeline.clone(),
        shutdown_rx.clone(),
    ));

    // Wait for the shutdown signal.
    let mut shutdown_watch = shutdown_rx.clone();
    while !*shutdown_watch.borrow() {
        if shutdown_watch.changed().await.is_err() {
            break;
        }
    }
    info!("shutdown signal received; draining");

    // Gateway ingress stops on the watch flag and closes the tick queue,
    // which ends the router loop; closing worker queues ends the workers,
    // which drops the action senders and ends the pipeline.
    let _ = router_task.await;
    lifecycle_task.abort();
    stats_task.abort();
    let _ = lifecycle_task.await;
    let _ = stats_task.await;
    match Arc::try_unwrap(router) {
        Ok(router) => router.shutdown().await,
        Err(_) => warn!("router still referenced at shutdown"),
    }
    if tokio::time::timeout(DRAIN_GRACE, pipeline_task).await.is_err() {
        warn!("in-flight executions exceeded grace; left for restart reconciliation");
    }

    // State is persisted on every mutation; one last stats row marks the
    // clean exit.
    let snapshot = state.stats_snapshot(|_| None);
    let _ = state
        .store()
        .insert_stats_snapshot(chrono::Utc::now().timestamp_millis(), &snapshot)
        .await;

    info!("engine stopped cleanly");
    Ok(())
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("SIGINT received");
        }
        let _ = shutdown_tx.send(true);
    });
}

/// Catalog refresh, subscription membership, and resolution settlement.
async fn lifecycle_loop(
    config: Arc<Config>,
    catalog: Arc<MarketCatalog>,
    state: Arc<StateManager>,
    gateway: Arc<MarketDataGateway>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut scan = interval(Duration::from_secs(config.settings.scan_interval_seconds.max(1)));
    scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut refresh = interval(Duration::from_secs(
        config.settings.subscription_refresh_seconds.max(1),
    ));
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut subscribed: HashSet<String> = HashSet::new();
    let mut settled_markets: HashSet<i64> = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = scan.tick() => {
                let markets = match state.store().load_markets().await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "catalog refresh failed");
                        continue;
                    }
                };
                catalog.replace_all(markets);

                // Settle freshly-resolved markets.
                for market in catalog.markets() {
                    if settled_markets.contains(&market.market_id) {
                        continue;
                    }
                    let Some(outcome) = market.resolved_outcome else {
                        continue;
                    };
                    if !market.status.is_terminal() {
                        continue;
                    }
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    match state.apply_resolution(market.market_id, outcome, now_ms).await {
                        Ok(settled) if !settled.is_empty() => {
                            info!(
                                market_id = market.market_id,
                                outcome = outcome.as_str(),
                                positions = settled.len(),
                                "market resolved; positions settled"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(market_id = market.market_id, error = %e, "settlement failed");
                            continue;
                        }
                    }
                    settled_markets.insert(market.market_id);
                }
            }
            _ = refresh.tick() => {
                let desired: HashSet<String> =
                    catalog.subscribable_tokens(&config.filters).into_iter().collect();
                let added: Vec<String> = desired.difference(&subscribed).cloned().collect();
                let removed: Vec<String> = subscribed.difference(&desired).cloned().collect();
                if !added.is_empty() {
                    gateway.subscribe(added);
                }
                if !removed.is_empty() {
                    gateway.unsubscribe(removed);
                }
                subscribed = desired;
            }
        }
    }
}

/// Periodic stats snapshot for the dashboard store and the log.
async fn stats_loop(
    state: Arc<StateManager>,
    gateway: Arc<MarketDataGateway>,
    router: Arc<TickRouter>,
    pipeline: Arc<ExecutionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_secs(60));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                let gateway_stats = gateway.stats();
                let mut snapshot = state.stats_snapshot(|token_id| {
                    gateway.book(token_id).and_then(|b| b.mid_price())
                });
                snapshot["gateway"] = serde_json::to_value(gateway_stats).unwrap_or_default();
                snapshot["router"] = router.stats();
                snapshot["execution"] = pipeline.stats();

                let ts_ms = chrono::Utc::now().timestamp_millis();
                if let Err(e) = state.store().insert_stats_snapshot(ts_ms, &snapshot).await {
                    warn!(error = %e, "stats snapshot write failed");
                }
                info!(
                    ticks = gateway_stats.ticks_emitted,
                    dropped = gateway_stats.ticks_dropped,
                    reconnects = gateway_stats.reconnects,
                    open_positions = state.open_position_count_total(),
                    "engine heartbeat"
                );
            }
        }
    }
}
