//! Market Data Gateway.
//!
//! Owns the exchange WebSocket session and the per-token orderbooks, and
//! is the single producer of ticks. Reconnects with capped exponential
//! backoff; on every (re)connect the full membership is resubscribed in
//! batches and all books are invalidated until fresh snapshots arrive.

pub mod book;
pub mod events;
pub mod queue;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::catalog::MarketCatalog;
use crate::models::{Quotes, Tick, TickEvent, TokenSide};

use book::{BookSnapshot, LastTrade, TokenBook};
use events::RawEvent;
use queue::{OverflowPolicy, TickQueue};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ws_url: String,
    /// Capacity of the tick channel to the router.
    pub tick_capacity: usize,
    /// Maximum assets per subscription message.
    pub max_subscription_batch: usize,
    pub ping_interval: Duration,
    /// No inbound traffic for this long is a disconnect.
    pub idle_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Book depth stored per side (0 = unlimited).
    pub max_book_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let ping_interval = Duration::from_secs(30);
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            tick_capacity: 1024,
            max_subscription_batch: 500,
            ping_interval,
            idle_timeout: ping_interval * 2,
            reconnect_base: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            max_book_depth: 20,
        }
    }
}

impl GatewayConfig {
    pub fn with_url(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum GatewayCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Counters surfaced in engine stats.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub events_received: AtomicU64,
    pub ticks_emitted: AtomicU64,
    pub malformed_events: AtomicU64,
    pub unknown_tokens: AtomicU64,
    pub suppressed_no_liquidity: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct GatewayStatsSnapshot {
    pub events_received: u64,
    pub ticks_emitted: u64,
    pub ticks_dropped: u64,
    pub malformed_events: u64,
    pub unknown_tokens: u64,
    pub suppressed_no_liquidity: u64,
    pub reconnects: u64,
}

pub struct MarketDataGateway {
    cfg: GatewayConfig,
    catalog: Arc<MarketCatalog>,
    books: RwLock<HashMap<String, Arc<TokenBook>>>,
    cmd_tx: mpsc::Sender<GatewayCommand>,
    ticks: Arc<TickQueue>,
    stats: GatewayStats,
}

impl MarketDataGateway {
    /// Spawn the gateway worker. Returns the handle and the tick queue the
    /// router consumes.
    pub fn spawn(
        cfg: GatewayConfig,
        catalog: Arc<MarketCatalog>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, Arc<TickQueue>) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<GatewayCommand>(64);
        let ticks = TickQueue::new(cfg.tick_capacity, OverflowPolicy::DropOldestBook);
        let gateway = Arc::new(Self {
            cfg,
            catalog,
            books: RwLock::new(HashMap::with_capacity(256)),
            cmd_tx,
            ticks: ticks.clone(),
            stats: GatewayStats::default(),
        });

        let worker = gateway.clone();
        tokio::spawn(async move {
            worker.run(cmd_rx, shutdown).await;
        });

        (gateway, ticks)
    }

    /// Request subscription. Idempotent; already-subscribed tokens are
    /// ignored by the session loop.
    pub fn subscribe(&self, token_ids: Vec<String>) {
        let token_ids: Vec<String> = token_ids
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if token_ids.is_empty() {
            return;
        }
        let _ = self.cmd_tx.try_send(GatewayCommand::Subscribe(token_ids));
    }

    pub fn unsubscribe(&self, token_ids: Vec<String>) {
        if token_ids.is_empty() {
            return;
        }
        let _ = self.cmd_tx.try_send(GatewayCommand::Unsubscribe(token_ids));
    }

    /// Current snapshot for a token, only while fresh on this connection.
    pub fn book(&self, token_id: &str) -> Option<Arc<BookSnapshot>> {
        let books = self.books.read();
        let token = books.get(token_id)?;
        if !token.is_ready() {
            return None;
        }
        Some(token.load())
    }

    #[cfg(test)]
    fn mark_all_stale(&self) {
        for token in self.books.read().values() {
            token.mark_stale();
        }
    }

    pub fn stats(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            ticks_emitted: self.stats.ticks_emitted.load(Ordering::Relaxed),
            ticks_dropped: self.ticks.dropped(),
            malformed_events: self.stats.malformed_events.load(Ordering::Relaxed),
            unknown_tokens: self.stats.unknown_tokens.load(Ordering::Relaxed),
            suppressed_no_liquidity: self.stats.suppressed_no_liquidity.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut cmd_rx: mpsc::Receiver<GatewayCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut desired: HashSet<String> = HashSet::with_capacity(256);
        let mut backoff = self.cfg.reconnect_base;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Wait for at least one subscription before dialing out.
            while desired.is_empty() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            self.ticks.close();
                            return;
                        }
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => apply_command(&mut desired, cmd),
                        None => {
                            self.ticks.close();
                            return;
                        }
                    },
                }
                if *shutdown.borrow() {
                    self.ticks.close();
                    return;
                }
            }

            match self
                .connect_and_stream(&mut cmd_rx, &mut desired, &mut shutdown)
                .await
            {
                Ok(()) => {
                    backoff = self.cfg.reconnect_base;
                }
                Err(e) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                    warn!(
                        error = %e,
                        backoff_s = backoff.as_secs(),
                        "market ws disconnected; reconnecting"
                    );
                    sleep(backoff + jitter).await;
                    backoff = (backoff * 2).min(self.cfg.reconnect_max);
                }
            }
        }

        self.ticks.close();
        info!("market data gateway stopped");
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<GatewayCommand>,
        desired: &mut HashSet<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        info!(url = %self.cfg.ws_url, assets = desired.len(), "connecting market ws");
        let (ws_stream, resp) = connect_async(&self.cfg.ws_url)
            .await
            .context("connect market ws")?;
        info!(status = %resp.status(), "market ws connected");

        let (mut write, mut read) = ws_stream.split();

        // Everything cached from the previous session is untrusted until a
        // fresh snapshot arrives.
        {
            let books = self.books.read();
            for token in books.values() {
                token.mark_stale();
            }
        }

        // Full-membership resubscription, batched. This also re-requests
        // full book snapshots for every token.
        let membership: Vec<String> = desired.iter().cloned().collect();
        for batch in membership.chunks(self.cfg.max_subscription_batch.max(1)) {
            let sub = serde_json::json!({
                "type": "market",
                "assets_ids": batch,
            });
            write
                .send(Message::Text(sub.to_string()))
                .await
                .context("send market subscription")?;
        }

        let mut ping = interval(self.cfg.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = ping.tick() => {
                    if last_rx.elapsed() > self.cfg.idle_timeout {
                        return Err(anyhow!(
                            "no inbound traffic for {:?}, assuming dead connection",
                            last_rx.elapsed()
                        ));
                    }
                    let _ = write.send(Message::Text("PING".to_string())).await;
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(());
                    };
                    match cmd {
                        GatewayCommand::Subscribe(tokens) => {
                            let fresh: Vec<String> = tokens
                                .into_iter()
                                .filter(|t| desired.insert(t.clone()))
                                .collect();
                            for batch in fresh.chunks(self.cfg.max_subscription_batch.max(1)) {
                                if batch.is_empty() {
                                    continue;
                                }
                                let msg = serde_json::json!({
                                    "assets_ids": batch,
                                    "operation": "subscribe",
                                });
                                let _ = write.send(Message::Text(msg.to_string())).await;
                            }
                        }
                        GatewayCommand::Unsubscribe(tokens) => {
                            let removed: Vec<String> = tokens
                                .into_iter()
                                .filter(|t| desired.remove(t))
                                .collect();
                            if !removed.is_empty() {
                                let msg = serde_json::json!({
                                    "assets_ids": removed,
                                    "operation": "unsubscribe",
                                });
                                let _ = write.send(Message::Text(msg.to_string())).await;
                                let mut books = self.books.write();
                                for token_id in &removed {
                                    books.remove(token_id);
                                }
                            }
                        }
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow!("market ws stream ended"));
                    };
                    last_rx = Instant::now();

                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            for event in events::parse_text_frame(&text) {
                                self.handle_event(event);
                            }
                        }
                        Ok(Message::Binary(bytes)) => {
                            for event in events::parse_binary_frame(&bytes) {
                                self.handle_event(event);
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "market ws close frame");
                            return Err(anyhow!("market ws closed by peer"));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow!("market ws error: {e}"));
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: RawEvent) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        let token_id = event.asset_id().to_string();
        let Some((market, side)) = self.catalog.lookup_token(&token_id) else {
            self.stats.unknown_tokens.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let token = {
            let mut books = self.books.write();
            books.entry(token_id.clone()).or_default().clone()
        };

        let ts_ms = event
            .ts_ms()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let (tick_event, trade_size, trade_side) = match &event {
            RawEvent::Book(book_event) => {
                let snapshot = BookSnapshot::from_levels(
                    book_event.bids.iter().map(Into::into).collect(),
                    book_event.asks.iter().map(Into::into).collect(),
                    ts_ms,
                    self.cfg.max_book_depth,
                );
                token.replace(snapshot);
                (TickEvent::Book, None, None)
            }
            RawEvent::PriceChange(change) => {
                let Some(change_side) = change.trade_side() else {
                    self.stats.malformed_events.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                if !token.apply_level(change_side, change.price, change.size, ts_ms) {
                    // Stale book; wait for the next full snapshot.
                    return;
                }
                (TickEvent::PriceChange, None, None)
            }
            RawEvent::Trade(trade) => {
                let trade_side = trade.trade_side();
                token.apply_trade(LastTrade {
                    price: trade.price,
                    size: trade.size,
                    side: trade_side.unwrap_or(crate::models::TradeSide::Buy),
                    ts_ms,
                });
                (TickEvent::Trade, Some(trade.size), trade_side)
            }
        };

        // No tick from a stale or one-sided ladder.
        if !token.is_ready() {
            return;
        }
        let snapshot = token.load();
        if !snapshot.has_liquidity() {
            self.stats
                .suppressed_no_liquidity
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let event_quotes = snapshot.quotes();
        // Prefer the opposite token's own book when it is live; otherwise
        // derive it as the complement.
        let opposite_id = market.token_id(side.opposite()).to_string();
        let opposite_quotes = self
            .book(&opposite_id)
            .map(|b| b.quotes())
            .unwrap_or_else(|| event_quotes.complement());

        let (yes, no): (Quotes, Quotes) = match side {
            TokenSide::Yes => (event_quotes, opposite_quotes),
            TokenSide::No => (opposite_quotes, event_quotes),
        };

        let tick = Tick {
            market_id: market.market_id,
            condition_id: market.condition_id.clone(),
            token_id,
            token: side,
            event: tick_event,
            ts_ms,
            yes,
            no,
            spread: snapshot.spread(),
            imbalance: snapshot.imbalance(),
            trade_size,
            trade_side,
            velocity_1m: token.velocity_1m(),
        };

        if self.ticks.push(tick) {
            self.stats.ticks_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn apply_command(desired: &mut HashSet<String>, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Subscribe(tokens) => {
            desired.extend(tokens);
        }
        GatewayCommand::Unsubscribe(tokens) => {
            for token in tokens {
                desired.remove(&token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketInfo, MarketStatus};
    use events::{BookEvent, RawLevel, TradeEvent};

    fn catalog_with_market() -> Arc<MarketCatalog> {
        let catalog = MarketCatalog::new();
        catalog.replace_all(vec![MarketInfo {
            market_id: 1,
            condition_id: "0xc1".to_string(),
            question: "q".to_string(),
            yes_token_id: "ty".to_string(),
            no_token_id: "tn".to_string(),
            category: None,
            format: None,
            market_type: None,
            end_date: None,
            status: MarketStatus::Active,
            accepting_orders: true,
            resolved_outcome: None,
            liquidity_usd: Some(1_000.0),
        }]);
        catalog
    }

    fn gateway() -> (Arc<MarketDataGateway>, Arc<TickQueue>) {
        let (tx, rx) = watch::channel(false);
        // Keep the shutdown channel open for the worker task.
        std::mem::forget(tx);
        MarketDataGateway::spawn(GatewayConfig::default(), catalog_with_market(), rx)
    }

    fn book_event(asset: &str, bids: &[(f64, f64)], asks: &[(f64, f64)], ts: &str) -> RawEvent {
        RawEvent::Book(BookEvent {
            asset_id: asset.to_string(),
            bids: bids
                .iter()
                .map(|&(price, size)| RawLevel { price, size })
                .collect(),
            asks: asks
                .iter()
                .map(|&(price, size)| RawLevel { price, size })
                .collect(),
            timestamp: Some(ts.to_string()),
        })
    }

    #[tokio::test]
    async fn book_event_emits_enriched_tick() {
        let (gw, ticks) = gateway();
        gw.handle_event(book_event(
            "ty",
            &[(0.52, 900.0), (0.51, 400.0)],
            &[(0.54, 200.0), (0.55, 300.0)],
            "1700000000000",
        ));

        let tick = ticks.try_recv().expect("tick emitted");
        assert_eq!(tick.market_id, 1);
        assert_eq!(tick.token, TokenSide::Yes);
        assert_eq!(tick.event, TickEvent::Book);
        assert_eq!(tick.yes.bid, Some(0.52));
        assert_eq!(tick.yes.ask, Some(0.54));
        // NO side derived as complement until its own book arrives.
        assert!((tick.no.bid.unwrap() - 0.46).abs() < 1e-9);
        assert!((tick.spread.unwrap() - 0.02).abs() < 1e-9);
        assert!((tick.imbalance.unwrap() - 800.0 / 1800.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_tick_for_unknown_token_or_one_sided_book() {
        let (gw, ticks) = gateway();
        gw.handle_event(book_event("mystery", &[(0.5, 10.0)], &[(0.6, 10.0)], "1"));
        assert!(ticks.try_recv().is_none());
        assert_eq!(gw.stats().unknown_tokens, 1);

        gw.handle_event(book_event("ty", &[(0.5, 10.0)], &[], "1"));
        assert!(ticks.try_recv().is_none());
        assert_eq!(gw.stats().suppressed_no_liquidity, 1);
    }

    #[tokio::test]
    async fn trade_event_carries_size_and_side() {
        let (gw, ticks) = gateway();
        gw.handle_event(book_event("ty", &[(0.5, 10.0)], &[(0.52, 10.0)], "1000"));
        ticks.try_recv().expect("book tick");

        gw.handle_event(RawEvent::Trade(TradeEvent {
            asset_id: "ty".to_string(),
            price: 0.51,
            size: 42.0,
            side: Some("SELL".to_string()),
            timestamp: Some("2000".to_string()),
        }));
        let tick = ticks.try_recv().expect("trade tick");
        assert_eq!(tick.event, TickEvent::Trade);
        assert_eq!(tick.trade_size, Some(42.0));
        assert_eq!(tick.yes.last, Some(0.51));
    }

    #[tokio::test]
    async fn reconnect_invalidates_books_until_fresh_snapshot() {
        let (gw, ticks) = gateway();
        gw.handle_event(book_event("ty", &[(0.50, 10.0)], &[(0.52, 10.0)], "1000"));
        assert!(ticks.try_recv().is_some());
        assert!(gw.book("ty").is_some());

        // Disconnect: everything cached is untrusted.
        gw.mark_all_stale();
        assert!(gw.book("ty").is_none());

        // Deltas against a stale ladder emit nothing.
        gw.handle_event(RawEvent::PriceChange(events::PriceChangeEvent {
            asset_id: "ty".to_string(),
            price: 0.51,
            size: 5.0,
            side: "BUY".to_string(),
            timestamp: Some("2000".to_string()),
        }));
        assert!(ticks.try_recv().is_none());

        // The post-reconnect snapshot restores tick flow.
        gw.handle_event(book_event("ty", &[(0.49, 10.0)], &[(0.53, 10.0)], "3000"));
        let tick = ticks.try_recv().expect("authoritative snapshot tick");
        assert_eq!(tick.yes.bid, Some(0.49));
    }

    #[tokio::test]
    async fn opposite_book_takes_precedence_over_complement() {
        let (gw, ticks) = gateway();
        gw.handle_event(book_event("ty", &[(0.52, 10.0)], &[(0.54, 10.0)], "1000"));
        ticks.try_recv().expect("yes tick");

        // Explicit NO book differs slightly from the complement.
        gw.handle_event(book_event("tn", &[(0.45, 10.0)], &[(0.47, 10.0)], "1001"));
        let tick = ticks.try_recv().expect("no tick");
        assert_eq!(tick.token, TokenSide::No);
        assert_eq!(tick.no.bid, Some(0.45));
        // YES side now comes from its live book, not the complement.
        assert_eq!(tick.yes.bid, Some(0.52));
    }
}
