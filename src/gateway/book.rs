//! Per-token orderbook state.
//!
//! Snapshots are immutable and swapped atomically so readers never lock.
//! Staleness is tracked on wall-clock millis from the exchange timestamp;
//! readiness is cleared on reconnect so no tick is emitted from a ladder
//! that predates the resubscription.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crate::models::{Quotes, TradeSide};

/// Depth levels per side used for the imbalance metric.
pub const IMBALANCE_DEPTH: usize = 5;

/// Velocity lookback window.
pub const VELOCITY_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

/// Immutable L2 snapshot. Bids sorted descending, asks ascending.
#[derive(Debug, Clone, Default)]
pub struct BookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Last trade print seen on this token, if any.
    pub last_trade: Option<LastTrade>,
    /// Exchange timestamp of the snapshot, unix millis.
    pub updated_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LastTrade {
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
    pub ts_ms: i64,
}

impl BookSnapshot {
    #[inline]
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    #[inline]
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    #[inline]
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Top-k depth-weighted asymmetry between bids and asks, in [-1, 1].
    pub fn imbalance(&self) -> Option<f64> {
        if self.bids.is_empty() || self.asks.is_empty() {
            return None;
        }
        let bid_depth: f64 = self
            .bids
            .iter()
            .take(IMBALANCE_DEPTH)
            .map(|l| l.size)
            .sum();
        let ask_depth: f64 = self
            .asks
            .iter()
            .take(IMBALANCE_DEPTH)
            .map(|l| l.size)
            .sum();
        let total = bid_depth + ask_depth;
        if total <= 0.0 {
            return None;
        }
        Some((bid_depth - ask_depth) / total)
    }

    /// A book with both sides present and an uncrossed ladder.
    #[inline]
    pub fn has_liquidity(&self) -> bool {
        matches!(
            (self.best_bid(), self.best_ask()),
            (Some(bid), Some(ask)) if bid < ask
        )
    }

    #[inline]
    pub fn is_crossed(&self) -> bool {
        matches!(
            (self.best_bid(), self.best_ask()),
            (Some(bid), Some(ask)) if bid >= ask
        )
    }

    /// Best-of-book quotes for this token.
    pub fn quotes(&self) -> Quotes {
        Quotes {
            bid: self.best_bid(),
            ask: self.best_ask(),
            mid: self.mid_price(),
            last: self.last_trade.map(|t| t.price),
        }
    }

    /// Build a snapshot from raw levels, sorting and truncating each side.
    pub fn from_levels(
        mut bids: Vec<PriceLevel>,
        mut asks: Vec<PriceLevel>,
        updated_ms: i64,
        max_depth: usize,
    ) -> Self {
        bids.retain(|l| l.size > 0.0 && l.price > 0.0);
        asks.retain(|l| l.size > 0.0 && l.price > 0.0);
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        if max_depth > 0 {
            bids.truncate(max_depth);
            asks.truncate(max_depth);
        }
        Self {
            bids,
            asks,
            last_trade: None,
            updated_ms,
        }
    }

    /// Apply a single level delta (`size == 0` removes the level) and
    /// return the updated snapshot.
    pub fn with_level(&self, side: TradeSide, price: f64, size: f64, ts_ms: i64) -> Self {
        let mut next = self.clone();
        let levels = match side {
            TradeSide::Buy => &mut next.bids,
            TradeSide::Sell => &mut next.asks,
        };
        match levels.iter_mut().find(|l| (l.price - price).abs() < 1e-9) {
            Some(level) if size > 0.0 => level.size = size,
            Some(_) => levels.retain(|l| (l.price - price).abs() >= 1e-9),
            None if size > 0.0 => {
                levels.push(PriceLevel { price, size });
                match side {
                    TradeSide::Buy => levels.sort_by(|a, b| {
                        b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal)
                    }),
                    TradeSide::Sell => levels.sort_by(|a, b| {
                        a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal)
                    }),
                }
            }
            None => {}
        }
        next.updated_ms = ts_ms;
        next
    }

    pub fn with_trade(&self, trade: LastTrade) -> Self {
        let mut next = self.clone();
        next.last_trade = Some(trade);
        next.updated_ms = trade.ts_ms;
        next
    }
}

/// Mid-price sample ring for the 60s velocity metric.
#[derive(Debug, Default)]
struct VelocityRing {
    samples: VecDeque<(i64, f64)>,
}

impl VelocityRing {
    fn observe(&mut self, ts_ms: i64, mid: f64) {
        self.samples.push_back((ts_ms, mid));
        let min_ts = ts_ms - VELOCITY_WINDOW_MS;
        // Keep exactly one sample at or before the window edge so the
        // lookback spans the full 60s once enough history exists.
        while self.samples.len() >= 2 && self.samples[1].0 <= min_ts {
            self.samples.pop_front();
        }
    }

    /// `(mid(t) - mid(t - 60s)) / elapsed_seconds`, oldest in-window sample
    /// when history is short, `None` below two samples.
    fn velocity(&self) -> Option<f64> {
        let (newest_ts, newest_mid) = *self.samples.back()?;
        let (oldest_ts, oldest_mid) = *self.samples.front()?;
        let elapsed_s = (newest_ts - oldest_ts) as f64 / 1000.0;
        if elapsed_s <= 0.0 {
            return None;
        }
        Some((newest_mid - oldest_mid) / elapsed_s)
    }
}

/// Live state for one subscribed token.
pub struct TokenBook {
    book: ArcSwap<BookSnapshot>,
    /// Set once a full snapshot has arrived on the current connection.
    ready: AtomicBool,
    update_count: AtomicU64,
    velocity: Mutex<VelocityRing>,
}

impl Default for TokenBook {
    fn default() -> Self {
        Self {
            book: ArcSwap::new(Arc::new(BookSnapshot::default())),
            ready: AtomicBool::new(false),
            update_count: AtomicU64::new(0),
            velocity: Mutex::new(VelocityRing::default()),
        }
    }
}

impl TokenBook {
    #[inline]
    pub fn load(&self) -> Arc<BookSnapshot> {
        self.book.load_full()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Invalidate on disconnect: served snapshots stay readable for
    /// accounting but no ticks are emitted until a fresh `book` arrives.
    pub fn mark_stale(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn replace(&self, snapshot: BookSnapshot) {
        self.observe_mid(&snapshot);
        self.book.store(Arc::new(snapshot));
        self.ready.store(true, Ordering::Release);
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Apply a delta against the current snapshot. No-op while stale:
    /// deltas cannot repair a ladder we no longer trust.
    pub fn apply_level(&self, side: TradeSide, price: f64, size: f64, ts_ms: i64) -> bool {
        if !self.is_ready() {
            return false;
        }
        let next = self.load().with_level(side, price, size, ts_ms);
        self.observe_mid(&next);
        self.book.store(Arc::new(next));
        self.update_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn apply_trade(&self, trade: LastTrade) -> bool {
        if !self.is_ready() {
            return false;
        }
        let next = self.load().with_trade(trade);
        self.book.store(Arc::new(next));
        self.update_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn velocity_1m(&self) -> Option<f64> {
        self.velocity.lock().velocity()
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    fn observe_mid(&self, snapshot: &BookSnapshot) {
        if let Some(mid) = snapshot.mid_price() {
            self.velocity.lock().observe(snapshot.updated_ms, mid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64) -> PriceLevel {
        PriceLevel { price, size }
    }

    #[test]
    fn snapshot_sorts_and_derives() {
        let snap = BookSnapshot::from_levels(
            vec![level(0.51, 400.0), level(0.52, 900.0)],
            vec![level(0.55, 300.0), level(0.54, 200.0)],
            1_000,
            0,
        );
        assert_eq!(snap.best_bid(), Some(0.52));
        assert_eq!(snap.best_ask(), Some(0.54));
        assert!((snap.mid_price().unwrap() - 0.53).abs() < 1e-9);
        assert!((snap.spread().unwrap() - 0.02).abs() < 1e-9);
        assert!(snap.has_liquidity());
        assert!(!snap.is_crossed());
    }

    #[test]
    fn imbalance_matches_topk_formula() {
        // bids 900+400=1300, asks 200+300=500 -> (1300-500)/1800
        let snap = BookSnapshot::from_levels(
            vec![level(0.52, 900.0), level(0.51, 400.0)],
            vec![level(0.54, 200.0), level(0.55, 300.0)],
            0,
            0,
        );
        let imb = snap.imbalance().unwrap();
        assert!((imb - 800.0 / 1800.0).abs() < 1e-9);
    }

    #[test]
    fn one_sided_book_has_no_liquidity() {
        let snap = BookSnapshot::from_levels(vec![level(0.40, 100.0)], vec![], 0, 0);
        assert!(!snap.has_liquidity());
        assert_eq!(snap.imbalance(), None);
        assert_eq!(snap.mid_price(), None);
    }

    #[test]
    fn level_delta_inserts_updates_and_removes() {
        let snap = BookSnapshot::from_levels(
            vec![level(0.50, 100.0)],
            vec![level(0.55, 100.0)],
            0,
            0,
        );
        let snap = snap.with_level(TradeSide::Buy, 0.52, 50.0, 1);
        assert_eq!(snap.best_bid(), Some(0.52));

        let snap = snap.with_level(TradeSide::Buy, 0.52, 75.0, 2);
        assert_eq!(snap.bids[0].size, 75.0);

        let snap = snap.with_level(TradeSide::Buy, 0.52, 0.0, 3);
        assert_eq!(snap.best_bid(), Some(0.50));
        assert_eq!(snap.updated_ms, 3);
    }

    #[test]
    fn stale_token_rejects_deltas_until_replaced() {
        let token = TokenBook::default();
        assert!(!token.apply_level(TradeSide::Buy, 0.5, 10.0, 1));

        token.replace(BookSnapshot::from_levels(
            vec![level(0.50, 100.0)],
            vec![level(0.54, 100.0)],
            10,
            0,
        ));
        assert!(token.is_ready());
        assert!(token.apply_level(TradeSide::Buy, 0.51, 10.0, 11));

        token.mark_stale();
        assert!(!token.apply_level(TradeSide::Buy, 0.52, 10.0, 12));
        assert!(!token.is_ready());
    }

    #[test]
    fn velocity_uses_window_endpoints() {
        let token = TokenBook::default();
        token.replace(BookSnapshot::from_levels(
            vec![level(0.49, 100.0)],
            vec![level(0.51, 100.0)],
            0,
            0,
        ));
        assert_eq!(token.velocity_1m(), None); // single sample

        token.replace(BookSnapshot::from_levels(
            vec![level(0.55, 100.0)],
            vec![level(0.57, 100.0)],
            30_000,
            0,
        ));
        // mid moved 0.50 -> 0.56 over 30s
        let v = token.velocity_1m().unwrap();
        assert!((v - 0.06 / 30.0).abs() < 1e-9);
    }
}
