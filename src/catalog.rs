//! In-memory view of the market catalog.
//!
//! Discovery (out of process) writes catalog rows to the store; the engine
//! refreshes this view periodically and uses it to resolve token ids to
//! markets and to derive the gateway subscription membership.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::FiltersConfig;
use crate::models::{MarketInfo, TokenSide};

#[derive(Default)]
struct CatalogInner {
    by_market: HashMap<i64, Arc<MarketInfo>>,
    by_token: HashMap<String, (i64, TokenSide)>,
}

#[derive(Default)]
pub struct MarketCatalog {
    inner: RwLock<CatalogInner>,
}

impl MarketCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the whole view with a fresh catalog scan.
    pub fn replace_all(&self, markets: Vec<MarketInfo>) {
        let mut inner = CatalogInner::default();
        for market in markets {
            let market = Arc::new(market);
            inner
                .by_token
                .insert(market.yes_token_id.clone(), (market.market_id, TokenSide::Yes));
            inner
                .by_token
                .insert(market.no_token_id.clone(), (market.market_id, TokenSide::No));
            inner.by_market.insert(market.market_id, market);
        }
        *self.inner.write() = inner;
    }

    pub fn upsert(&self, market: MarketInfo) {
        let market = Arc::new(market);
        let mut inner = self.inner.write();
        inner
            .by_token
            .insert(market.yes_token_id.clone(), (market.market_id, TokenSide::Yes));
        inner
            .by_token
            .insert(market.no_token_id.clone(), (market.market_id, TokenSide::No));
        inner.by_market.insert(market.market_id, market);
    }

    pub fn get(&self, market_id: i64) -> Option<Arc<MarketInfo>> {
        self.inner.read().by_market.get(&market_id).cloned()
    }

    /// Resolve a token id to its market and side.
    pub fn lookup_token(&self, token_id: &str) -> Option<(Arc<MarketInfo>, TokenSide)> {
        let inner = self.inner.read();
        let (market_id, side) = *inner.by_token.get(token_id)?;
        let market = inner.by_market.get(&market_id)?.clone();
        Some((market, side))
    }

    pub fn markets(&self) -> Vec<Arc<MarketInfo>> {
        self.inner.read().by_market.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_market.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_market.is_empty()
    }

    /// Token ids the gateway should be subscribed to: tradeable markets
    /// passing the liquidity and keyword filters.
    pub fn subscribable_tokens(&self, filters: &FiltersConfig) -> Vec<String> {
        let inner = self.inner.read();
        let mut tokens = Vec::with_capacity(inner.by_market.len() * 2);
        for market in inner.by_market.values() {
            if !market.accepts_orders() {
                continue;
            }
            if market.liquidity_usd.unwrap_or(0.0) < filters.min_liquidity_usd {
                continue;
            }
            let question = market.question.to_lowercase();
            if filters
                .excluded_keywords
                .iter()
                .any(|kw| !kw.is_empty() && question.contains(&kw.to_lowercase()))
            {
                continue;
            }
            tokens.push(market.yes_token_id.clone());
            tokens.push(market.no_token_id.clone());
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MarketStatus;

    fn market(id: i64, question: &str, liquidity: f64) -> MarketInfo {
        MarketInfo {
            market_id: id,
            condition_id: format!("0x{id:x}"),
            question: question.to_string(),
            yes_token_id: format!("y{id}"),
            no_token_id: format!("n{id}"),
            category: None,
            format: None,
            market_type: None,
            end_date: None,
            status: MarketStatus::Active,
            accepting_orders: true,
            resolved_outcome: None,
            liquidity_usd: Some(liquidity),
        }
    }

    #[test]
    fn token_lookup_resolves_side() {
        let catalog = MarketCatalog::new();
        catalog.replace_all(vec![market(1, "a", 100.0), market(2, "b", 100.0)]);

        let (m, side) = catalog.lookup_token("n2").expect("token");
        assert_eq!(m.market_id, 2);
        assert_eq!(side, TokenSide::No);
        assert!(catalog.lookup_token("y9").is_none());
    }

    #[test]
    fn subscription_membership_applies_filters() {
        let catalog = MarketCatalog::new();
        let mut resolved = market(3, "resolved one", 5000.0);
        resolved.status = MarketStatus::Resolved;
        catalog.replace_all(vec![
            market(1, "Will the test pass?", 5000.0),
            market(2, "Something about politics", 10.0),
            resolved,
            market(4, "An excluded topic", 5000.0),
        ]);

        let filters = FiltersConfig {
            min_liquidity_usd: 100.0,
            excluded_keywords: vec!["excluded".to_string()],
        };
        let mut tokens = catalog.subscribable_tokens(&filters);
        tokens.sort();
        assert_eq!(tokens, vec!["n1".to_string(), "y1".to_string()]);
    }
}
