//! Order sizing and execution pricing.

use crate::config::{SizingConfig, SizingMethod};
use crate::gateway::book::BookSnapshot;
use crate::models::TradeSide;
use crate::strategy::StrategyCaps;

/// Slippage per $100 of notional, in price.
const SLIPPAGE_PER_100_USD: f64 = 0.001;
/// Slippage cap as a fraction of the base price.
const SLIPPAGE_CAP_PCT: f64 = 0.02;

/// Final notional for an entry action: the strategy's ask, bounded by the
/// sizing method, the sizing cap, and the strategy's own position cap.
pub fn size_entry(
    requested_usd: f64,
    sizing: &SizingConfig,
    caps: &StrategyCaps,
    available_usd: f64,
) -> f64 {
    let base = match sizing.method {
        SizingMethod::Fixed => {
            if requested_usd > 0.0 {
                requested_usd
            } else {
                sizing.fixed_amount_usd
            }
        }
        // Fractional allocation of the remaining bankroll; the strategy's
        // requested size acts as a floor under small balances.
        SizingMethod::Kelly => (sizing.kelly_fraction * available_usd)
            .min(requested_usd.max(sizing.fixed_amount_usd) * 4.0),
        // Scale the request down as the requested size grows, a crude
        // market-impact guard for thin books.
        SizingMethod::VolScaled => {
            let requested = if requested_usd > 0.0 {
                requested_usd
            } else {
                sizing.fixed_amount_usd
            };
            requested / (1.0 + requested / 100.0)
        }
    };
    base.min(sizing.max_size_usd).min(caps.max_position_usd)
}

/// Base execution price: BUY crosses to the ask, SELL to the bid.
pub fn base_price(book: &BookSnapshot, side: TradeSide) -> Option<f64> {
    match side {
        TradeSide::Buy => book.best_ask(),
        TradeSide::Sell => book.best_bid(),
    }
}

/// Size-dependent slippage: `base ± 0.001 · (size_usd / 100)`, capped at
/// 2% of the base price, adverse to the trader.
pub fn effective_price(base: f64, side: TradeSide, size_usd: f64) -> f64 {
    let slip = (SLIPPAGE_PER_100_USD * (size_usd / 100.0)).min(SLIPPAGE_CAP_PCT * base);
    let price = match side {
        TradeSide::Buy => base + slip,
        TradeSide::Sell => base - slip,
    };
    price.clamp(0.001, 0.999)
}

/// Passive limit price: posted inside the spread, below mid for buys and
/// above mid for sells.
pub fn limit_price(mid: f64, side: TradeSide, limit_offset_bps: f64) -> f64 {
    let offset = mid * limit_offset_bps / 10_000.0;
    let price = match side {
        TradeSide::Buy => mid - offset,
        TradeSide::Sell => mid + offset,
    };
    price.clamp(0.001, 0.999)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::book::PriceLevel;

    fn book(bid: f64, ask: f64) -> BookSnapshot {
        BookSnapshot::from_levels(
            vec![PriceLevel {
                price: bid,
                size: 100.0,
            }],
            vec![PriceLevel {
                price: ask,
                size: 100.0,
            }],
            0,
            0,
        )
    }

    #[test]
    fn buy_crosses_ask_sell_crosses_bid() {
        let b = book(0.52, 0.54);
        assert_eq!(base_price(&b, TradeSide::Buy), Some(0.54));
        assert_eq!(base_price(&b, TradeSide::Sell), Some(0.52));
    }

    #[test]
    fn slippage_scales_with_size_and_caps() {
        // $100 -> 0.001 adverse move.
        assert!((effective_price(0.54, TradeSide::Buy, 100.0) - 0.541).abs() < 1e-9);
        assert!((effective_price(0.54, TradeSide::Sell, 100.0) - 0.539).abs() < 1e-9);
        // Tiny order: negligible slippage.
        let p = effective_price(0.54, TradeSide::Buy, 1.1);
        assert!((p - 0.540011).abs() < 1e-9);
        // Huge order: capped at 2% of base.
        let capped = effective_price(0.50, TradeSide::Buy, 1_000_000.0);
        assert!((capped - 0.51).abs() < 1e-9);
    }

    #[test]
    fn limit_posts_inside_the_spread() {
        let buy = limit_price(0.53, TradeSide::Buy, 50.0);
        assert!((buy - (0.53 - 0.53 * 0.005)).abs() < 1e-9);
        let sell = limit_price(0.53, TradeSide::Sell, 50.0);
        assert!(sell > 0.53);
    }

    #[test]
    fn fixed_sizing_honors_caps() {
        let sizing = SizingConfig::default();
        let mut caps = StrategyCaps::new("s", "1");
        caps.max_position_usd = 8.0;
        assert!((size_entry(20.0, &sizing, &caps, 1_000.0) - 8.0).abs() < 1e-9);
        // Zero request falls back to the fixed amount.
        assert!((size_entry(0.0, &sizing, &caps, 1_000.0) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn kelly_sizing_is_a_bankroll_fraction() {
        let mut sizing = SizingConfig::default();
        sizing.method = SizingMethod::Kelly;
        sizing.kelly_fraction = 0.1;
        sizing.max_size_usd = 1_000.0;
        let mut caps = StrategyCaps::new("s", "1");
        caps.max_position_usd = 1_000.0;
        let size = size_entry(10.0, &sizing, &caps, 200.0);
        assert!((size - 20.0).abs() < 1e-9);
    }
}
