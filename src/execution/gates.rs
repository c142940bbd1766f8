//! Pre-trade safety gates.
//!
//! Applied in order; the first failure short-circuits and becomes the
//! decision's rejection reason. Boundary values pass: a signal exactly at
//! the age limit, a spread exactly at the cap, a deviation exactly at the
//! bound are all accepted. Count and drawdown limits reject at the limit.

use crate::config::{RiskConfig, SafetyConfig};
use crate::gateway::book::BookSnapshot;
use crate::models::{Action, ActionKind, MarketInfo, Tick};
use crate::state::StateManager;
use crate::strategy::StrategyCaps;

/// A gate failure: `code` is the stable rejection reason recorded in the
/// decision log, `detail` is for the log line only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: &'static str,
    pub detail: String,
}

impl Rejection {
    fn new(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

pub struct GateContext<'a> {
    pub strategy: &'a str,
    pub action: &'a Action,
    pub tick: &'a Tick,
    pub market: &'a MarketInfo,
    pub caps: &'a StrategyCaps,
    pub safety: &'a SafetyConfig,
    pub risk: &'a RiskConfig,
    /// Final notional after sizing.
    pub sized_usd: f64,
    /// Fresh snapshot for the action's target token.
    pub fresh_book: &'a BookSnapshot,
    /// Exchange-reported fee; lookup failures arrive here as 0.
    pub fee_bps: f64,
    pub now_ms: i64,
    /// Widens freshness/deviation bounds when ticks come from polling.
    pub polling_mode: bool,
    pub state: &'a StateManager,
}

pub fn run_gates(ctx: &GateContext<'_>) -> Result<(), Rejection> {
    let opens = ctx.action.kind.opens_exposure();
    let creates_position = matches!(
        ctx.action.kind,
        ActionKind::OpenLong | ActionKind::OpenSpread
    );

    // Closed or non-accepting markets take no new exposure.
    if opens && !ctx.market.accepts_orders() {
        return Err(Rejection::new(
            "market_not_accepting",
            format!("market {} status {}", ctx.market.market_id, ctx.market.status.as_str()),
        ));
    }

    // 1. Signal freshness.
    let max_age_s = if ctx.polling_mode {
        ctx.safety.polling_max_signal_age_seconds
    } else {
        ctx.safety.max_signal_age_seconds
    };
    let age_s = ctx.tick.age_ms(ctx.now_ms) as f64 / 1000.0;
    if age_s > max_age_s {
        return Err(Rejection::new(
            "signal_age",
            format!("signal {age_s:.1}s old, limit {max_age_s:.1}s"),
        ));
    }

    // 2. Price deviation against the fresh book.
    let Some(signal_mid) = ctx.tick.quotes(ctx.action.token).mid else {
        return Err(Rejection::new("no_liquidity", "signal tick has no mid"));
    };
    let Some(live_mid) = ctx.fresh_book.mid_price() else {
        return Err(Rejection::new("no_liquidity", "fresh book has no mid"));
    };
    let max_deviation = if ctx.polling_mode {
        ctx.safety.polling_max_price_deviation
    } else {
        ctx.safety.max_price_deviation
    };
    if signal_mid > 0.0 {
        let deviation = (live_mid - signal_mid).abs() / signal_mid;
        if deviation > max_deviation {
            return Err(Rejection::new(
                "price_deviation",
                format!("moved {:.2}% since signal, limit {:.2}%", deviation * 100.0, max_deviation * 100.0),
            ));
        }
    }

    // 3. Spread.
    let max_spread = ctx.safety.max_spread.min(ctx.caps.max_spread);
    match ctx.fresh_book.spread() {
        Some(spread) if spread > max_spread => {
            return Err(Rejection::new(
                "spread",
                format!("spread {spread:.3} above limit {max_spread:.3}"),
            ));
        }
        Some(_) => {}
        None => return Err(Rejection::new("no_liquidity", "one-sided fresh book")),
    }

    // 4. Fee rate.
    if ctx.fee_bps > ctx.safety.max_fee_bps {
        return Err(Rejection::new(
            "fee_rate",
            format!("fee {} bps above limit {}", ctx.fee_bps, ctx.safety.max_fee_bps),
        ));
    }

    // Exits are done here; the remaining gates bound new exposure.
    if !opens {
        return Ok(());
    }

    // 5. Duplicate position.
    if creates_position {
        if ctx
            .state
            .get_position(ctx.strategy, ctx.market.market_id, ctx.action.token)
            .is_some()
        {
            return Err(Rejection::new(
                "duplicate_position",
                format!(
                    "open {} position already held on market {}",
                    ctx.action.token.as_str(),
                    ctx.market.market_id
                ),
            ));
        }
        if ctx.action.kind == ActionKind::OpenSpread
            && ctx
                .state
                .get_position(ctx.strategy, ctx.market.market_id, ctx.action.token.opposite())
                .is_some()
        {
            return Err(Rejection::new(
                "duplicate_position",
                "spread leg already held".to_string(),
            ));
        }
    }

    // 6. Recent order on the same token (catches untracked fills).
    let token_id = ctx.market.token_id(ctx.action.token);
    if let Some(last_order) = ctx.state.last_order_at(ctx.strategy, token_id) {
        let window_ms = (ctx.safety.recent_order_window_minutes * 60_000.0) as i64;
        if ctx.now_ms - last_order < window_ms {
            return Err(Rejection::new(
                "recent_order",
                format!("order on {token_id} {}s ago", (ctx.now_ms - last_order) / 1000),
            ));
        }
    }

    // 7. Risk limits.
    if creates_position {
        let per_strategy_cap = ctx.risk.max_positions_per_strategy.min(ctx.caps.max_positions);
        if ctx.state.open_position_count(ctx.strategy) >= per_strategy_cap {
            return Err(Rejection::new(
                "position_limit",
                format!("{per_strategy_cap} open positions"),
            ));
        }
        if ctx.state.open_position_count_total() >= ctx.risk.max_positions {
            return Err(Rejection::new(
                "position_limit_global",
                format!("{} open positions globally", ctx.risk.max_positions),
            ));
        }
    }
    let exposure = ctx.state.total_exposure(ctx.strategy);
    if exposure + ctx.sized_usd > ctx.risk.max_total_exposure_usd {
        return Err(Rejection::new(
            "exposure_limit",
            format!(
                "exposure {:.2} + {:.2} above {:.2}",
                exposure, ctx.sized_usd, ctx.risk.max_total_exposure_usd
            ),
        ));
    }
    if !ctx.state.has_capacity(ctx.strategy, ctx.sized_usd) {
        return Err(Rejection::new(
            "insufficient_capital",
            format!("need {:.2} USD", ctx.sized_usd),
        ));
    }
    if let Some(state) = ctx.state.strategy_state(ctx.strategy) {
        if state.drawdown_pct() >= ctx.risk.max_drawdown_pct {
            return Err(Rejection::new(
                "drawdown_limit",
                format!("drawdown {:.1}%", state.drawdown_pct() * 100.0),
            ));
        }
    }

    // 8. Cooldown.
    if creates_position
        && ctx.state.is_in_cooldown(
            ctx.strategy,
            ctx.market.market_id,
            ctx.safety.cooldown_minutes,
            ctx.now_ms,
        )
    {
        return Err(Rejection::new(
            "cooldown",
            format!("market {} in cooldown", ctx.market.market_id),
        ));
    }

    Ok(())
}
