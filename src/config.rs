//! Engine configuration.
//!
//! Layered: a TOML document (path from `POLYBOT_CONFIG`, default
//! `polybot.toml`) supplies the structured sections; environment variables
//! override paths and credentials. Schema violations are fatal at load.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    Paper,
    Live,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Paper => "paper",
            TradeMode::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    Fixed,
    Kelly,
    VolScaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Catalog/lifecycle poll interval.
    pub scan_interval_seconds: u64,
    /// Subscription membership refresh interval.
    pub subscription_refresh_seconds: u64,
    /// True when ticks come from a REST poller instead of the stream;
    /// widens the freshness and deviation gates.
    pub polling_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 60,
            subscription_refresh_seconds: 300,
            polling_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskConfig {
    pub max_position_usd: f64,
    pub max_total_exposure_usd: f64,
    /// Global cap across all strategies.
    pub max_positions: usize,
    pub max_positions_per_strategy: usize,
    pub max_drawdown_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_usd: 100.0,
            max_total_exposure_usd: 500.0,
            max_positions: 25,
            max_positions_per_strategy: 5,
            max_drawdown_pct: 0.30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SizingConfig {
    pub method: SizingMethod,
    pub fixed_amount_usd: f64,
    pub kelly_fraction: f64,
    pub max_size_usd: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::Fixed,
            fixed_amount_usd: 10.0,
            kelly_fraction: 0.25,
            max_size_usd: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    pub default_order_type: OrderType,
    pub limit_offset_bps: f64,
    pub spread_timeout_seconds: u64,
    pub market_slippage_bps: f64,
    pub max_retry_attempts: u32,
    /// Bounded timeout for order submission.
    pub order_timeout_seconds: u64,
    /// Bounded timeout for fresh orderbook fetches.
    pub book_fetch_timeout_seconds: u64,
    /// Minimum interval between live submissions (rate limit).
    pub min_submit_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_order_type: OrderType::Market,
            limit_offset_bps: 50.0,
            spread_timeout_seconds: 30,
            market_slippage_bps: 10.0,
            max_retry_attempts: 3,
            order_timeout_seconds: 10,
            book_fetch_timeout_seconds: 3,
            min_submit_interval_ms: 250,
        }
    }
}

/// Pre-trade safety gate bounds. Streaming defaults; polling mode widens
/// the freshness and deviation bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SafetyConfig {
    pub max_signal_age_seconds: f64,
    pub polling_max_signal_age_seconds: f64,
    pub max_price_deviation: f64,
    pub polling_max_price_deviation: f64,
    pub max_spread: f64,
    pub max_fee_bps: f64,
    pub cooldown_minutes: f64,
    pub recent_order_window_minutes: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_signal_age_seconds: 5.0,
            polling_max_signal_age_seconds: 120.0,
            max_price_deviation: 0.03,
            polling_max_price_deviation: 0.05,
            max_spread: 0.05,
            max_fee_bps: 200.0,
            cooldown_minutes: 30.0,
            recent_order_window_minutes: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct FiltersConfig {
    pub min_liquidity_usd: f64,
    pub excluded_keywords: Vec<String>,
}

/// Per-strategy overrides, merged over the global sections.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionOverrides {
    pub default_order_type: Option<OrderType>,
    pub limit_offset_bps: Option<f64>,
    pub spread_timeout_seconds: Option<u64>,
    pub market_slippage_bps: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SizingOverrides {
    pub method: Option<SizingMethod>,
    pub fixed_amount_usd: Option<f64>,
    pub kelly_fraction: Option<f64>,
    pub max_size_usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StrategyConfig {
    pub enabled: bool,
    /// Capital allocated to this strategy's accounting bucket.
    pub allocation_usd: f64,
    /// Flat parameter table; each variant validates its known keys at load.
    pub params: BTreeMap<String, toml::Value>,
    pub execution: ExecutionOverrides,
    pub sizing: SizingOverrides,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allocation_usd: 100.0,
            params: BTreeMap::new(),
            execution: ExecutionOverrides::default(),
            sizing: SizingOverrides::default(),
        }
    }
}

/// Exchange endpoints and credentials. Credentials come from the
/// environment only, never the TOML document.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            rest_url: "https://clob.polymarket.com".to_string(),
            api_key: None,
            api_secret: None,
            api_passphrase: None,
        }
    }
}

impl ExchangeConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("POLYBOT_WS_URL") {
            if !v.trim().is_empty() {
                cfg.ws_url = v;
            }
        }
        if let Ok(v) = std::env::var("POLYBOT_REST_URL") {
            if !v.trim().is_empty() {
                cfg.rest_url = v;
            }
        }
        cfg.api_key = std::env::var("CLOB_API_KEY").ok().filter(|v| !v.is_empty());
        cfg.api_secret = std::env::var("CLOB_SECRET").ok().filter(|v| !v.is_empty());
        cfg.api_passphrase = std::env::var("CLOB_PASSPHRASE")
            .ok()
            .filter(|v| !v.is_empty());
        cfg
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some() && self.api_passphrase.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub mode: TradeMode,
    pub settings: Settings,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub execution: ExecutionConfig,
    pub safety: SafetyConfig,
    pub filters: FiltersConfig,
    pub strategies: BTreeMap<String, StrategyConfig>,
    #[serde(skip)]
    pub exchange: ExchangeConfig,
    #[serde(skip)]
    pub database_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: TradeMode::Paper,
            settings: Settings::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            execution: ExecutionConfig::default(),
            safety: SafetyConfig::default(),
            filters: FiltersConfig::default(),
            strategies: BTreeMap::new(),
            exchange: ExchangeConfig::default(),
            database_path: "./polybot.db".to_string(),
        }
    }
}

impl Config {
    /// Load the TOML document and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Paper-mode config with no document, for tools and tests.
    pub fn paper_default() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        dotenv::dotenv().ok();
        self.exchange = ExchangeConfig::from_env();
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            if !v.trim().is_empty() {
                self.database_path = v;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.risk.max_position_usd <= 0.0 {
            return Err(ConfigError::Invalid(
                "risk.max_position_usd must be positive".to_string(),
            ));
        }
        if self.risk.max_total_exposure_usd <= 0.0 {
            return Err(ConfigError::Invalid(
                "risk.max_total_exposure_usd must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.max_drawdown_pct) {
            return Err(ConfigError::Invalid(
                "risk.max_drawdown_pct must be within [0, 1]".to_string(),
            ));
        }
        if self.sizing.kelly_fraction <= 0.0 || self.sizing.kelly_fraction > 1.0 {
            return Err(ConfigError::Invalid(
                "sizing.kelly_fraction must be within (0, 1]".to_string(),
            ));
        }
        if self.safety.max_spread <= 0.0 {
            return Err(ConfigError::Invalid(
                "safety.max_spread must be positive".to_string(),
            ));
        }
        for (name, sc) in &self.strategies {
            if sc.enabled && sc.allocation_usd <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "strategies.{name}.allocation_usd must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Effective order type for a strategy, with overrides applied.
    pub fn order_type_for(&self, strategy: &str) -> OrderType {
        self.strategies
            .get(strategy)
            .and_then(|s| s.execution.default_order_type)
            .unwrap_or(self.execution.default_order_type)
    }

    pub fn sizing_for(&self, strategy: &str) -> SizingConfig {
        let mut sizing = self.sizing.clone();
        if let Some(sc) = self.strategies.get(strategy) {
            if let Some(m) = sc.sizing.method {
                sizing.method = m;
            }
            if let Some(v) = sc.sizing.fixed_amount_usd {
                sizing.fixed_amount_usd = v;
            }
            if let Some(v) = sc.sizing.kelly_fraction {
                sizing.kelly_fraction = v;
            }
            if let Some(v) = sc.sizing.max_size_usd {
                sizing.max_size_usd = v;
            }
        }
        sizing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let doc = r#"
            mode = "paper"

            [settings]
            scan_interval_seconds = 30

            [risk]
            max_position_usd = 50.0
            max_positions = 10

            [sizing]
            method = "kelly"
            kelly_fraction = 0.2

            [execution]
            default_order_type = "limit"
            limit_offset_bps = 25.0

            [filters]
            min_liquidity_usd = 1000.0
            excluded_keywords = ["test"]

            [strategies.book_imbalance]
            enabled = true
            allocation_usd = 200.0

            [strategies.book_imbalance.params]
            min_imbalance = 0.5

            [strategies.book_imbalance.execution]
            default_order_type = "market"
        "#;
        let cfg: Config = toml::from_str(doc).expect("parse");
        assert_eq!(cfg.mode, TradeMode::Paper);
        assert_eq!(cfg.settings.scan_interval_seconds, 30);
        assert_eq!(cfg.sizing.method, SizingMethod::Kelly);
        assert_eq!(cfg.order_type_for("book_imbalance"), OrderType::Market);
        assert_eq!(cfg.order_type_for("scalp"), OrderType::Limit);
        let sizing = cfg.sizing_for("book_imbalance");
        assert!((sizing.kelly_fraction - 0.2).abs() < 1e-12);
    }

    #[test]
    fn unknown_section_is_rejected() {
        let doc = r#"
            mode = "paper"
            [not_a_section]
            x = 1
        "#;
        assert!(toml::from_str::<Config>(doc).is_err());
    }

    #[test]
    fn invalid_drawdown_fails_validation() {
        let mut cfg = Config::default();
        cfg.risk.max_drawdown_pct = 1.5;
        assert!(cfg.validate().is_err());
    }
}
