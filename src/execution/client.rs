//! Exchange order clients and REST access.
//!
//! `OrderClient` is the seam between the pipeline and the exchange: the
//! paper client fills deterministically against the price it is given, the
//! live client signs and submits to the CLOB REST API and is polled for
//! fills. The live client is a process-wide singleton with an internal
//! submission rate limit.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::OrderType;
use crate::gateway::book::{BookSnapshot, PriceLevel};
use crate::models::{de_f64, TradeSide};

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub token_id: String,
    pub side: TradeSide,
    pub order_type: OrderType,
    /// Execution or limit price in (0, 1).
    pub price: f64,
    /// Notional in quote currency.
    pub size_usd: f64,
}

impl OrderRequest {
    pub fn shares(&self) -> f64 {
        if self.price > 0.0 {
            self.size_usd / self.price
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_id: String,
    /// `open`, `filled`, `partially_filled`, `cancelled`, `rejected`.
    pub status: String,
    pub filled_shares: f64,
    pub avg_price: Option<f64>,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "filled" | "cancelled" | "rejected")
    }
}

#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn submit(&self, req: &OrderRequest) -> Result<OrderAck>;
    async fn order_state(&self, order_id: &str) -> Result<OrderState>;
    async fn cancel(&self, order_id: &str) -> Result<()>;
}

// ============================================================================
// Paper client
// ============================================================================

/// Fills everything immediately at the requested price. The pipeline has
/// already applied the slippage model, so the paper fill is exact and the
/// whole path stays deterministic for tests.
#[derive(Default)]
pub struct PaperClient {
    orders: Mutex<HashMap<String, OrderState>>,
}

impl PaperClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderClient for PaperClient {
    async fn submit(&self, req: &OrderRequest) -> Result<OrderAck> {
        if !(req.price.is_finite() && req.price > 0.0 && req.price < 1.0) {
            return Err(anyhow!("invalid price: {}", req.price));
        }
        if !(req.size_usd.is_finite() && req.size_usd > 0.0) {
            return Err(anyhow!("invalid notional: {}", req.size_usd));
        }
        let order_id = format!("paper:{}", req.client_order_id);
        self.orders.lock().insert(
            order_id.clone(),
            OrderState {
                order_id: order_id.clone(),
                status: "filled".to_string(),
                filled_shares: req.shares(),
                avg_price: Some(req.price),
            },
        );
        Ok(OrderAck {
            order_id,
            status: "filled".to_string(),
        })
    }

    async fn order_state(&self, order_id: &str) -> Result<OrderState> {
        self.orders
            .lock()
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown paper order {order_id}"))
    }

    async fn cancel(&self, _order_id: &str) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Live CLOB client
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

#[derive(Debug, Serialize)]
struct ClobOrderPayload {
    token_id: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    size_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<f64>,
    client_order_id: String,
}

#[derive(Debug, Deserialize)]
struct ClobOrderResponse {
    #[serde(alias = "orderID", alias = "orderId")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(alias = "errorMsg", alias = "error", default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClobOrderStatusResponse {
    #[serde(alias = "orderID", alias = "orderId")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    filled_size: Option<String>,
    #[serde(alias = "avgPrice", default)]
    avg_price: Option<String>,
}

pub struct LiveClient {
    client: Client,
    base_url: String,
    creds: ClobCredentials,
    /// Earliest instant the next submission may go out.
    next_submit_at: AsyncMutex<Instant>,
    min_submit_interval: Duration,
    submit_timeout: Duration,
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl LiveClient {
    pub fn new(
        base_url: &str,
        creds: ClobCredentials,
        min_submit_interval: Duration,
        submit_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
            next_submit_at: AsyncMutex::new(Instant::now()),
            min_submit_interval,
            submit_timeout,
        })
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let secret_bytes = URL_SAFE
            .decode(&self.creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&self.creds.secret))
            .or_else(|_| BASE64.decode(&self.creds.secret))
            .context("decode CLOB secret")?;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("POLY_API_KEY".to_string(), self.creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), self.creds.passphrase.clone()),
        ])
    }

    /// One rate-limit token per submission.
    async fn acquire_submit_slot(&self) {
        let mut next = self.next_submit_at.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = Instant::now() + self.min_submit_interval;
    }
}

#[async_trait]
impl OrderClient for LiveClient {
    async fn submit(&self, req: &OrderRequest) -> Result<OrderAck> {
        self.acquire_submit_slot().await;

        let payload = ClobOrderPayload {
            token_id: req.token_id.clone(),
            side: match req.side {
                TradeSide::Buy => "BUY".to_string(),
                TradeSide::Sell => "SELL".to_string(),
            },
            order_type: match req.order_type {
                OrderType::Market => "market".to_string(),
                OrderType::Limit => "limit".to_string(),
            },
            size_usd: req.size_usd,
            limit_price: matches!(req.order_type, OrderType::Limit).then_some(req.price),
            client_order_id: req.client_order_id.clone(),
        };
        let body = serde_json::to_string(&payload).context("serialize order")?;
        let path = "/order";
        let headers = self.auth_headers("POST", path, &body)?;

        debug!(
            token_id = %req.token_id,
            side = ?req.side,
            size_usd = req.size_usd,
            price = req.price,
            "submitting CLOB order"
        );

        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .timeout(self.submit_timeout)
            .header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.body(body).send().await.context("order request")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("order rejected ({status}): {text}"));
        }

        let resp: ClobOrderResponse =
            serde_json::from_str(&text).context("parse order response")?;
        if let Some(err) = resp.error_msg.filter(|e| !e.is_empty()) {
            return Err(anyhow!("CLOB error: {err}"));
        }

        let order_id = resp
            .order_id
            .unwrap_or_else(|| format!("clob:{}", req.client_order_id));
        info!(order_id = %order_id, status = resp.status.as_deref().unwrap_or("accepted"), "CLOB order accepted");
        Ok(OrderAck {
            order_id,
            status: resp.status.unwrap_or_else(|| "accepted".to_string()),
        })
    }

    async fn order_state(&self, order_id: &str) -> Result<OrderState> {
        let path = format!("/order/{order_id}");
        let headers = self.auth_headers("GET", &path, "")?;

        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .timeout(Duration::from_secs(5));
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.send().await.context("order status request")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("order status failed ({status}): {text}"));
        }

        let resp: ClobOrderStatusResponse =
            serde_json::from_str(&text).context("parse order status")?;
        Ok(OrderState {
            order_id: resp.order_id.unwrap_or_else(|| order_id.to_string()),
            status: resp.status.unwrap_or_else(|| "open".to_string()),
            filled_shares: resp
                .filled_size
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            avg_price: resp.avg_price.and_then(|s| s.parse().ok()),
        })
    }

    async fn cancel(&self, order_id: &str) -> Result<()> {
        let path = format!("/order/{order_id}");
        let headers = self.auth_headers("DELETE", &path, "")?;

        let mut request = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .timeout(Duration::from_secs(5));
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.send().await.context("cancel request")?;
        if !response.status().is_success() {
            warn!(order_id = %order_id, status = %response.status(), "cancel failed");
            return Err(anyhow!("cancel failed for {order_id}"));
        }
        Ok(())
    }
}

// ============================================================================
// REST market data (fresh books, fee rates)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RestLevel {
    #[serde(deserialize_with = "de_f64")]
    price: f64,
    #[serde(deserialize_with = "de_f64")]
    size: f64,
}

#[derive(Debug, Deserialize)]
struct RestBook {
    #[serde(default)]
    bids: Vec<RestLevel>,
    #[serde(default)]
    asks: Vec<RestLevel>,
}

#[derive(Debug, Deserialize)]
struct RestFee {
    #[serde(deserialize_with = "de_f64", alias = "fee_rate_bps", alias = "feeRateBps")]
    fee_bps: f64,
}

#[derive(Clone)]
pub struct ExchangeRestClient {
    client: Client,
    base_url: String,
}

impl ExchangeRestClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch_book(&self, token_id: &str, timeout: Duration) -> Result<BookSnapshot> {
        let response = self
            .client
            .get(format!("{}/book", self.base_url))
            .query(&[("token_id", token_id)])
            .timeout(timeout)
            .send()
            .await
            .context("fetch orderbook")?;
        if !response.status().is_success() {
            return Err(anyhow!("book fetch failed: {}", response.status()));
        }
        let book: RestBook = response.json().await.context("parse orderbook")?;
        Ok(BookSnapshot::from_levels(
            book.bids
                .iter()
                .map(|l| PriceLevel {
                    price: l.price,
                    size: l.size,
                })
                .collect(),
            book.asks
                .iter()
                .map(|l| PriceLevel {
                    price: l.price,
                    size: l.size,
                })
                .collect(),
            Utc::now().timestamp_millis(),
            0,
        ))
    }

    /// Exchange-reported taker fee for a token, in bps.
    pub async fn fee_rate_bps(&self, token_id: &str) -> Result<f64> {
        let response = self
            .client
            .get(format!("{}/fee-rate", self.base_url))
            .query(&[("token_id", token_id)])
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .context("fetch fee rate")?;
        if !response.status().is_success() {
            return Err(anyhow!("fee fetch failed: {}", response.status()));
        }
        let fee: RestFee = response.json().await.context("parse fee rate")?;
        Ok(fee.fee_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paper_client_fills_at_requested_price() {
        let client = PaperClient::new();
        let req = OrderRequest {
            client_order_id: "c1".to_string(),
            token_id: "t".to_string(),
            side: TradeSide::Buy,
            order_type: OrderType::Market,
            price: 0.55,
            size_usd: 11.0,
        };
        let ack = client.submit(&req).await.expect("submit");
        assert_eq!(ack.status, "filled");

        let state = client.order_state(&ack.order_id).await.expect("state");
        assert!(state.is_terminal());
        assert!((state.filled_shares - 20.0).abs() < 1e-9);
        assert_eq!(state.avg_price, Some(0.55));
    }

    #[tokio::test]
    async fn paper_client_rejects_bad_inputs() {
        let client = PaperClient::new();
        let mut req = OrderRequest {
            client_order_id: "c2".to_string(),
            token_id: "t".to_string(),
            side: TradeSide::Buy,
            order_type: OrderType::Market,
            price: 1.2,
            size_usd: 10.0,
        };
        assert!(client.submit(&req).await.is_err());
        req.price = 0.5;
        req.size_usd = 0.0;
        assert!(client.submit(&req).await.is_err());
    }
}
