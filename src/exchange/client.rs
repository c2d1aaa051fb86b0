// =============================================================================
// Exchange Client — HMAC-SHA256 signed requests against Binance Futures
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the exchange.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

/// The Order Executor contract (§5.A): signed account queries and market
/// order submission. Abstracted as a trait so the trading loop can be driven
/// against a stub in tests without reaching the network — `ExchangeClient`
/// is the only production implementation.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_server_time(&self) -> Result<i64>;
    async fn get_balance(&self) -> Result<f64>;
    async fn place_market_order(&self, symbol: &str, side: &str, quantity: f64) -> OrderOutcome;
}

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Symbols whose base-asset precision is 3 decimal places. Everything else
/// rounds to 2. A stepSize fetched from `/fapi/v1/exchangeInfo` would replace
/// this table; see the Open Question in the design notes.
const THREE_DECIMAL_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT"];

/// Successful fill detail returned by `place_market_order`.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: i64,
    pub fill_price: f64,
    pub quantity: f64,
}

/// Outcome of a market order submission. `Skipped` is not an error: the
/// exchange declined the order on a price-band filter that the trading loop
/// treats as a no-op, distinct from `Failed` which represents a fail-fast
/// rejection (bad quantity/notional, permissions, etc).
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    Filled(OrderFill),
    Skipped(String),
    Failed(String),
}

/// Binance Futures-compatible REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Cached difference between server time and local time (ms), refreshed
    /// at most once every 60 s by `get_server_time`.
    time_offset_ms: std::sync::Arc<AtomicI64>,
    time_offset_fetched_at: std::sync::Arc<RwLock<Option<std::time::Instant>>>,
}

impl ExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "ExchangeClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            time_offset_ms: std::sync::Arc::new(AtomicI64::new(0)),
            time_offset_fetched_at: std::sync::Arc::new(RwLock::new(None)),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Timestamp to stamp on a signed request, adjusted by the last known
    /// server skew.
    fn adjusted_timestamp_ms(&self) -> u64 {
        let offset = self.time_offset_ms.load(Ordering::Relaxed);
        (Self::local_timestamp_ms() as i64 + offset) as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.adjusted_timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Server time / clock skew
    // -------------------------------------------------------------------------

    /// `GET /fapi/v1/time`, caching the resulting skew for 60 s.
    #[instrument(skip(self), name = "exchange::get_server_time")]
    pub async fn get_server_time(&self) -> Result<i64> {
        {
            let fetched_at = self.time_offset_fetched_at.read();
            if let Some(at) = *fetched_at {
                if at.elapsed() < Duration::from_secs(60) {
                    let offset = self.time_offset_ms.load(Ordering::Relaxed);
                    return Ok(Self::local_timestamp_ms() as i64 + offset);
                }
            }
        }

        self.resync_server_time().await
    }

    /// Force a re-fetch of server time regardless of the cache age (used on
    /// `-1021` timestamp-out-of-window errors).
    async fn resync_server_time(&self) -> Result<i64> {
        let url = format!("{}/fapi/v1/time", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/time request failed")?;

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse server time response")?;

        let server_time = body["serverTime"]
            .as_i64()
            .context("server time response missing 'serverTime'")?;

        let local = Self::local_timestamp_ms() as i64;
        let offset = server_time - local;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        *self.time_offset_fetched_at.write() = Some(std::time::Instant::now());

        debug!(server_time, offset, "server time resynced");
        Ok(server_time)
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    /// `GET /fapi/v2/account` (signed). Returns `totalWalletBalance` of the
    /// quote asset.
    #[instrument(skip(self), name = "exchange::get_balance")]
    pub async fn get_balance(&self) -> Result<f64> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v2/account request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")?;

        if !status.is_success() {
            anyhow::bail!("exchange GET /fapi/v2/account returned {}: {}", status, body);
        }

        let balance: f64 = body["totalWalletBalance"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| body["totalWalletBalance"].as_f64())
            .context("account response missing 'totalWalletBalance'")?;

        debug!(balance, "balance retrieved");
        Ok(balance)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit a market order with the retry policy: up to 3 attempts, 5xx and
    /// connection errors retried at `attempt · 1 s`; `-4131` (PERCENT_PRICE)
    /// returns `Skipped`; `-1021` triggers a single time resync and retry;
    /// any other rejection returns `Failed` with no retry.
    #[instrument(skip(self), name = "exchange::place_market_order")]
    pub async fn place_market_order(&self, symbol: &str, side: &str, quantity: f64) -> OrderOutcome {
        let quantity = Self::round_quantity(symbol, quantity);
        let mut resynced_once = false;

        for attempt in 1..=3u32 {
            match self.try_place_order(symbol, side, quantity).await {
                Ok(outcome) => match outcome {
                    TryOutcome::Done(o) => return o,
                    TryOutcome::RetryAfterResync if !resynced_once => {
                        resynced_once = true;
                        if let Err(e) = self.resync_server_time().await {
                            warn!(error = %e, "failed to resync server time after -1021");
                        }
                        continue;
                    }
                    TryOutcome::RetryAfterResync => {
                        return OrderOutcome::Failed(
                            "timestamp out of recv window after resync".to_string(),
                        );
                    }
                    TryOutcome::RetryTransient => {
                        if attempt < 3 {
                            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                            continue;
                        }
                        return OrderOutcome::Failed("exhausted retries on transient error".to_string());
                    }
                },
                Err(e) => {
                    warn!(error = %e, attempt, "order request transport error");
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                        continue;
                    }
                    return OrderOutcome::Failed(format!("transport error: {e}"));
                }
            }
        }

        OrderOutcome::Failed("unreachable: retry loop exhausted without outcome".to_string())
    }

    async fn try_place_order(&self, symbol: &str, side: &str, quantity: f64) -> Result<TryOutcome> {
        let params = format!("symbol={symbol}&side={side}&type=MARKET&quantity={quantity}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side, quantity, "placing market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if status.is_success() {
            let order_id = body["orderId"].as_i64().unwrap_or(0);
            let fill_price = body["avgPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let filled_qty = body["executedQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(quantity);

            debug!(symbol, side, order_id, "order filled");
            return Ok(TryOutcome::Done(OrderOutcome::Filled(OrderFill {
                order_id,
                fill_price,
                quantity: filled_qty,
            })));
        }

        if status.is_server_error() {
            warn!(symbol, %status, "exchange returned server error, will retry");
            return Ok(TryOutcome::RetryTransient);
        }

        let code = body["code"].as_i64().unwrap_or(0);
        let msg = body["msg"].as_str().unwrap_or("unknown error").to_string();

        match code {
            -4131 => {
                debug!(symbol, code, %msg, "order skipped (PERCENT_PRICE filter)");
                Ok(TryOutcome::Done(OrderOutcome::Skipped("PERCENT_PRICE".to_string())))
            }
            -1021 => {
                warn!(symbol, "timestamp out of recv window, resyncing");
                Ok(TryOutcome::RetryAfterResync)
            }
            _ if msg.contains("LOT_SIZE") || msg.contains("MIN_NOTIONAL") => {
                warn!(symbol, code, %msg, "order failed (filter rejection)");
                Ok(TryOutcome::Done(OrderOutcome::Failed(msg)))
            }
            _ => {
                warn!(symbol, code, %msg, "order failed");
                Ok(TryOutcome::Done(OrderOutcome::Failed(msg)))
            }
        }
    }

    /// Round a quantity to the exchange's lot precision for `symbol`: 3
    /// decimal places for BTC/ETH pairs, 2 otherwise.
    pub fn round_quantity(symbol: &str, quantity: f64) -> f64 {
        let decimals = if THREE_DECIMAL_SYMBOLS.contains(&symbol) { 3 } else { 2 };
        let factor = 10f64.powi(decimals);
        (quantity * factor).round() / factor
    }

}

#[async_trait]
impl Exchange for ExchangeClient {
    async fn get_server_time(&self) -> Result<i64> {
        ExchangeClient::get_server_time(self).await
    }

    async fn get_balance(&self) -> Result<f64> {
        ExchangeClient::get_balance(self).await
    }

    async fn place_market_order(&self, symbol: &str, side: &str, quantity: f64) -> OrderOutcome {
        ExchangeClient::place_market_order(self, symbol, side, quantity).await
    }
}

enum TryOutcome {
    Done(OrderOutcome),
    RetryTransient,
    RetryAfterResync,
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
