// =============================================================================
// Stream Client — single combined WebSocket connection for all symbols
// =============================================================================
//
// Opens one connection to the combined-stream endpoint carrying every
// configured symbol's 24hr ticker, rather than one socket per symbol. On any
// close or parse error the connection is dropped and reopened after a fixed
// backoff; the caller never sees the error, only a steady stream of ticks on
// whichever per-symbol channel each one belongs to.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::types::Tick;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connects to the upstream combined ticker stream and fans normalized
/// [`Tick`]s out to one inbound channel per symbol.
pub struct StreamClient {
    base_url: String,
    symbols: Vec<String>,
    connection_generation: Arc<AtomicU64>,
    malformed_count: Arc<AtomicU64>,
}

impl StreamClient {
    pub fn new(base_url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            base_url: base_url.into(),
            symbols,
            connection_generation: Arc::new(AtomicU64::new(0)),
            malformed_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn connection_generation(&self) -> u64 {
        self.connection_generation.load(Ordering::Relaxed)
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count.load(Ordering::Relaxed)
    }

    /// Runs forever, reconnecting on any error. `senders` maps uppercase
    /// symbol to the channel owned by that symbol's trading-loop task.
    /// `state.connected` tracks live connectivity and gates trading
    /// admission per §5.E; it is cleared on every disconnect.
    pub async fn run(&self, senders: HashMap<String, mpsc::Sender<Tick>>, state: Arc<AppState>) -> ! {
        loop {
            match self.run_connection(&senders, &state).await {
                Ok(()) => {
                    warn!("stream connection closed cleanly, reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, "stream connection error, reconnecting");
                }
            }
            state.set_connected(false);
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.base_url, streams.join("/"))
    }

    async fn run_connection(
        &self,
        senders: &HashMap<String, mpsc::Sender<Tick>>,
        state: &Arc<AppState>,
    ) -> anyhow::Result<()> {
        let url = self.stream_url();
        info!(url = %url, "connecting to combined ticker stream");

        let (ws_stream, _response) = connect_async(&url).await?;
        let generation = self.connection_generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "combined ticker stream connected");
        state.set_connection_generation(generation);
        state.set_connected(true);

        let (mut write, mut read) = ws_stream.split();
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            self.handle_message(&text, senders);
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            last_activity = Instant::now();
                            if let Ok(text) = String::from_utf8(bytes) {
                                self.handle_message(&text, senders);
                            } else {
                                self.malformed_count.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_activity = Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "stream closed by remote");
                            return Ok(());
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            anyhow::bail!("stream read error: {e}");
                        }
                        None => {
                            return Ok(());
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() > PING_TIMEOUT {
                        anyhow::bail!("no activity within ping timeout");
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        anyhow::bail!("failed to send ping");
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str, senders: &HashMap<String, mpsc::Sender<Tick>>) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.malformed_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Combined envelope: {"stream": "...", "data": {...}}. Flat payloads
        // are used as-is.
        let payload = value.get("data").unwrap_or(&value);

        let tick = match parse_ticker(payload) {
            Some(t) => t,
            None => {
                self.malformed_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Some(sender) = senders.get(&tick.symbol) {
            if sender.try_send(tick).is_err() {
                warn!("tick channel full or closed, dropping tick");
            }
        }
    }
}

/// Parse a Binance 24hr ticker payload. Requires `s, c, v, E, b, a`; `P`
/// (24h percent change) defaults to 0.0 if absent.
fn parse_ticker(payload: &serde_json::Value) -> Option<Tick> {
    let symbol = payload["s"].as_str()?.to_string();
    let price: f64 = payload["c"].as_str()?.parse().ok()?;
    let volume: f64 = payload["v"].as_str()?.parse().ok()?;
    let bid: f64 = payload["b"].as_str()?.parse().ok()?;
    let ask: f64 = payload["a"].as_str()?.parse().ok()?;
    payload["E"].as_i64()?;
    let change_24h = payload["P"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
        / 100.0;

    Some(Tick {
        symbol,
        price,
        volume,
        bid,
        ask,
        change_24h,
        timestamp: Instant::now(),
    })
}
