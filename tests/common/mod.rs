// Shared test fixtures for the scenario suite: a stub exchange client that
// implements the same `Exchange` trait as the live Binance client, configured
// up front with the fill price / rejection the scenario needs.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use scalp_engine::exchange::{Exchange, OrderFill, OrderOutcome};

/// A recorded `place_market_order` call, for assertions on what the trading
/// loop actually sent.
#[derive(Debug, Clone)]
pub struct RecordedOrder {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
}

/// Drop-in [`Exchange`] for driving the real trading loop and risk ledger
/// without reaching the network. `set_fill_price` controls the price the
/// next `Filled` order reports; `reject_next_with_percent_price` makes the
/// next order come back `Skipped("PERCENT_PRICE")` exactly once.
pub struct StubExchangeClient {
    balance: RwLock<f64>,
    next_fill_price: RwLock<Option<f64>>,
    reject_percent_price_once: AtomicBool,
    pub orders: Mutex<Vec<RecordedOrder>>,
}

impl StubExchangeClient {
    pub fn new(balance: f64) -> Self {
        Self {
            balance: RwLock::new(balance),
            next_fill_price: RwLock::new(None),
            reject_percent_price_once: AtomicBool::new(false),
            orders: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fill_price(&self, price: f64) {
        *self.next_fill_price.write() = Some(price);
    }

    pub fn reject_next_with_percent_price(&self) {
        self.reject_percent_price_once.store(true, Ordering::SeqCst);
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().len()
    }
}

#[async_trait]
impl Exchange for StubExchangeClient {
    async fn get_server_time(&self) -> anyhow::Result<i64> {
        Ok(0)
    }

    async fn get_balance(&self) -> anyhow::Result<f64> {
        Ok(*self.balance.read())
    }

    async fn place_market_order(&self, symbol: &str, side: &str, quantity: f64) -> OrderOutcome {
        self.orders.lock().push(RecordedOrder {
            symbol: symbol.to_string(),
            side: side.to_string(),
            quantity,
        });

        if self.reject_percent_price_once.swap(false, Ordering::SeqCst) {
            return OrderOutcome::Skipped("PERCENT_PRICE".to_string());
        }

        let price = self.next_fill_price.write().take().unwrap_or(0.0);
        OrderOutcome::Filled(OrderFill {
            order_id: 1,
            fill_price: price,
            quantity,
        })
    }
}
