pub mod client;

pub use client::{Exchange, ExchangeClient, OrderFill, OrderOutcome};
