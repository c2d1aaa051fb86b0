// =============================================================================
// Configuration — environment-variable driven engine settings
// =============================================================================
//
// Immutable parameters (API credentials, symbols, sizing, risk limits) are
// read once at startup from the environment. The small mutable subset
// (trading mode, symbol list) is additionally persisted to a JSON file with
// an atomic tmp + rename write so an operator-initiated pause survives a
// restart. Trade history and ledger state are not persisted.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
    ]
}

fn default_position_size_usd() -> f64 {
    50.0
}

fn default_max_positions() -> u32 {
    3
}

fn default_max_daily_loss() -> f64 {
    25.0
}

fn default_stop_loss_pct() -> f64 {
    0.002
}

fn default_take_profit_pct() -> f64 {
    0.006
}

fn default_max_hold_seconds() -> u64 {
    300
}

fn default_min_signal_strength() -> f64 {
    0.55
}

fn default_min_signal_interval_seconds() -> u64 {
    10
}

/// Engine configuration. `api_key`/`api_secret` are read straight from the
/// environment and never persisted; everything else round-trips through
/// `runtime_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub api_secret: String,

    #[serde(default)]
    pub use_testnet: bool,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_position_size_usd")]
    pub position_size_usd: f64,

    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    #[serde(default = "default_max_hold_seconds")]
    pub max_hold_seconds: u64,

    #[serde(default = "default_min_signal_strength")]
    pub min_signal_strength: f64,

    #[serde(default = "default_min_signal_interval_seconds")]
    pub min_signal_interval_seconds: u64,

    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(skip, default = "default_dashboard_port")]
    pub dashboard_port: u16,

    #[serde(skip)]
    pub dashboard_admin_token: String,
}

fn default_dashboard_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            use_testnet: true,
            symbols: default_symbols(),
            position_size_usd: default_position_size_usd(),
            max_positions: default_max_positions(),
            max_daily_loss: default_max_daily_loss(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            max_hold_seconds: default_max_hold_seconds(),
            min_signal_strength: default_min_signal_strength(),
            min_signal_interval_seconds: default_min_signal_interval_seconds(),
            trading_mode: TradingMode::Paused,
            dashboard_port: default_dashboard_port(),
            dashboard_admin_token: String::new(),
        }
    }
}

impl Config {
    /// Build configuration from the process environment, falling back to a
    /// persisted `runtime_config.json` (if present) for the mutable subset,
    /// then to defaults.
    pub fn from_env(persisted_path: impl AsRef<Path>) -> Self {
        let mut cfg = match Self::load(&persisted_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "no persisted runtime config found, starting from defaults");
                Self::default()
            }
        };

        cfg.api_key = std::env::var("API_KEY").unwrap_or_default();
        cfg.api_secret = std::env::var("API_SECRET").unwrap_or_default();
        cfg.dashboard_admin_token = std::env::var("DASHBOARD_ADMIN_TOKEN").unwrap_or_default();

        if let Ok(v) = std::env::var("USE_TESTNET") {
            cfg.use_testnet = parse_bool(&v, cfg.use_testnet);
        }
        if let Ok(v) = std::env::var("SYMBOLS") {
            let symbols: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                cfg.symbols = symbols;
            }
        }
        if let Ok(v) = std::env::var("POSITION_SIZE_USD") {
            if let Ok(n) = v.parse() {
                cfg.position_size_usd = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_POSITIONS") {
            if let Ok(n) = v.parse() {
                cfg.max_positions = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_DAILY_LOSS") {
            if let Ok(n) = v.parse() {
                cfg.max_daily_loss = n;
            }
        }
        if let Ok(v) = std::env::var("STOP_LOSS_PCT") {
            if let Ok(n) = v.parse() {
                cfg.stop_loss_pct = n;
            }
        }
        if let Ok(v) = std::env::var("TAKE_PROFIT_PCT") {
            if let Ok(n) = v.parse() {
                cfg.take_profit_pct = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_HOLD_SECONDS") {
            if let Ok(n) = v.parse() {
                cfg.max_hold_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("MIN_SIGNAL_STRENGTH") {
            if let Ok(n) = v.parse() {
                cfg.min_signal_strength = n;
            }
        }
        if let Ok(v) = std::env::var("MIN_SIGNAL_INTERVAL") {
            if let Ok(n) = v.parse() {
                cfg.min_signal_interval_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("DASHBOARD_PORT") {
            if let Ok(n) = v.parse() {
                cfg.dashboard_port = n;
            }
        }

        info!(
            symbols = ?cfg.symbols,
            use_testnet = cfg.use_testnet,
            max_positions = cfg.max_positions,
            trading_mode = %cfg.trading_mode,
            "configuration resolved"
        );

        cfg
    }

    /// Load the persisted mutable subset from `path`.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        Ok(cfg)
    }

    /// Persist the mutable subset (trading mode, symbols) to `path` using an
    /// atomic write: write to `.tmp`, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// REST base URL for the configured network.
    pub fn rest_base_url(&self) -> &'static str {
        if self.use_testnet {
            "https://testnet.binancefuture.com"
        } else {
            "https://fapi.binance.com"
        }
    }

    /// Combined stream base URL for the configured network.
    pub fn stream_base_url(&self) -> &'static str {
        if self.use_testnet {
            "wss://stream.binancefuture.com"
        } else {
            "wss://fstream.binance.com"
        }
    }
}

fn parse_bool(v: &str, default: bool) -> bool {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
