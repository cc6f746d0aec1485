// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : perp_mm: perpetual-futures market-making decision engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams Bybit best bid/ask and private executions/positions into
          lock-protected caches, runs one quoting mode (flat, two-sided ladder,
          long-only ladder) on a fixed cadence under inventory / notional /
          stop-loss limits, and dispatches cancel-replace order intents.
=============================================================================
*/
use clap::Parser;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::InstrumentMeta;
use crate::strategy::QuoteParams;

/// Jaringan Bybit (endpoint default per jaringan)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.bybit.com",
            Network::Testnet => "https://api-testnet.bybit.com",
        }
    }

    pub fn default_public_ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "wss://stream.bybit.com/v5/public/linear",
            Network::Testnet => "wss://stream-testnet.bybit.com/v5/public/linear",
        }
    }

    pub fn default_private_ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "wss://stream.bybit.com/v5/private",
            Network::Testnet => "wss://stream-testnet.bybit.com/v5/private",
        }
    }
}

/// Sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Bybit,
}

impl FeedMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(FeedMode::Mock),
            "bybit" | "live" => Some(FeedMode::Bybit),
            _ => None,
        }
    }
}

// ===== Mode quoting =====
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuoteMode {
    FlatTwoSided,
    LadderTwoSided,
    LadderLongOnly,
}

impl QuoteMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat_two_sided" | "flat" => Some(QuoteMode::FlatTwoSided),
            "ladder_two_sided" | "ladder" | "two_sided" => Some(QuoteMode::LadderTwoSided),
            "ladder_long_only" | "long_only" | "lo" => Some(QuoteMode::LadderLongOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteMode::FlatTwoSided => "flat_two_sided",
            QuoteMode::LadderTwoSided => "ladder_two_sided",
            QuoteMode::LadderLongOnly => "ladder_long_only",
        }
    }

    pub fn uses_positions(&self) -> bool { !matches!(self, QuoteMode::FlatTwoSided) }
}

fn parse_mode(s: &str) -> Result<QuoteMode, String> {
    QuoteMode::parse_one(s).ok_or_else(|| format!("unknown quoting mode '{s}'"))
}

fn parse_feed(s: &str) -> Result<FeedMode, String> {
    FeedMode::parse_one(s).ok_or_else(|| format!("unknown feed mode '{s}'"))
}

const LINEAR_BOOK_DEPTHS: [u32; 5] = [1, 50, 200, 500, 1000];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("{0} must not be negative")]
    Negative(&'static str),
    #[error("ladder modes need ladder_levels >= 1")]
    NoLadderLevels,
    #[error("live trading needs BYBIT_API_KEY and BYBIT_API_SECRET")]
    MissingCredentials,
    #[error("orderbook depth {0} is not offered for linear perps (1, 50, 200, 500, 1000)")]
    UnsupportedDepth(u32),
    #[error("instrument overrides need all of tick_size, lot_size and min_qty")]
    PartialInstrumentOverride,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "perp-mm", about = "Perpetual-futures market-making decision engine")]
pub struct Args {
    // symbol & mode
    #[arg(long, env = "MM_SYMBOL", default_value = "BTCUSDT")]
    pub symbol: String,
    #[arg(long, env = "MM_MODE", default_value = "ladder_long_only", value_parser = parse_mode)]
    pub mode: QuoteMode,

    // pricing
    #[arg(long, env = "MM_MIN_SPREAD_BPS", default_value = "1")]
    pub min_spread_bps: Decimal,
    #[arg(long, env = "MM_SPREAD_FACTOR", default_value = "1")]
    pub spread_factor: Decimal,
    #[arg(long, env = "MM_BUDGET_USD", default_value = "10")]
    pub budget_usd: Decimal,

    // inventory / risk
    #[arg(long, env = "MM_MAX_NET_QTY", default_value = "0.01")]
    pub max_net_qty: Decimal,
    #[arg(long, env = "MM_TP_SPREAD_BPS", default_value = "10")]
    pub tp_spread_bps: Decimal,
    #[arg(long, env = "MM_LADDER_LEVELS", default_value_t = 3)]
    pub ladder_levels: u32,
    #[arg(long, env = "MM_STOP_LOSS_BPS", default_value = "0", allow_hyphen_values = true)]
    pub stop_loss_bps: Decimal,
    #[arg(long, env = "MM_GROSS_NOTIONAL_CAP", default_value = "0", allow_hyphen_values = true)]
    pub gross_notional_cap: Decimal,
    #[arg(long, env = "MM_BUY_POSITION_IDX", default_value_t = 1)]
    pub buy_position_idx: u8,
    #[arg(long, env = "MM_SELL_POSITION_IDX", default_value_t = 2)]
    pub sell_position_idx: u8,

    // loop
    #[arg(long, env = "MM_TICK_MS", default_value_t = 3000)]
    pub tick_ms: u64,
    #[arg(long, env = "MM_MAX_TICKS", default_value_t = 0)]
    pub max_ticks: u64,
    #[arg(long, env = "MM_REFRESH_DRIFT_BPS", default_value = "0", allow_hyphen_values = true)]
    pub refresh_drift_bps: Decimal,
    #[arg(long, env = "MM_READY_TIMEOUT_MS", default_value_t = 5000)]
    pub ready_timeout_ms: u64,
    #[arg(long, env = "MM_FLATTEN_ON_EXIT", default_value_t = false)]
    pub flatten_on_exit: bool,

    // feed / venue
    #[arg(long, env = "FEED_MODE", default_value = "bybit", value_parser = parse_feed)]
    pub feed_mode: FeedMode,
    #[arg(long, env = "BYBIT_RUN_LIVE", default_value_t = false)]
    pub live: bool,
    #[arg(long, env = "BYBIT_TESTNET", default_value_t = false)]
    pub testnet: bool,
    #[arg(long, env = "BYBIT_REST_URL")]
    pub rest_url: Option<String>,
    #[arg(long, env = "BYBIT_WS_PUBLIC_URL")]
    pub ws_public_url: Option<String>,
    #[arg(long, env = "BYBIT_WS_PRIVATE_URL")]
    pub ws_private_url: Option<String>,
    #[arg(long, env = "BYBIT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    #[arg(long, env = "BYBIT_API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,
    #[arg(long, env = "BYBIT_RECV_WINDOW", default_value_t = 5000)]
    pub recv_window: u64,
    /// depth 1 streams snapshots only; deeper books arrive as snapshot + deltas
    #[arg(long, env = "MM_ORDERBOOK_DEPTH", default_value_t = 1)]
    pub orderbook_depth: u32,

    // instrument overrides (skip the REST lookup)
    #[arg(long, env = "MM_TICK_SIZE")]
    pub tick_size: Option<Decimal>,
    #[arg(long, env = "MM_LOT_SIZE")]
    pub lot_size: Option<Decimal>,
    #[arg(long, env = "MM_MIN_QTY")]
    pub min_qty: Option<Decimal>,

    // metrics
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
}

impl Args {
    pub fn network(&self) -> Network {
        if self.testnet { Network::Testnet } else { Network::Mainnet }
    }

    pub fn rest_url(&self) -> String {
        self.rest_url.clone().unwrap_or_else(|| self.network().default_rest_url().to_string())
    }

    pub fn ws_public_url(&self) -> String {
        self.ws_public_url.clone().unwrap_or_else(|| self.network().default_public_ws_url().to_string())
    }

    pub fn ws_private_url(&self) -> String {
        self.ws_private_url.clone().unwrap_or_else(|| self.network().default_private_ws_url().to_string())
    }

    /// Both halves of the key pair, non-empty.
    pub fn credentials(&self) -> Option<(String, String)> {
        match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(k), Some(s)) if !k.trim().is_empty() && !s.trim().is_empty() => {
                Some((k.trim().to_string(), s.trim().to_string()))
            }
            _ => None,
        }
    }

    pub fn quote_params(&self) -> QuoteParams {
        QuoteParams {
            min_spread_bps: self.min_spread_bps,
            spread_factor: self.spread_factor,
            budget_usd: self.budget_usd,
            max_net_qty: self.max_net_qty,
            tp_spread_bps: self.tp_spread_bps,
            ladder_levels: self.ladder_levels,
            stop_loss_bps: self.stop_loss_bps,
            gross_notional_cap: self.gross_notional_cap,
            buy_position_idx: self.buy_position_idx,
            sell_position_idx: self.sell_position_idx,
        }
    }

    /// `Some` only when all three overrides are given.
    pub fn instrument_override(&self) -> Result<Option<InstrumentMeta>, ConfigError> {
        match (self.tick_size, self.lot_size, self.min_qty) {
            (Some(tick_size), Some(lot_size), Some(min_qty)) => {
                Ok(Some(InstrumentMeta { tick_size, lot_size, min_qty }))
            }
            (None, None, None) => Ok(None),
            _ => Err(ConfigError::PartialInstrumentOverride),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spread_factor <= Decimal::ZERO {
            return Err(ConfigError::NotPositive("spread_factor"));
        }
        if self.min_spread_bps < Decimal::ZERO {
            return Err(ConfigError::Negative("min_spread_bps"));
        }
        if self.tp_spread_bps < Decimal::ZERO {
            return Err(ConfigError::Negative("tp_spread_bps"));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::NotPositive("tick_ms"));
        }
        if !LINEAR_BOOK_DEPTHS.contains(&self.orderbook_depth) {
            return Err(ConfigError::UnsupportedDepth(self.orderbook_depth));
        }
        match self.mode {
            QuoteMode::FlatTwoSided => {
                if self.budget_usd <= Decimal::ZERO {
                    return Err(ConfigError::NotPositive("budget_usd"));
                }
            }
            QuoteMode::LadderTwoSided | QuoteMode::LadderLongOnly => {
                if self.ladder_levels == 0 {
                    return Err(ConfigError::NoLadderLevels);
                }
                if self.max_net_qty <= Decimal::ZERO {
                    return Err(ConfigError::NotPositive("max_net_qty"));
                }
            }
        }
        if self.live && self.credentials().is_none() {
            return Err(ConfigError::MissingCredentials);
        }
        self.instrument_override().map(|_| ())
    }
}

/// `.env` first, then flags / environment.
pub fn load() -> Args {
    // Pastikan .env dibaca sebelum clap membaca env
    let _ = dotenvy::dotenv();
    Args::parse()
}
