// ===============================
// src/main.rs
// ===============================
/*
 # dry-run dengan mock feed
 FEED_MODE=mock MM_MODE=ladder_two_sided MM_TICK_SIZE=0.1 MM_LOT_SIZE=0.001 MM_MIN_QTY=0.001 \
   MM_TICK_MS=1000 MM_MAX_TICKS=10 cargo run --release

 # aktivitas loop & pnl
 curl -s localhost:9898/metrics | egrep '^(ticks_total|intents_total|pnl_)'
*/
/*
=============================================================================
Project : perp_mm: perpetual-futures market-making decision engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams Bybit best bid/ask and private executions/positions into
          lock-protected caches, runs one quoting mode (flat, two-sided ladder,
          long-only ladder) on a fixed cadence under inventory / notional /
          stop-loss limits, and dispatches cancel-replace order intents.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perp_mm::config::{self, FeedMode};
use perp_mm::domain::InstrumentMeta;
use perp_mm::driver::{DecisionLoop, LoopCfg};
use perp_mm::gateway::{self, GatewayCmd, PaperVenue};
use perp_mm::gateway_bybit::{fetch_instrument_meta, BybitVenue};
use perp_mm::market_data::MarketDataCache;
use perp_mm::positions::PositionTracker;
use perp_mm::{feed, metrics, strategy};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load & validate config ----
    let args = config::load();
    if let Err(e) = args.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }
    let creds = args.credentials();
    let live = args.live && creds.is_some();

    // ---- Metrics ----
    metrics::init();
    if args.metrics_port != 0 {
        tokio::spawn(metrics::serve_metrics(args.metrics_port));
    }
    metrics::CONFIG_MODE.with_label_values(&[args.mode.as_str()]).set(1);

    info!(
        symbol = %args.symbol,
        mode = args.mode.as_str(),
        feed_mode = ?args.feed_mode,
        network = ?args.network(),
        live,
        tick_ms = args.tick_ms,
        max_ticks = args.max_ticks,
        rest = %args.rest_url(),
        ws_public = %args.ws_public_url(),
        "startup config"
    );
    if creds.is_none() {
        info!("no API keys set; running read-only (paper venue)");
    }

    // ---- Instrument metadata ----
    let http = reqwest::Client::new();
    let meta = match resolve_meta(&args, &http).await {
        Ok(m) => m,
        Err(e) => {
            error!(symbol = %args.symbol, error = %e, "instrument metadata unavailable");
            return ExitCode::FAILURE;
        }
    };
    info!(tick = %meta.tick_size, lot = %meta.lot_size, min_qty = %meta.min_qty, "instrument");

    // ---- Wallet (informational) ----
    if let Some((key, secret)) = &creds {
        let account = BybitVenue::new(http.clone(), args.rest_url(), key.clone(), secret.clone(), args.recv_window);
        match account.wallet_balance("UNIFIED").await {
            Ok(w) => info!(
                account = %w.account_type,
                equity = %w.total_equity,
                available = %w.available,
                usdt = ?w.usdt,
                "wallet balance"
            ),
            Err(e) => warn!(error = %e, "wallet balance unavailable"),
        }
    }

    // ---- Feeds ----
    let cache = Arc::new(MarketDataCache::new());
    let tracker = Arc::new(PositionTracker::new());
    let mut feed_tasks = Vec::new();
    match args.feed_mode {
        FeedMode::Mock => {
            feed_tasks.push(tokio::spawn(feed::run_mock(
                cache.clone(),
                args.symbol.clone(),
                Duration::from_millis(200),
            )));
        }
        FeedMode::Bybit => {
            feed_tasks.push(tokio::spawn(feed::run_bybit_public(
                cache.clone(),
                vec![args.symbol.clone()],
                args.ws_public_url(),
                args.orderbook_depth,
            )));
        }
    }
    match (&creds, args.mode.uses_positions()) {
        (Some((key, secret)), true) => {
            feed_tasks.push(tokio::spawn(feed::run_bybit_private(
                tracker.clone(),
                args.ws_private_url(),
                key.clone(),
                secret.clone(),
            )));
        }
        (None, true) => warn!("no credentials: position view stays flat, inventory limits see zero"),
        _ => {}
    }

    if !cache.await_ready(Duration::from_millis(args.ready_timeout_ms)).await {
        error!(timeout_ms = args.ready_timeout_ms, "timed out waiting for initial market data");
        return ExitCode::FAILURE;
    }

    // ---- Gateway ----
    let (ord_tx, ord_rx) = mpsc::channel::<GatewayCmd>(1024);
    let gw_task = match (&creds, live) {
        (Some((key, secret)), true) => {
            let venue = BybitVenue::new(http.clone(), args.rest_url(), key.clone(), secret.clone(), args.recv_window);
            tokio::spawn(gateway::run(ord_rx, venue))
        }
        _ => tokio::spawn(gateway::run(ord_rx, PaperVenue::new())),
    };

    // ---- Shutdown signal ----
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            let _ = stop_tx.send(true);
        }
    });

    // ---- Decision loop ----
    let cfg = LoopCfg {
        symbol: args.symbol.clone(),
        interval: Duration::from_millis(args.tick_ms),
        refresh_drift_bps: args.refresh_drift_bps,
        live,
        flatten_on_exit: args.flatten_on_exit,
        max_ticks: args.max_ticks,
        buy_position_idx: args.buy_position_idx,
        sell_position_idx: args.sell_position_idx,
    };
    let strat = strategy::build(args.mode, args.symbol.clone(), args.quote_params());
    let dl = DecisionLoop::new(cfg, meta, cache.clone(), tracker.clone(), strat, ord_tx);
    dl.run(stop_rx).await;

    // loop sudah drop sender -> gateway drain sisa antrian lalu berhenti
    if let Err(e) = gw_task.await {
        warn!(?e, "gateway task ended abnormally");
    }
    for t in feed_tasks {
        t.abort();
    }

    let t = tracker.totals();
    info!(realized = %t.realized, fees = %t.fees, funding = %t.funding, unrealized = %t.unrealized, net = %t.net(), "done");
    ExitCode::SUCCESS
}

async fn resolve_meta(args: &config::Args, http: &reqwest::Client) -> Result<InstrumentMeta, String> {
    if let Some(meta) = args.instrument_override().map_err(|e| e.to_string())? {
        return meta.validate(&args.symbol).map_err(|e| e.to_string());
    }
    fetch_instrument_meta(http, &args.rest_url(), &args.symbol)
        .await
        .map_err(|e| e.to_string())
}
