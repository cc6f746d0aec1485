// ===============================
// src/driver.rs (decision loop)
// ===============================
//
// Fixed-interval driver: snapshot + position view -> strategy -> gateway queue.
//
// - Refresh (no resting quotes yet, drift >= refresh_drift_bps, threshold <= 0,
//   or the position view changed since the last refresh):
//     CancelAll(symbol) then every intent, in emission order.
// - Hold: resting quotes stay; only market (stop-loss) intents go out.
// - Shutdown (watch flips to true, or max_ticks reached): if live, CancelAll and
//   optionally flatten both legs with market orders.
//
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{InstrumentMeta, OrderIntent, OrderType, PositionView, Side, TimeInForce};
use crate::gateway::GatewayCmd;
use crate::market_data::MarketDataCache;
use crate::metrics::{export_pnl, export_position, INTENTS, TICKS};
use crate::positions::PositionTracker;
use crate::strategy::{drift_bps, refresh_due, LinkIds, QuoteStrategy};

#[derive(Debug, Clone)]
pub struct LoopCfg {
    pub symbol: String,
    pub interval: Duration,
    pub refresh_drift_bps: Decimal,
    pub live: bool,
    pub flatten_on_exit: bool,
    /// 0 = run until the shutdown signal
    pub max_ticks: u64,
    pub buy_position_idx: u8,
    pub sell_position_idx: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No usable snapshot or book; nothing dispatched.
    Skipped,
    Refreshed { mid: Decimal, sent: usize },
    Held { mid: Decimal, drift_bps: Decimal, sent: usize },
}

pub struct DecisionLoop {
    cfg: LoopCfg,
    meta: InstrumentMeta,
    cache: Arc<MarketDataCache>,
    tracker: Arc<PositionTracker>,
    strategy: Box<dyn QuoteStrategy>,
    orders: mpsc::Sender<GatewayCmd>,
    last_quoted_mid: Option<Decimal>,
    last_quoted_position: Option<PositionView>,
    ticks: u64,
    exit_ids: LinkIds,
}

impl DecisionLoop {
    pub fn new(
        cfg: LoopCfg,
        meta: InstrumentMeta,
        cache: Arc<MarketDataCache>,
        tracker: Arc<PositionTracker>,
        strategy: Box<dyn QuoteStrategy>,
        orders: mpsc::Sender<GatewayCmd>,
    ) -> Self {
        Self {
            cfg,
            meta,
            cache,
            tracker,
            strategy,
            orders,
            last_quoted_mid: None,
            last_quoted_position: None,
            ticks: 0,
            exit_ids: LinkIds::new("exit"),
        }
    }

    pub fn ticks(&self) -> u64 { self.ticks }

    pub fn last_quoted_mid(&self) -> Option<Decimal> { self.last_quoted_mid }

    /// One evaluation. Safe to call directly (tests, single-shot runs).
    pub async fn tick(&mut self) -> TickOutcome {
        self.ticks += 1;
        let symbol = self.cfg.symbol.clone();

        let snapshot = match self.cache.snapshot(&symbol) {
            Ok(s) => s,
            Err(e) => {
                warn!(tick = self.ticks, error = %e, "market data incomplete, skip tick");
                TICKS.with_label_values(&["skipped"]).inc();
                return TickOutcome::Skipped;
            }
        };
        let position = self.tracker.position_view(&symbol);

        let Some(decision) = self.strategy.decide(&snapshot, &self.meta, &position) else {
            TICKS.with_label_values(&["skipped"]).inc();
            return TickOutcome::Skipped;
        };

        // skew, cap dan hard cap dihitung dari posisi: quote lama basi kalau posisi berubah
        let position_moved = self.last_quoted_position.is_some_and(|p| p != position);
        if position_moved {
            info!(%symbol, net = %position.net_qty(), gross = %position.gross_qty(), "position changed, requoting");
        }
        let outcome = if position_moved || refresh_due(self.last_quoted_mid, decision.mid, self.cfg.refresh_drift_bps) {
            self.dispatch(GatewayCmd::CancelAll(symbol.clone())).await;
            let sent = decision.intents.len();
            for intent in decision.intents {
                self.submit(intent).await;
            }
            self.last_quoted_mid = Some(decision.mid);
            self.last_quoted_position = Some(position);
            TICKS.with_label_values(&["refreshed"]).inc();
            TickOutcome::Refreshed { mid: decision.mid, sent }
        } else {
            let drift = self.last_quoted_mid.map(|p| drift_bps(p, decision.mid)).unwrap_or_default();
            let mut sent = 0;
            for intent in decision.intents.into_iter().filter(OrderIntent::is_market) {
                self.submit(intent).await;
                sent += 1;
            }
            debug!(%symbol, drift_bps = %drift.round_dp(3), "drift below threshold, quotes kept");
            TICKS.with_label_values(&["held"]).inc();
            TickOutcome::Held { mid: decision.mid, drift_bps: drift, sent }
        };

        self.report(&position);
        outcome
    }

    fn report(&self, position: &PositionView) {
        let t = self.tracker.totals();
        export_pnl(&t);
        export_position(position);
        info!(
            tick = self.ticks,
            realized = %t.realized,
            fees = %t.fees,
            funding = %t.funding,
            unrealized = %t.unrealized,
            net = %t.net(),
            long = %position.long_size,
            short = %position.short_size,
            "pnl"
        );
    }

    async fn submit(&self, intent: OrderIntent) {
        let kind = match (intent.order_type, intent.side) {
            (OrderType::Market, _) => "market",
            (OrderType::Limit, Side::Buy) => "limit_buy",
            (OrderType::Limit, Side::Sell) => "limit_sell",
        };
        INTENTS.with_label_values(&[kind]).inc();
        self.dispatch(GatewayCmd::Submit(intent)).await;
    }

    async fn dispatch(&self, cmd: GatewayCmd) {
        if self.orders.send(cmd).await.is_err() {
            warn!("gateway channel closed, command dropped");
        }
    }

    /// Drive `tick()` on the interval until `shutdown` flips or `max_ticks` is reached,
    /// then run the exit path.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut iv = interval(self.cfg.interval);
        iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(symbol = %self.cfg.symbol, strategy = self.strategy.name(), every = ?self.cfg.interval, "decision loop started");

        loop {
            tokio::select! {
                _ = iv.tick() => {
                    let outcome = self.tick().await;
                    debug!(tick = self.ticks, ?outcome, "tick done");
                    if self.cfg.max_ticks > 0 && self.ticks >= self.cfg.max_ticks {
                        info!(ticks = self.ticks, "max ticks reached");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(ticks = self.ticks, "shutdown requested");
                        break;
                    }
                }
            }
        }
        self.on_exit().await;
    }

    /// Cancel resting quotes and, when configured, close both legs at market. No-op in dry-run.
    pub async fn on_exit(&mut self) {
        if !self.cfg.live {
            info!("dry-run: nothing to clean up");
            return;
        }
        let symbol = self.cfg.symbol.clone();
        self.dispatch(GatewayCmd::CancelAll(symbol.clone())).await;
        if !self.cfg.flatten_on_exit {
            return;
        }
        let pos = self.tracker.position_view(&symbol);
        let legs = [(pos.long_size, Side::Sell, "flat_long"), (pos.short_size, Side::Buy, "flat_short")];
        for (size, side, label) in legs {
            if size <= Decimal::ZERO {
                continue;
            }
            let position_idx = match side {
                Side::Buy => self.cfg.buy_position_idx,
                Side::Sell => self.cfg.sell_position_idx,
            };
            let intent = OrderIntent {
                symbol: symbol.clone(),
                side,
                qty: size,
                price: None,
                order_type: OrderType::Market,
                position_idx,
                client_id: self.exit_ids.next(label),
                time_in_force: TimeInForce::IOC,
            };
            warn!(%symbol, %size, side = side.as_str(), "flattening on exit");
            self.submit(intent).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuoteMode;
    use crate::domain::FeedKind;
    use crate::positions::PositionRecord;
    use crate::strategy::{build, QuoteParams};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn meta() -> InstrumentMeta {
        InstrumentMeta { tick_size: dec!(0.1), lot_size: dec!(0.001), min_qty: dec!(0.001) }
    }

    fn cfg(drift: Decimal) -> LoopCfg {
        LoopCfg {
            symbol: "BTCUSDT".into(),
            interval: Duration::from_millis(5),
            refresh_drift_bps: drift,
            live: true,
            flatten_on_exit: true,
            max_ticks: 0,
            buy_position_idx: 1,
            sell_position_idx: 2,
        }
    }

    fn put_book(cache: &MarketDataCache, bid: &str, ask: &str) {
        cache.update("BTCUSDT", FeedKind::Ticker, json!({"symbol": "BTCUSDT"}));
        cache.update("BTCUSDT", FeedKind::Orderbook, json!({"b": [[bid, "1"]], "a": [[ask, "1"]]}));
    }

    fn harness(drift: Decimal, mode: QuoteMode) -> (DecisionLoop, Arc<MarketDataCache>, Arc<PositionTracker>, mpsc::Receiver<GatewayCmd>) {
        let cache = Arc::new(MarketDataCache::new());
        let tracker = Arc::new(PositionTracker::new());
        let (tx, rx) = mpsc::channel(256);
        let params = QuoteParams { ladder_levels: 2, max_net_qty: dec!(1), stop_loss_bps: dec!(50), ..QuoteParams::default() };
        let strategy = build(mode, "BTCUSDT".into(), params);
        let dl = DecisionLoop::new(cfg(drift), meta(), cache.clone(), tracker.clone(), strategy, tx);
        (dl, cache, tracker, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<GatewayCmd>) -> Vec<GatewayCmd> {
        let mut out = Vec::new();
        while let Ok(c) = rx.try_recv() {
            out.push(c);
        }
        out
    }

    #[tokio::test]
    async fn skips_until_both_payloads_exist() {
        let (mut dl, cache, _t, mut rx) = harness(dec!(0), QuoteMode::LadderTwoSided);
        assert_eq!(dl.tick().await, TickOutcome::Skipped);
        cache.update("BTCUSDT", FeedKind::Ticker, json!({}));
        assert_eq!(dl.tick().await, TickOutcome::Skipped);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(dl.ticks(), 2);
    }

    #[tokio::test]
    async fn refresh_sends_cancel_then_intents_in_order() {
        let (mut dl, cache, _t, mut rx) = harness(dec!(0), QuoteMode::LadderTwoSided);
        put_book(&cache, "100.0", "100.2");
        let out = dl.tick().await;
        assert!(matches!(out, TickOutcome::Refreshed { sent: 4, .. }));
        let cmds = drain(&mut rx);
        assert_eq!(cmds[0], GatewayCmd::CancelAll("BTCUSDT".into()));
        assert_eq!(cmds.len(), 5);
        assert_eq!(dl.last_quoted_mid(), Some(dec!(100.1)));
    }

    #[tokio::test]
    async fn small_drift_holds_quotes() {
        let (mut dl, cache, _t, mut rx) = harness(dec!(20), QuoteMode::LadderTwoSided);
        put_book(&cache, "100.0", "100.2");
        dl.tick().await;
        drain(&mut rx);

        // 100.1 -> 100.15: ~5 bps
        put_book(&cache, "100.1", "100.2");
        match dl.tick().await {
            TickOutcome::Held { sent, drift_bps, .. } => {
                assert_eq!(sent, 0);
                assert!(drift_bps < dec!(20));
            }
            other => panic!("expected hold, got {other:?}"),
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(dl.last_quoted_mid(), Some(dec!(100.1)));

        // 100.1 -> 100.4: ~30 bps
        put_book(&cache, "100.3", "100.5");
        assert!(matches!(dl.tick().await, TickOutcome::Refreshed { .. }));
        assert_eq!(dl.last_quoted_mid(), Some(dec!(100.4)));
    }

    #[tokio::test]
    async fn stop_loss_bypasses_drift_gate() {
        let (mut dl, cache, tracker, mut rx) = harness(dec!(1000), QuoteMode::LadderLongOnly);
        put_book(&cache, "100.0", "100.2");
        tracker.apply_positions(&[PositionRecord {
            symbol: "BTCUSDT".into(),
            side: Some(Side::Buy),
            size: dec!(0.005),
            avg_price: dec!(101),
            unrealised_pnl: dec!(-0.005),
            occ_funding_fee: Decimal::ZERO,
        }]);
        assert!(matches!(dl.tick().await, TickOutcome::Refreshed { .. }));
        drain(&mut rx);

        // same position, mid unchanged: mid 100.1 vs entry 101 is ~89 bps below, stop at 50 bps
        match dl.tick().await {
            TickOutcome::Held { sent, .. } => assert_eq!(sent, 1),
            other => panic!("expected hold, got {other:?}"),
        }
        let cmds = drain(&mut rx);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            GatewayCmd::Submit(i) => {
                assert!(i.is_market());
                assert_eq!(i.side, Side::Sell);
                assert_eq!(i.qty, dec!(0.005));
                assert!(i.client_id.starts_with("sl_long_"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn position_change_requotes_even_without_drift() {
        let (mut dl, cache, tracker, mut rx) = harness(dec!(50), QuoteMode::LadderLongOnly);
        put_book(&cache, "100.0", "100.2");
        assert_eq!(dl.tick().await, TickOutcome::Refreshed { mid: dec!(100.1), sent: 2 });
        drain(&mut rx);

        // long 5 over max_net_qty 1: the bid side must come off the book
        tracker.apply_positions(&[PositionRecord {
            symbol: "BTCUSDT".into(),
            side: Some(Side::Buy),
            size: dec!(5),
            avg_price: dec!(100.1),
            unrealised_pnl: Decimal::ZERO,
            occ_funding_fee: Decimal::ZERO,
        }]);
        assert_eq!(dl.tick().await, TickOutcome::Refreshed { mid: dec!(100.1), sent: 1 });
        let cmds = drain(&mut rx);
        assert_eq!(cmds[0], GatewayCmd::CancelAll("BTCUSDT".into()));
        assert_eq!(cmds.len(), 2);
        match &cmds[1] {
            GatewayCmd::Submit(i) => {
                assert_eq!(i.side, Side::Sell);
                assert!(i.client_id.starts_with("tp_sell_"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // unchanged position and mid: back to holding
        assert!(matches!(dl.tick().await, TickOutcome::Held { sent: 0, .. }));
        assert!(drain(&mut rx).is_empty());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn run_future_can_be_spawned() {
        let (dl, _cache, _t, _rx) = harness(dec!(0), QuoteMode::LadderTwoSided);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let fut = dl.run(stop_rx);
        assert_send(&fut);
        drop(fut);
    }

    #[tokio::test]
    async fn run_stops_on_signal_and_flattens_when_live() {
        let (dl, cache, tracker, mut rx) = harness(dec!(0), QuoteMode::LadderTwoSided);
        put_book(&cache, "100.0", "100.2");
        tracker.apply_positions(&[
            PositionRecord {
                symbol: "BTCUSDT".into(),
                side: Some(Side::Buy),
                size: dec!(0.002),
                avg_price: dec!(100),
                unrealised_pnl: Decimal::ZERO,
                occ_funding_fee: Decimal::ZERO,
            },
            PositionRecord {
                symbol: "BTCUSDT".into(),
                side: Some(Side::Sell),
                size: dec!(0.001),
                avg_price: dec!(100.2),
                unrealised_pnl: Decimal::ZERO,
                occ_funding_fee: Decimal::ZERO,
            },
        ]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(dl.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let cmds = drain(&mut rx);
        let n = cmds.len();
        assert!(n >= 4);
        assert_eq!(cmds[n - 3], GatewayCmd::CancelAll("BTCUSDT".into()));
        match (&cmds[n - 2], &cmds[n - 1]) {
            (GatewayCmd::Submit(a), GatewayCmd::Submit(b)) => {
                assert_eq!((a.side, a.qty, a.position_idx), (Side::Sell, dec!(0.002), 2));
                assert_eq!((b.side, b.qty, b.position_idx), (Side::Buy, dec!(0.001), 1));
                assert!(a.is_market() && b.is_market());
            }
            other => panic!("unexpected tail {other:?}"),
        }
    }

    #[tokio::test]
    async fn max_ticks_bounds_the_run_and_dry_run_skips_cleanup() {
        let (mut dl, cache, _t, mut rx) = harness(dec!(0), QuoteMode::FlatTwoSided);
        dl.cfg.max_ticks = 3;
        dl.cfg.live = false;
        put_book(&cache, "100.0", "100.2");
        let (_stop_tx, stop_rx) = watch::channel(false);
        dl.run(stop_rx).await;

        let cmds = drain(&mut rx);
        // 3 refreshes x (cancel + bid + ask), no exit cancel
        assert_eq!(cmds.len(), 9);
        assert!(matches!(cmds.last(), Some(GatewayCmd::Submit(_))));
    }
}
