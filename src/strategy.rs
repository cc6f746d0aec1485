// ===============================
// src/strategy.rs
// ===============================
//
// Tiga mode quoting, satu trait:
// 1) FlatMaker      (flat_two_sided)   -> satu bid + satu ask, size dari budget USD.
//                                         Tidak butuh position feed.
// 2) LadderMaker    (ladder_two_sided) -> ladder bid & ask, skew inventory,
//                                         gross cap, TP dua arah, stop-loss dua arah.
// 3) LongOnlyMaker  (ladder_long_only) -> ladder bid saja, TP sell, stop-loss long.
//
// Every strategy owns its order-link counter; the decision loop owns the
// strategy, so ids stay unique for the whole process run.
//
// Pricing for every mode:
//   mid        = (best_bid + best_ask) / 2
//   live_bps   = (best_ask - best_bid) / mid * 1e4
//   target_bps = max(min_spread_bps, live_bps * spread_factor)
//   half       = target_bps * 1e-4 * mid
// Prices and sizes round toward zero on tick / lot.
//
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::config::QuoteMode;
use crate::domain::{
    round_down, InstrumentMeta, MarketSnapshot, OrderIntent, OrderType, PositionView, Side, TimeInForce,
};
use crate::risk::{gross_cap_exceeded, inventory_scale, stop_triggered};

const BPS: Decimal = dec!(10000);

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteParams {
    pub min_spread_bps: Decimal,
    pub spread_factor: Decimal,
    pub budget_usd: Decimal,
    pub max_net_qty: Decimal,
    pub tp_spread_bps: Decimal,
    pub ladder_levels: u32,
    pub stop_loss_bps: Decimal,
    pub gross_notional_cap: Decimal,
    pub buy_position_idx: u8,
    pub sell_position_idx: u8,
}

impl Default for QuoteParams {
    fn default() -> Self {
        Self {
            min_spread_bps: dec!(1),
            spread_factor: dec!(1),
            budget_usd: dec!(10),
            max_net_qty: dec!(0.01),
            tp_spread_bps: dec!(10),
            ladder_levels: 3,
            stop_loss_bps: Decimal::ZERO,
            gross_notional_cap: Decimal::ZERO,
            buy_position_idx: 1,
            sell_position_idx: 2,
        }
    }
}

/// Output of one evaluation: the pricing frame plus the ordered intents.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub symbol: String,
    pub mid: Decimal,
    pub live_spread_bps: Decimal,
    pub target_spread_bps: Decimal,
    pub intents: Vec<OrderIntent>,
}

pub trait QuoteStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the book is unusable (empty side, crossed or locked); the tick is skipped.
    fn decide(&mut self, snapshot: &MarketSnapshot, meta: &InstrumentMeta, position: &PositionView) -> Option<Decision>;
}

pub fn build(mode: QuoteMode, symbol: String, params: QuoteParams) -> Box<dyn QuoteStrategy> {
    match mode {
        QuoteMode::FlatTwoSided => Box::new(FlatMaker::new(symbol, params)),
        QuoteMode::LadderTwoSided => Box::new(LadderMaker::new(symbol, params)),
        QuoteMode::LadderLongOnly => Box::new(LongOnlyMaker::new(symbol, params)),
    }
}

// -----------------------------------------------------------------------------
// Order-link ids: "<label>_<tag>_<unix_ms>_<counter>"
// -----------------------------------------------------------------------------
#[derive(Debug)]
pub struct LinkIds {
    tag: &'static str,
    counter: u64,
}

impl LinkIds {
    pub fn new(tag: &'static str) -> Self { Self { tag, counter: 0 } }

    pub fn next(&mut self, label: &str) -> String {
        self.counter += 1;
        format!("{label}_{}_{}_{}", self.tag, Utc::now().timestamp_millis(), self.counter)
    }

    pub fn issued(&self) -> u64 { self.counter }
}

// -----------------------------------------------------------------------------
// Shared pricing
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteFrame {
    pub mid: Decimal,
    pub live_spread_bps: Decimal,
    pub target_spread_bps: Decimal,
    pub half_spread: Decimal,
}

pub fn quote_frame(snapshot: &MarketSnapshot, params: &QuoteParams) -> Option<QuoteFrame> {
    let (bid, ask) = match (snapshot.best_bid(), snapshot.best_ask()) {
        (Some(b), Some(a)) => (b, a),
        _ => {
            warn!(symbol = %snapshot.symbol, "orderbook empty, skip tick");
            return None;
        }
    };
    if ask <= bid || bid <= Decimal::ZERO {
        warn!(symbol = %snapshot.symbol, %bid, %ask, "non-positive spread, skip tick");
        return None;
    }
    let mid = (bid + ask) / dec!(2);
    let live_spread_bps = (ask - bid) / mid * BPS;
    let target_spread_bps = params.min_spread_bps.max(live_spread_bps * params.spread_factor);
    let half_spread = target_spread_bps / BPS * mid;
    Some(QuoteFrame { mid, live_spread_bps, target_spread_bps, half_spread })
}

/// Budget sizing: budget / mid on the lot grid, lifted to min_qty.
pub fn budget_qty(budget_usd: Decimal, mid: Decimal, meta: &InstrumentMeta) -> Decimal {
    let qty = round_down(budget_usd / mid, meta.lot_size);
    qty.max(meta.min_qty)
}

/// Ladder sizing: the minimum tradable unit, independent of price.
pub fn ladder_base_qty(meta: &InstrumentMeta) -> Decimal {
    round_down(meta.min_qty, meta.lot_size).max(meta.min_qty)
}

/// Mid drift since the last refresh in bps; refresh when there is no anchor,
/// when the threshold is disabled (<= 0), or when drift reaches it.
pub fn refresh_due(last_quoted_mid: Option<Decimal>, mid: Decimal, refresh_drift_bps: Decimal) -> bool {
    match last_quoted_mid {
        None => true,
        Some(_) if refresh_drift_bps <= Decimal::ZERO => true,
        Some(prev) if prev <= Decimal::ZERO => true,
        Some(prev) => drift_bps(prev, mid) >= refresh_drift_bps,
    }
}

pub fn drift_bps(prev_mid: Decimal, mid: Decimal) -> Decimal {
    if prev_mid <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (mid - prev_mid).abs() / prev_mid * BPS
}

struct IntentBuilder<'a> {
    symbol: &'a str,
    params: &'a QuoteParams,
    ids: &'a mut LinkIds,
    out: Vec<OrderIntent>,
}

impl<'a> IntentBuilder<'a> {
    fn new(symbol: &'a str, params: &'a QuoteParams, ids: &'a mut LinkIds) -> Self {
        Self { symbol, params, ids, out: Vec::new() }
    }

    fn pos_idx(&self, side: Side) -> u8 {
        match side {
            Side::Buy => self.params.buy_position_idx,
            Side::Sell => self.params.sell_position_idx,
        }
    }

    /// Rungs that round to a non-positive price (wide book, deep ladder) are dropped.
    fn limit(&mut self, side: Side, qty: Decimal, price: Decimal, label: &str) {
        if price <= Decimal::ZERO {
            debug!(symbol = %self.symbol, label, %price, "non-positive price, rung skipped");
            return;
        }
        let intent = OrderIntent {
            symbol: self.symbol.to_string(),
            side,
            qty,
            price: Some(price),
            order_type: OrderType::Limit,
            position_idx: self.pos_idx(side),
            client_id: self.ids.next(label),
            time_in_force: TimeInForce::GTC,
        };
        self.out.push(intent);
    }

    fn market(&mut self, side: Side, qty: Decimal, label: &str) {
        let intent = OrderIntent {
            symbol: self.symbol.to_string(),
            side,
            qty,
            price: None,
            order_type: OrderType::Market,
            position_idx: self.pos_idx(side),
            client_id: self.ids.next(label),
            time_in_force: TimeInForce::IOC,
        };
        self.out.push(intent);
    }
}

fn log_decision(tag: &str, symbol: &str, f: &QuoteFrame, intents: &[OrderIntent], pos: Option<&PositionView>) {
    info!(
        strategy = tag,
        %symbol,
        mid = %f.mid,
        live_spread_bps = %f.live_spread_bps.round_dp(3),
        target_spread_bps = %f.target_spread_bps.round_dp(3),
        net = %pos.map(|p| p.net_qty()).unwrap_or_default(),
        intents = intents.len(),
        "quote"
    );
    for i in intents {
        debug!(link = %i.client_id, side = ?i.side, qty = %i.qty, px = ?i.price, kind = ?i.order_type, "intent");
    }
}

// -----------------------------------------------------------------------------
// 1) FLAT TWO-SIDED
//    Satu bid di mid - half dan satu ask di mid + half, tanpa skew / cap.
//    Dipakai saat position feed tidak tersedia.
// -----------------------------------------------------------------------------
pub struct FlatMaker {
    symbol: String,
    params: QuoteParams,
    ids: LinkIds,
}

impl FlatMaker {
    pub fn new(symbol: String, params: QuoteParams) -> Self {
        Self { symbol, params, ids: LinkIds::new("mm") }
    }
}

impl QuoteStrategy for FlatMaker {
    fn name(&self) -> &'static str { "flat_two_sided" }

    fn decide(&mut self, snapshot: &MarketSnapshot, meta: &InstrumentMeta, _position: &PositionView) -> Option<Decision> {
        let f = quote_frame(snapshot, &self.params)?;
        let qty = budget_qty(self.params.budget_usd, f.mid, meta);
        let bid_px = round_down(f.mid - f.half_spread, meta.tick_size);
        let ask_px = round_down(f.mid + f.half_spread, meta.tick_size);

        let mut b = IntentBuilder::new(&self.symbol, &self.params, &mut self.ids);
        b.limit(Side::Buy, qty, bid_px, "bid");
        b.limit(Side::Sell, qty, ask_px, "ask");
        let intents = b.out;

        log_decision(self.name(), &self.symbol, &f, &intents, None);
        Some(Decision {
            symbol: self.symbol.clone(),
            mid: f.mid,
            live_spread_bps: f.live_spread_bps,
            target_spread_bps: f.target_spread_bps,
            intents,
        })
    }
}

// -----------------------------------------------------------------------------
// Ladder core, shared by the two inventory-aware modes.
// -----------------------------------------------------------------------------
fn ladder_decide(
    tag: &'static str,
    symbol: &str,
    params: &QuoteParams,
    ids: &mut LinkIds,
    two_sided: bool,
    snapshot: &MarketSnapshot,
    meta: &InstrumentMeta,
    pos: &PositionView,
) -> Option<Decision> {
    let f = quote_frame(snapshot, params)?;
    let base_qty = ladder_base_qty(meta);
    let net = pos.net_qty();
    let (bid_scale, ask_scale) = inventory_scale(net, params.max_net_qty);
    let ask_scale = if two_sided { ask_scale } else { Decimal::ZERO };

    let capped = gross_cap_exceeded(pos, f.mid, params.gross_notional_cap);
    if capped {
        info!(
            strategy = tag, %symbol,
            gross = %(pos.gross_qty() * f.mid), cap = %params.gross_notional_cap,
            "gross cap hit, skip new ladder quotes"
        );
    }

    let mut b = IntentBuilder::new(symbol, params, ids);

    // Ladder
    if !capped {
        for level in 1..=params.ladder_levels {
            let offset = f.half_spread * Decimal::from(level);
            if bid_scale > Decimal::ZERO {
                b.limit(Side::Buy, base_qty * bid_scale, round_down(f.mid - offset, meta.tick_size), "bid");
            }
            if ask_scale > Decimal::ZERO {
                b.limit(Side::Sell, base_qty * ask_scale, round_down(f.mid + offset, meta.tick_size), "ask");
            }
        }
    }

    // Take-profit untuk meringankan inventory
    let tp_off = params.tp_spread_bps / BPS * f.mid;
    let tp_sell_allowed = !two_sided || ask_scale > Decimal::ZERO;
    if net > meta.min_qty && tp_sell_allowed {
        b.limit(Side::Sell, base_qty, round_down(f.mid + tp_off, meta.tick_size), "tp_sell");
    }
    if two_sided && net < -meta.min_qty && bid_scale > Decimal::ZERO {
        b.limit(Side::Buy, base_qty, round_down(f.mid - tp_off, meta.tick_size), "tp_buy");
    }

    // Stop-loss: flatten the whole side, no scale / cap gating
    if pos.long_size > Decimal::ZERO && stop_triggered(pos.long_entry, f.mid, params.stop_loss_bps, true) {
        warn!(strategy = tag, %symbol, size = %pos.long_size, entry = %pos.long_entry, mid = %f.mid, "stop-loss: flattening long");
        b.market(Side::Sell, pos.long_size, "sl_long");
    }
    if two_sided && pos.short_size > Decimal::ZERO && stop_triggered(pos.short_entry, f.mid, params.stop_loss_bps, false) {
        warn!(strategy = tag, %symbol, size = %pos.short_size, entry = %pos.short_entry, mid = %f.mid, "stop-loss: flattening short");
        b.market(Side::Buy, pos.short_size, "sl_short");
    }

    let intents = b.out;
    log_decision(tag, symbol, &f, &intents, Some(pos));
    Some(Decision {
        symbol: symbol.to_string(),
        mid: f.mid,
        live_spread_bps: f.live_spread_bps,
        target_spread_bps: f.target_spread_bps,
        intents,
    })
}

// -----------------------------------------------------------------------------
// 2) LADDER TWO-SIDED
// -----------------------------------------------------------------------------
pub struct LadderMaker {
    symbol: String,
    params: QuoteParams,
    ids: LinkIds,
}

impl LadderMaker {
    pub fn new(symbol: String, params: QuoteParams) -> Self {
        Self { symbol, params, ids: LinkIds::new("mmls") }
    }
}

impl QuoteStrategy for LadderMaker {
    fn name(&self) -> &'static str { "ladder_two_sided" }

    fn decide(&mut self, snapshot: &MarketSnapshot, meta: &InstrumentMeta, position: &PositionView) -> Option<Decision> {
        ladder_decide(self.name(), &self.symbol, &self.params, &mut self.ids, true, snapshot, meta, position)
    }
}

// -----------------------------------------------------------------------------
// 3) LADDER LONG-ONLY
//    Hanya bid; tidak pernah membuka short. TP sell saat net long.
// -----------------------------------------------------------------------------
pub struct LongOnlyMaker {
    symbol: String,
    params: QuoteParams,
    ids: LinkIds,
}

impl LongOnlyMaker {
    pub fn new(symbol: String, params: QuoteParams) -> Self {
        Self { symbol, params, ids: LinkIds::new("mmlo") }
    }
}

impl QuoteStrategy for LongOnlyMaker {
    fn name(&self) -> &'static str { "ladder_long_only" }

    fn decide(&mut self, snapshot: &MarketSnapshot, meta: &InstrumentMeta, position: &PositionView) -> Option<Decision> {
        ladder_decide(self.name(), &self.symbol, &self.params, &mut self.ids, false, snapshot, meta, position)
    }
}
