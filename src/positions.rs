// ===============================
// src/positions.rs (PnL & position tracker, fed by the private stream)
// ===============================
//
// Semua state di bawah satu Mutex: totals() dan position_view() selalu
// konsisten pada satu titik waktu. Critical section pendek, tanpa await.
//
// Position batches are applied as a full replace for every symbol present in
// the batch: zero long/short first, then repopulate from the records. A partial
// batch (only one side listed) therefore reports the other side as flat until
// the next full snapshot arrives. This is the exchange's snapshot semantics and
// is kept as-is.
//
use std::sync::{Mutex, PoisonError};

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::{PnlTotals, PositionView, Side};
use crate::metrics::PRIVATE_RECORDS;

/// One fill (or funding settlement) from the private execution stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub symbol: String,
    pub order_link_id: String,
    pub exec_type: String,
    pub realized_pnl: Decimal,
    pub fee: Decimal,
}

impl ExecutionRecord {
    pub fn is_funding(&self) -> bool { self.exec_type.eq_ignore_ascii_case("funding") }
}

/// One leg from the private position stream. `side == None` means a flat one-way position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub symbol: String,
    pub side: Option<Side>,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub unrealised_pnl: Decimal,
    pub occ_funding_fee: Decimal,
}

#[derive(Debug, Default, Clone, Copy)]
struct OrderPnl {
    realized: Decimal,
    fees: Decimal,
}

#[derive(Debug, Default)]
struct Ledger {
    per_order: HashMap<String, OrderPnl>,
    funding: Decimal,
    unrealized: HashMap<String, Decimal>,
    positions: HashMap<String, PositionView>,
}

impl Ledger {
    fn add_execution(&mut self, order_link_id: &str, realized_pnl: Decimal, fee: Decimal) {
        let e = self.per_order.entry(order_link_id.to_string()).or_default();
        e.realized += realized_pnl;
        e.fees += fee;
    }

    fn add_funding(&mut self, amount: Decimal) {
        self.funding += amount;
    }
}

#[derive(Debug, Default)]
pub struct PositionTracker {
    inner: Mutex<Ledger>,
}

pub fn unrealized_key(symbol: &str, side: Side) -> String {
    format!("{symbol}:{}", side.as_str())
}

impl PositionTracker {
    pub fn new() -> Self { Self::default() }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills are append-only: repeated ids accumulate.
    pub fn record_execution(&self, order_link_id: &str, realized_pnl: Decimal, fee: Decimal) {
        self.ledger().add_execution(order_link_id, realized_pnl, fee);
    }

    pub fn record_funding(&self, amount: Decimal) {
        self.ledger().add_funding(amount);
    }

    /// Last write wins; unrealized PnL is a snapshot, not a delta.
    pub fn set_unrealized(&self, key: &str, value: Decimal) {
        self.ledger().unrealized.insert(key.to_string(), value);
    }

    pub fn totals(&self) -> PnlTotals {
        let l = self.ledger();
        let mut t = PnlTotals { funding: l.funding, ..Default::default() };
        for o in l.per_order.values() {
            t.realized += o.realized;
            t.fees += o.fees;
        }
        t.unrealized = l.unrealized.values().copied().sum();
        t
    }

    pub fn position_view(&self, symbol: &str) -> PositionView {
        self.ledger().positions.get(symbol).copied().unwrap_or_default()
    }

    pub fn apply_executions(&self, records: &[ExecutionRecord]) {
        let mut l = self.ledger();
        for r in records {
            if r.is_funding() {
                // execFee positif = funding dibayar
                l.add_funding(-r.fee);
                PRIVATE_RECORDS.with_label_values(&["funding"]).inc();
            } else {
                l.add_execution(&r.order_link_id, r.realized_pnl, r.fee);
                PRIVATE_RECORDS.with_label_values(&["execution"]).inc();
            }
            debug!(symbol = %r.symbol, link = %r.order_link_id, pnl = %r.realized_pnl, fee = %r.fee, "execution");
        }
    }

    /// Full-replace per symbol: zero view and unrealized legs, then repopulate from this batch.
    pub fn apply_positions(&self, records: &[PositionRecord]) {
        let mut l = self.ledger();
        for r in records {
            l.positions.insert(r.symbol.clone(), PositionView::default());
            // leg yang sudah tutup datang dengan side kosong: upl lama harus hilang
            for side in [Side::Buy, Side::Sell] {
                l.unrealized.insert(unrealized_key(&r.symbol, side), Decimal::ZERO);
            }
        }
        for r in records {
            let view = l.positions.entry(r.symbol.clone()).or_default();
            match r.side {
                Some(Side::Buy) => {
                    view.long_size = r.size;
                    view.long_entry = r.avg_price;
                }
                Some(Side::Sell) => {
                    view.short_size = r.size;
                    view.short_entry = r.avg_price;
                }
                None => {}
            }
            if let Some(side) = r.side {
                l.unrealized.insert(unrealized_key(&r.symbol, side), r.unrealised_pnl);
            }
            PRIVATE_RECORDS.with_label_values(&["position"]).inc();
            debug!(
                symbol = %r.symbol, side = ?r.side, size = %r.size, entry = %r.avg_price,
                upl = %r.unrealised_pnl, occ_funding = %r.occ_funding_fee, "position"
            );
        }
    }
}
