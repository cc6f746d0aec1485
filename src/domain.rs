// ===============================
// src/domain.rs
// ===============================
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "Buy", Side::Sell => "Sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType { Limit, Market }
impl OrderType {
    pub fn as_str(&self) -> &'static str { match self { OrderType::Limit => "Limit", OrderType::Market => "Market" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce { GTC, IOC }
impl TimeInForce {
    pub fn as_str(&self) -> &'static str { match self { TimeInForce::GTC => "GTC", TimeInForce::IOC => "IOC" } }
}

/// Satu order yang ingin dikirim strategi. `price` kosong untuk market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub position_idx: u8,
    pub client_id: String,
    pub time_in_force: TimeInForce,
}

impl OrderIntent {
    pub fn is_market(&self) -> bool { self.order_type == OrderType::Market }
}

#[derive(Debug, Error, PartialEq)]
pub enum InstrumentError {
    #[error("instrument metadata for {symbol} has non-positive {field}")]
    NonPositive { symbol: String, field: &'static str },
    #[error("instrument metadata for {0} not found")]
    Missing(String),
}

/// Tick / lot / minimum size for one symbol. Loaded once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_qty: Decimal,
}

impl InstrumentMeta {
    pub fn validate(self, symbol: &str) -> Result<Self, InstrumentError> {
        for (field, v) in [("tick_size", self.tick_size), ("lot_size", self.lot_size), ("min_qty", self.min_qty)] {
            if v <= Decimal::ZERO {
                return Err(InstrumentError::NonPositive { symbol: symbol.to_string(), field });
            }
        }
        Ok(self)
    }
}

// Inventory structures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub long_size: Decimal,
    pub short_size: Decimal,
    pub long_entry: Decimal,
    pub short_entry: Decimal,
}

impl PositionView {
    pub fn net_qty(&self) -> Decimal { self.long_size - self.short_size }
    pub fn gross_qty(&self) -> Decimal { self.long_size + self.short_size }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlTotals {
    pub realized: Decimal,
    pub fees: Decimal,
    pub funding: Decimal,
    pub unrealized: Decimal,
}

impl PnlTotals {
    pub fn net(&self) -> Decimal { self.realized - self.fees + self.funding + self.unrealized }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedKind { Ticker, Orderbook }
impl FeedKind {
    pub fn as_str(&self) -> &'static str { match self { FeedKind::Ticker => "ticker", FeedKind::Orderbook => "orderbook" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel { pub price: Decimal, pub size: Decimal }

#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("no {0} received yet for {1}")]
    NotReceived(&'static str, String),
    #[error("orderbook for {0} is missing b/a")]
    MissingSides(String),
    #[error("orderbook for {symbol} has a malformed level: {detail}")]
    BadLevel { symbol: String, detail: String },
}

/// Point-in-time view of one symbol: raw payloads plus parsed book sides (best first).
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub raw_ticker: Value,
    pub raw_orderbook: Value,
}

impl MarketSnapshot {
    /// Parse a Bybit-shaped orderbook (`{"b":[["px","sz"],..],"a":[..]}`, optionally wrapped
    /// in `result`). Empty sides are accepted here; strategies reject them.
    pub fn from_payloads(symbol: &str, ticker: Value, orderbook: Value) -> Result<Self, SnapshotError> {
        let book = orderbook.get("result").unwrap_or(&orderbook);
        let (b, a) = match (book.get("b"), book.get("a")) {
            (Some(b), Some(a)) => (b, a),
            _ => return Err(SnapshotError::MissingSides(symbol.to_string())),
        };
        let bids = parse_levels(symbol, b)?;
        let asks = parse_levels(symbol, a)?;
        Ok(Self { symbol: symbol.to_string(), bids, asks, raw_ticker: ticker, raw_orderbook: orderbook })
    }

    pub fn best_bid(&self) -> Option<Decimal> { self.bids.first().map(|l| l.price) }
    pub fn best_ask(&self) -> Option<Decimal> { self.asks.first().map(|l| l.price) }
}

fn parse_levels(symbol: &str, side: &Value) -> Result<Vec<BookLevel>, SnapshotError> {
    let bad = |detail: String| SnapshotError::BadLevel { symbol: symbol.to_string(), detail };
    let rows = side.as_array().ok_or_else(|| bad(format!("side is not an array: {side}")))?;
    rows.iter()
        .map(|row| {
            let price = row.get(0).and_then(decimal_from_json);
            let size = row.get(1).and_then(decimal_from_json);
            match (price, size) {
                (Some(price), Some(size)) => Ok(BookLevel { price, size }),
                _ => Err(bad(row.to_string())),
            }
        })
        .collect()
}

/// Bybit mengirim angka sebagai string; "" dianggap tidak ada.
pub fn decimal_from_json(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

pub fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
}

/// Round toward zero onto `step`. A non-positive step means no rounding.
pub fn round_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).trunc() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn round_down_truncates_to_step() {
        assert_eq!(round_down(dec!(100.5), dec!(0.1)), dec!(100.5));
        assert_eq!(round_down(dec!(99.87), dec!(0.1)), dec!(99.8));
        assert_eq!(round_down(dec!(0.0199), dec!(0.01)), dec!(0.01));
        assert_eq!(round_down(dec!(12.345), dec!(0)), dec!(12.345));
        assert_eq!(round_down(dec!(12.345), dec!(-1)), dec!(12.345));
    }

    #[test]
    fn snapshot_parses_bybit_book() {
        let ob = json!({"s": "BTCUSDT", "b": [["99.9", "1.5"], ["99.8", "2"]], "a": [["100.1", "0.7"]], "u": 1});
        let snap = MarketSnapshot::from_payloads("BTCUSDT", json!({}), ob).unwrap();
        assert_eq!(snap.best_bid(), Some(dec!(99.9)));
        assert_eq!(snap.best_ask(), Some(dec!(100.1)));
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[1].size, dec!(2));
    }

    #[test]
    fn snapshot_accepts_result_wrapper_and_empty_sides() {
        let ob = json!({"result": {"b": [], "a": [["100.1", "0.7"]]}});
        let snap = MarketSnapshot::from_payloads("ETHUSDT", json!({}), ob).unwrap();
        assert_eq!(snap.best_bid(), None);
        assert_eq!(snap.best_ask(), Some(dec!(100.1)));
    }

    #[test]
    fn snapshot_rejects_missing_or_malformed_sides() {
        let err = MarketSnapshot::from_payloads("X", json!({}), json!({"b": []})).unwrap_err();
        assert_eq!(err, SnapshotError::MissingSides("X".into()));

        let err = MarketSnapshot::from_payloads("X", json!({}), json!({"b": [["abc", "1"]], "a": []})).unwrap_err();
        assert!(matches!(err, SnapshotError::BadLevel { .. }));
    }

    #[test]
    fn instrument_meta_rejects_zero_fields() {
        let meta = InstrumentMeta { tick_size: dec!(0.1), lot_size: dec!(0), min_qty: dec!(0.01) };
        assert_eq!(
            meta.validate("BTCUSDT"),
            Err(InstrumentError::NonPositive { symbol: "BTCUSDT".into(), field: "lot_size" })
        );
        let ok = InstrumentMeta { lot_size: dec!(0.001), ..meta };
        assert!(ok.validate("BTCUSDT").is_ok());
    }

    #[test]
    fn pnl_net_combines_components() {
        let t = PnlTotals { realized: dec!(10), fees: dec!(1.5), funding: dec!(-0.5), unrealized: dec!(2) };
        assert_eq!(t.net(), dec!(10));
    }

    #[test]
    fn empty_string_is_absent() {
        assert_eq!(parse_decimal(""), None);
        assert_eq!(decimal_from_json(&json!("0.25")), Some(dec!(0.25)));
        assert_eq!(decimal_from_json(&json!(3)), Some(dec!(3)));
    }
}
