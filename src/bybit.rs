// ===============================
// src/bybit.rs (signer, timestamps, wire models)
// ===============================
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::domain::{parse_decimal, FeedKind, Side};
use crate::positions::{ExecutionRecord, PositionRecord};

pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// hex(HMAC-SHA256(secret, payload)). HMAC accepts keys of any length.
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// REST v5: sign(ts + api_key + recv_window + body_or_query)
pub fn rest_signature(secret: &str, ts: i64, api_key: &str, recv_window: u64, payload: &str) -> String {
    sign(secret, &format!("{ts}{api_key}{recv_window}{payload}"))
}

/// Private WS login frame: `{"op":"auth","args":[key, expires, sign("GET/realtime{expires}")]}`
pub fn ws_auth_frame(api_key: &str, api_secret: &str, expires_ms: i64) -> String {
    let sig = sign(api_secret, &format!("GET/realtime{expires_ms}"));
    serde_json::json!({ "op": "auth", "args": [api_key, expires_ms, sig] }).to_string()
}

pub fn subscribe_frame(topics: &[String]) -> String {
    serde_json::json!({ "op": "subscribe", "args": topics }).to_string()
}

pub fn ping_frame() -> String {
    serde_json::json!({ "op": "ping" }).to_string()
}

/// `tickers.BTCUSDT` -> Ticker, `orderbook.1.BTCUSDT` -> Orderbook; symbol is after the last dot.
pub fn classify_topic(topic: &str) -> Option<(FeedKind, &str)> {
    let kind = if topic.starts_with("tickers.") {
        FeedKind::Ticker
    } else if topic.starts_with("orderbook.") {
        FeedKind::Orderbook
    } else {
        return None;
    };
    let symbol = topic.rsplit('.').next().filter(|s| !s.is_empty())?;
    Some((kind, symbol))
}

// --- Envelope dari WS (public & private) ---
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    pub topic: Option<String>,
    /// "snapshot" or "delta" on public topics
    #[serde(rename = "type")]
    pub frame_type: Option<String>,
    pub op: Option<String>,
    pub success: Option<bool>,
    pub ret_msg: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMsg {
    #[serde(default)] pub symbol: String,
    #[serde(default)] pub order_link_id: String,
    #[serde(default)] pub exec_type: String,
    pub exec_pnl: Option<String>,
    pub closed_pnl: Option<String>,
    pub exec_fee: Option<String>,
}

impl ExecutionMsg {
    pub fn into_record(self) -> ExecutionRecord {
        let realized_pnl = self
            .exec_pnl
            .as_deref()
            .and_then(parse_decimal)
            .or_else(|| self.closed_pnl.as_deref().and_then(parse_decimal))
            .unwrap_or_default();
        let fee = self.exec_fee.as_deref().and_then(parse_decimal).unwrap_or_default();
        ExecutionRecord {
            symbol: self.symbol,
            order_link_id: self.order_link_id,
            exec_type: self.exec_type,
            realized_pnl,
            fee,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMsg {
    #[serde(default)] pub symbol: String,
    #[serde(default)] pub side: String,
    pub size: Option<String>,
    pub avg_price: Option<String>,
    pub entry_price: Option<String>,
    pub unrealised_pnl: Option<String>,
    pub occ_funding_fee: Option<String>,
}

impl PositionMsg {
    pub fn into_record(self) -> PositionRecord {
        let side = match self.side.as_str() {
            "Buy" => Some(Side::Buy),
            "Sell" => Some(Side::Sell),
            _ => None,
        };
        let dec = |v: &Option<String>| v.as_deref().and_then(parse_decimal);
        PositionRecord {
            side,
            size: dec(&self.size).unwrap_or_default(),
            avg_price: dec(&self.avg_price).or_else(|| dec(&self.entry_price)).unwrap_or_default(),
            unrealised_pnl: dec(&self.unrealised_pnl).unwrap_or_default(),
            occ_funding_fee: dec(&self.occ_funding_fee).unwrap_or_default(),
            symbol: self.symbol,
        }
    }
}

/// `data` array of a private message, each element decoded independently; bad rows are dropped.
pub fn decode_rows<T: for<'de> Deserialize<'de>>(data: &Value) -> Vec<T> {
    data.as_array()
        .map(|rows| rows.iter().filter_map(|r| serde_json::from_value(r.clone()).ok()).collect())
        .unwrap_or_default()
}
