// ===============================
// src/gateway_bybit.rs
// ===============================
//
// Bybit v5 REST (category=linear):
// - POST /v5/order/create       signed, JSON body
// - POST /v5/order/cancel-all   signed, JSON body
// - GET  /v5/market/instruments-info   public, used once at startup
// - GET  /v5/account/wallet-balance    signed query, logged once at startup
//
// Response envelope: {"retCode":0,"retMsg":"OK","result":{...}}; retCode != 0 is a rejection.
//
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::bybit::{rest_signature, timestamp_ms};
use crate::domain::{decimal_from_json, InstrumentError, InstrumentMeta, OrderIntent};
use crate::gateway::{GatewayError, OrderVenue};

const CATEGORY: &str = "linear";

pub struct BybitVenue {
    http: reqwest::Client,
    rest_base: String,
    api_key: String,
    api_secret: String,
    recv_window: u64,
}

impl BybitVenue {
    pub fn new(http: reqwest::Client, rest_base: String, api_key: String, api_secret: String, recv_window: u64) -> Self {
        Self { http, rest_base: rest_base.trim_end_matches('/').to_string(), api_key, api_secret, recv_window }
    }

    async fn post_signed(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        let body = body.to_string();
        let ts = timestamp_ms();
        let sig = rest_signature(&self.api_secret, ts, &self.api_key, self.recv_window, &body);
        let rsp = self
            .http
            .post(format!("{}{}", self.rest_base, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("X-BAPI-SIGN", sig)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        let v = rsp.json::<Value>().await?;
        check_envelope(v)
    }

    /// GET variant: the signed payload is the query string as sent.
    async fn get_signed(&self, path: &str, query: &str) -> Result<Value, GatewayError> {
        let ts = timestamp_ms();
        let sig = rest_signature(&self.api_secret, ts, &self.api_key, self.recv_window, query);
        let rsp = self
            .http
            .get(format!("{}{}?{}", self.rest_base, path, query))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("X-BAPI-SIGN", sig)
            .send()
            .await?;
        let v = rsp.json::<Value>().await?;
        check_envelope(v)
    }

    pub async fn wallet_balance(&self, account_type: &str) -> Result<WalletBalance, GatewayError> {
        let query = format!("accountType={}", urlencoding::encode(account_type));
        let result = self.get_signed("/v5/account/wallet-balance", &query).await?;
        parse_wallet_balance(&result)
            .ok_or_else(|| GatewayError::Malformed(format!("no wallet in {result}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletBalance {
    pub account_type: String,
    pub total_equity: Decimal,
    pub available: Decimal,
    /// USDT wallet balance, when the account holds the coin
    pub usdt: Option<Decimal>,
}

/// First account of a wallet-balance `result`. Empty numeric strings read as zero.
pub fn parse_wallet_balance(result: &Value) -> Option<WalletBalance> {
    let acct = result.get("list").and_then(Value::as_array)?.first()?;
    let num = |v: Option<&Value>| v.and_then(decimal_from_json).unwrap_or_default();
    let usdt = acct
        .get("coin")
        .and_then(Value::as_array)
        .and_then(|coins| coins.iter().find(|c| c.get("coin").and_then(Value::as_str) == Some("USDT")))
        .and_then(|c| c.get("walletBalance").and_then(decimal_from_json));
    Some(WalletBalance {
        account_type: acct.get("accountType").and_then(Value::as_str).unwrap_or_default().to_string(),
        total_equity: num(acct.get("totalEquity")),
        available: num(acct.get("totalAvailableBalance")),
        usdt,
    })
}

/// Pulls `result` out of a v5 envelope, or maps a non-zero retCode to `Rejected`.
pub fn check_envelope(v: Value) -> Result<Value, GatewayError> {
    let code = v
        .get("retCode")
        .and_then(Value::as_i64)
        .ok_or_else(|| GatewayError::Malformed(format!("no retCode in {v}")))?;
    if code != 0 {
        let msg = v.get("retMsg").and_then(Value::as_str).unwrap_or_default().to_string();
        return Err(GatewayError::Rejected { code, msg });
    }
    Ok(v.get("result").cloned().unwrap_or(Value::Null))
}

/// Order body for /v5/order/create. Market orders carry no price.
pub fn order_body(intent: &OrderIntent) -> Value {
    let mut body = json!({
        "category": CATEGORY,
        "symbol": intent.symbol,
        "side": intent.side.as_str(),
        "orderType": intent.order_type.as_str(),
        "qty": intent.qty.normalize().to_string(),
        "timeInForce": intent.time_in_force.as_str(),
        "positionIdx": intent.position_idx,
        "orderLinkId": intent.client_id,
    });
    if let Some(px) = intent.price {
        body["price"] = Value::String(px.normalize().to_string());
    }
    body
}

#[async_trait]
impl OrderVenue for BybitVenue {
    fn name(&self) -> &str { "bybit" }

    async fn submit(&self, intent: &OrderIntent) -> Result<String, GatewayError> {
        let result = self.post_signed("/v5/order/create", &order_body(intent)).await?;
        let id = result.get("orderId").and_then(Value::as_str).unwrap_or_default().to_string();
        debug!(link = %intent.client_id, order_id = %id, "bybit order created");
        Ok(id)
    }

    async fn cancel_all(&self, symbol: &str) -> Result<(), GatewayError> {
        let result = self
            .post_signed("/v5/order/cancel-all", &json!({ "category": CATEGORY, "symbol": symbol }))
            .await?;
        let n = result.get("list").and_then(Value::as_array).map(|l| l.len()).unwrap_or(0);
        info!(%symbol, cancelled = n, "bybit cancel-all");
        Ok(())
    }
}

/// Find `symbol` in an instruments-info `result` and read tick / lot / min size.
pub fn parse_instrument_meta(result: &Value, symbol: &str) -> Result<InstrumentMeta, InstrumentError> {
    let item = result
        .get("list")
        .and_then(Value::as_array)
        .and_then(|l| l.iter().find(|i| i.get("symbol").and_then(Value::as_str) == Some(symbol)))
        .ok_or_else(|| InstrumentError::Missing(symbol.to_string()))?;

    let field = |v: Option<&Value>| v.and_then(decimal_from_json).unwrap_or_default();
    let lot = item.get("lotSizeFilter");
    let meta = InstrumentMeta {
        tick_size: field(item.pointer("/priceFilter/tickSize")),
        lot_size: field(lot.and_then(|l| l.get("qtyStep"))),
        min_qty: field(
            lot.and_then(|l| l.get("minOrderQty").or_else(|| l.get("minQty"))),
        ),
    };
    meta.validate(symbol)
}

#[derive(Debug, thiserror::Error)]
pub enum MetaFetchError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}

impl From<reqwest::Error> for MetaFetchError {
    fn from(e: reqwest::Error) -> Self { MetaFetchError::Gateway(GatewayError::Http(e)) }
}

pub async fn fetch_instrument_meta(
    http: &reqwest::Client,
    rest_base: &str,
    symbol: &str,
) -> Result<InstrumentMeta, MetaFetchError> {
    let url = format!(
        "{}/v5/market/instruments-info?category={}&symbol={}",
        rest_base.trim_end_matches('/'),
        CATEGORY,
        urlencoding::encode(symbol)
    );
    let v = http.get(url).send().await?.json::<Value>().await?;
    let result = check_envelope(v)?;
    Ok(parse_instrument_meta(&result, symbol)?)
}
