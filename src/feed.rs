// ===============================
// src/feed.rs
// ===============================
//
// Market data / account adapters:
// - run_mock            : random-walk book shaped like Bybit payloads (offline dry runs)
// - run_bybit_public    : v5 public WS, tickers.<SYM> + orderbook.<depth>.<SYM> -> MarketDataCache
// - run_bybit_private   : v5 private WS, execution + position -> PositionTracker
//
// Both WS adapters reconnect forever with exponential backoff + jitter and send
// {"op":"ping"} every 20s to keep the session alive.
//

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bybit::{
    classify_topic, decode_rows, ping_frame, subscribe_frame, timestamp_ms, ws_auth_frame,
    ExecutionMsg, PositionMsg, WsEnvelope,
};
use crate::domain::{decimal_from_json, round_down, FeedKind};
use crate::market_data::MarketDataCache;
use crate::positions::PositionTracker;

const PING_EVERY: Duration = Duration::from_secs(20);
const AUTH_TTL_MS: i64 = 10_000;

/// Generator market data mock (random walk), one ticker + one book per `every`.
pub async fn run_mock(cache: Arc<MarketDataCache>, symbol: String, every: Duration) {
    let tick = dec!(0.1);
    let mut mid = dec!(100.00);
    loop {
        // jangan simpan ThreadRng melewati .await
        let (step, half_ticks) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-3i64..=3), rng.gen_range(1i64..=3))
        };
        mid = (mid + tick * Decimal::from(step)).max(dec!(50));
        let (ticker, book) = mock_payloads(&symbol, mid, tick * Decimal::from(half_ticks), tick);
        cache.update(&symbol, FeedKind::Ticker, ticker);
        cache.update(&symbol, FeedKind::Orderbook, book);
        sleep(every).await;
    }
}

/// Ticker + 5-level book around `mid`, prices on the `tick` grid.
pub fn mock_payloads(symbol: &str, mid: Decimal, half_spread: Decimal, tick: Decimal) -> (Value, Value) {
    let best_bid = round_down(mid - half_spread, tick);
    let best_ask = best_bid + (half_spread * dec!(2)).max(tick);
    let level = |px: Decimal| json!([px.normalize().to_string(), "1.000"]);
    let bids: Vec<Value> = (0..5).map(|i| level(best_bid - tick * Decimal::from(i))).collect();
    let asks: Vec<Value> = (0..5).map(|i| level(best_ask + tick * Decimal::from(i))).collect();
    let ticker = json!({
        "symbol": symbol,
        "lastPrice": mid.normalize().to_string(),
        "bid1Price": best_bid.normalize().to_string(),
        "ask1Price": best_ask.normalize().to_string(),
    });
    let book = json!({ "s": symbol, "b": bids, "a": asks, "u": timestamp_ms() });
    (ticker, book)
}

/// Route one public message into the cache. Returns false for non-data frames
/// (pong, subscribe acks, unknown topics) and for deltas that cannot be applied.
/// `delta` frames are merged into the cached payload, everything else replaces it.
pub fn handle_public_text(cache: &MarketDataCache, txt: &str) -> bool {
    let env = match serde_json::from_str::<WsEnvelope>(txt) {
        Ok(e) => e,
        Err(e) => {
            warn!(?e, "public ws: undecodable frame");
            return false;
        }
    };
    if let Some(op) = env.op.as_deref() {
        if env.success == Some(false) {
            warn!(%op, msg = ?env.ret_msg, "public ws: op failed");
        }
        return false;
    }
    let Some(topic) = env.topic.as_deref() else { return false };
    match classify_topic(topic) {
        Some((kind, symbol)) if env.frame_type.as_deref() == Some("delta") => {
            let Some(base) = cache.latest(symbol, kind) else {
                warn!(%topic, "public ws: delta before snapshot, dropped");
                return false;
            };
            match merge_delta(kind, &base, &env.data) {
                Some(merged) => {
                    cache.update(symbol, kind, merged);
                    true
                }
                None => {
                    warn!(%topic, "public ws: malformed delta, dropped");
                    false
                }
            }
        }
        Some((kind, symbol)) => {
            cache.update(symbol, kind, env.data);
            true
        }
        None => {
            debug!(%topic, "public ws: ignored topic");
            false
        }
    }
}

/// Ticker deltas carry only the changed fields. Orderbook delta rows upsert by
/// price; size "0" deletes the level.
fn merge_delta(kind: FeedKind, base: &Value, delta: &Value) -> Option<Value> {
    let mut out = base.clone();
    let obj = out.as_object_mut()?;
    match kind {
        FeedKind::Ticker => {
            for (k, v) in delta.as_object()? {
                obj.insert(k.clone(), v.clone());
            }
        }
        FeedKind::Orderbook => {
            let empty = Value::Array(Vec::new());
            for (key, descending) in [("b", true), ("a", false)] {
                let merged = merge_book_side(
                    base.get(key).unwrap_or(&empty),
                    delta.get(key).unwrap_or(&empty),
                    descending,
                )?;
                obj.insert(key.to_string(), merged);
            }
            for key in ["u", "seq"] {
                if let Some(v) = delta.get(key) {
                    obj.insert(key.to_string(), v.clone());
                }
            }
        }
    }
    Some(out)
}

fn merge_book_side(base: &Value, delta: &Value, descending: bool) -> Option<Value> {
    let mut levels: BTreeMap<Decimal, Value> = BTreeMap::new();
    for row in base.as_array()? {
        levels.insert(row.get(0).and_then(decimal_from_json)?, row.clone());
    }
    for row in delta.as_array()? {
        let px = row.get(0).and_then(decimal_from_json)?;
        let size = row.get(1).and_then(decimal_from_json)?;
        if size.is_zero() {
            levels.remove(&px);
        } else {
            levels.insert(px, row.clone());
        }
    }
    let rows: Vec<Value> = if descending { levels.into_values().rev().collect() } else { levels.into_values().collect() };
    Some(Value::Array(rows))
}

/// Route one private message into the tracker. Returns Err when the auth reply failed.
pub fn handle_private_text(tracker: &PositionTracker, txt: &str) -> Result<(), String> {
    let env = match serde_json::from_str::<WsEnvelope>(txt) {
        Ok(e) => e,
        Err(e) => {
            warn!(?e, "private ws: undecodable frame");
            return Ok(());
        }
    };
    if let Some(op) = env.op.as_deref() {
        match (op, env.success) {
            ("auth", Some(false)) => return Err(env.ret_msg.unwrap_or_else(|| "auth rejected".into())),
            ("auth", Some(true)) => info!("private ws: authenticated"),
            (_, Some(false)) => warn!(%op, msg = ?env.ret_msg, "private ws: op failed"),
            _ => {}
        }
        return Ok(());
    }
    match env.topic.as_deref() {
        Some("execution") => {
            let rows: Vec<ExecutionMsg> = decode_rows(&env.data);
            let recs: Vec<_> = rows.into_iter().map(ExecutionMsg::into_record).collect();
            tracker.apply_executions(&recs);
        }
        Some("position") => {
            let rows: Vec<PositionMsg> = decode_rows(&env.data);
            let recs: Vec<_> = rows.into_iter().map(PositionMsg::into_record).collect();
            tracker.apply_positions(&recs);
        }
        Some(other) => debug!(topic = %other, "private ws: ignored topic"),
        None => {}
    }
    Ok(())
}

pub fn public_topics(symbols: &[String], depth: u32) -> Vec<String> {
    symbols
        .iter()
        .flat_map(|s| [format!("tickers.{s}"), format!("orderbook.{depth}.{s}")])
        .collect()
}

/// Adapter ke Bybit public WS. `ws_url` dari config (mainnet / testnet linear).
pub async fn run_bybit_public(cache: Arc<MarketDataCache>, symbols: Vec<String>, ws_url: String, depth: u32) {
    let topics = public_topics(&symbols, depth);
    run_session_loop("public", &ws_url, || vec![subscribe_frame(&topics)], |txt| {
        handle_public_text(&cache, txt);
        Ok(())
    })
    .await;
}

/// Adapter ke Bybit private WS: login, lalu subscribe execution + position.
pub async fn run_bybit_private(tracker: Arc<PositionTracker>, ws_url: String, api_key: String, api_secret: String) {
    let topics = vec!["execution".to_string(), "position".to_string()];
    run_session_loop(
        "private",
        &ws_url,
        || {
            // expires dihitung ulang setiap reconnect
            let expires = timestamp_ms() + AUTH_TTL_MS;
            vec![ws_auth_frame(&api_key, &api_secret, expires), subscribe_frame(&topics)]
        },
        |txt| handle_private_text(&tracker, txt),
    )
    .await;
}

/// Connect, send the opening frames, pump text frames into `on_text` while pinging.
/// Any read error, close, or `on_text` error ends the session and triggers a reconnect.
async fn run_session_loop<O, H>(label: &'static str, ws_url: &str, mut opening: O, mut on_text: H)
where
    O: FnMut() -> Vec<String>,
    H: FnMut(&str) -> Result<(), String>,
{
    let url = match Url::parse(ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, feed = label, "bad ws url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        info!(%ws_url, feed = label, "connecting bybit ws");
        match connect_async(url.clone()).await {
            Ok((ws, _resp)) => {
                info!(feed = label, "connected");
                attempt = 0; // reset backoff
                let (mut write, mut read) = ws.split();

                let mut opened = true;
                for frame in opening() {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        error!(?e, feed = label, "failed to send opening frame");
                        opened = false;
                        break;
                    }
                }

                let mut ping = interval(PING_EVERY);
                ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ping.tick().await; // first tick fires immediately

                while opened {
                    tokio::select! {
                        _ = ping.tick() => {
                            if let Err(e) = write.send(Message::Text(ping_frame())).await {
                                warn!(?e, feed = label, "ping failed");
                                break;
                            }
                        }
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(txt))) => {
                                if let Err(msg) = on_text(&txt) {
                                    error!(feed = label, %msg, "session rejected");
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(c))) => {
                                info!(feed = label, ?c, "server closed");
                                break;
                            }
                            Some(Ok(_)) => {
                                // ignore binary / ping / pong frames
                            }
                            Some(Err(e)) => {
                                error!(?e, feed = label, "ws read error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
                info!(feed = label, "disconnected, will reconnect…");
            }
            Err(e) => {
                error!(?e, feed = label, "connect failed");
            }
        }

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(backoff(attempt, jitter)).await;
    }
}

/// 0.5s * 2^min(attempt, 6) + jitter ms  (1s .. 32s)
pub fn backoff(attempt: u32, jitter_ms: u64) -> Duration {
    let factor = 1u64 << attempt.min(6);
    Duration::from_millis(500u64.saturating_mul(factor) + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionView;

    #[test]
    fn public_frames_land_in_cache() {
        let cache = MarketDataCache::new();
        assert!(handle_public_text(
            &cache,
            r#"{"topic":"orderbook.1.BTCUSDT","type":"snapshot","data":{"s":"BTCUSDT","b":[["100.0","1"]],"a":[["100.2","1"]]}}"#
        ));
        assert!(handle_public_text(&cache, r#"{"topic":"tickers.BTCUSDT","data":{"symbol":"BTCUSDT","lastPrice":"100.1"}}"#));
        assert!(!handle_public_text(&cache, r#"{"op":"pong","success":true}"#));
        assert!(!handle_public_text(&cache, r#"{"topic":"publicTrade.BTCUSDT","data":[]}"#));
        assert!(!handle_public_text(&cache, "not json"));

        assert!(cache.is_ready());
        let snap = cache.snapshot("BTCUSDT").unwrap();
        assert_eq!(snap.best_bid(), Some(dec!(100.0)));
        assert_eq!(snap.best_ask(), Some(dec!(100.2)));
    }

    #[test]
    fn orderbook_deltas_merge_into_the_cached_book() {
        let cache = MarketDataCache::new();
        // delta sebelum snapshot tidak punya basis
        assert!(!handle_public_text(
            &cache,
            r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","data":{"s":"BTCUSDT","b":[["99.0","1"]],"a":[]}}"#
        ));
        assert!(cache.latest("BTCUSDT", FeedKind::Orderbook).is_none());

        assert!(handle_public_text(
            &cache,
            r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","data":{"s":"BTCUSDT","b":[["100.0","1"],["99.5","2"]],"a":[["100.2","1"],["100.4","3"]],"u":1}}"#
        ));
        assert!(handle_public_text(&cache, r#"{"topic":"tickers.BTCUSDT","type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"100.1"}}"#));

        // a deletion row must not become a level
        assert!(handle_public_text(
            &cache,
            r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","data":{"s":"BTCUSDT","b":[["95.0","0"]],"a":[],"u":2}}"#
        ));
        let snap = cache.snapshot("BTCUSDT").unwrap();
        assert_eq!(snap.best_bid(), Some(dec!(100.0)));
        assert_eq!(snap.bids.len(), 2);

        // delete the best bid, insert a better ask, resize a level
        assert!(handle_public_text(
            &cache,
            r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","data":{"s":"BTCUSDT","b":[["100.0","0"],["99.5","5"]],"a":[["100.1","2"]],"u":3}}"#
        ));
        let snap = cache.snapshot("BTCUSDT").unwrap();
        assert_eq!(snap.best_bid(), Some(dec!(99.5)));
        assert_eq!(snap.bids[0].size, dec!(5));
        assert_eq!(snap.asks.iter().map(|l| l.price).collect::<Vec<_>>(), vec![dec!(100.1), dec!(100.2), dec!(100.4)]);
        assert_eq!(snap.raw_orderbook["u"], 3);

        // ticker delta only carries changed fields
        assert!(handle_public_text(&cache, r#"{"topic":"tickers.BTCUSDT","type":"delta","data":{"symbol":"BTCUSDT","bid1Price":"99.5"}}"#));
        let ticker = cache.latest("BTCUSDT", FeedKind::Ticker).unwrap();
        assert_eq!(ticker["lastPrice"], "100.1");
        assert_eq!(ticker["bid1Price"], "99.5");

        assert!(!handle_public_text(
            &cache,
            r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","data":{"b":[["oops","1"]],"a":[]}}"#
        ));
        assert_eq!(cache.snapshot("BTCUSDT").unwrap().best_bid(), Some(dec!(99.5)));
    }

    #[test]
    fn private_frames_update_tracker() {
        let tracker = PositionTracker::new();
        handle_private_text(
            &tracker,
            r#"{"topic":"execution","data":[
                {"symbol":"BTCUSDT","orderLinkId":"bid_mmlo_1_1","execType":"Trade","execPnl":"0.5","execFee":"0.01"},
                {"symbol":"BTCUSDT","orderLinkId":"","execType":"Funding","execFee":"0.03"}
            ]}"#,
        )
        .unwrap();
        handle_private_text(
            &tracker,
            r#"{"topic":"position","data":[{"symbol":"BTCUSDT","side":"Buy","size":"0.002","avgPrice":"100","unrealisedPnl":"0.2"}]}"#,
        )
        .unwrap();

        let t = tracker.totals();
        assert_eq!(t.realized, dec!(0.5));
        assert_eq!(t.fees, dec!(0.01));
        assert_eq!(t.funding, dec!(-0.03));
        assert_eq!(t.unrealized, dec!(0.2));
        assert_eq!(
            tracker.position_view("BTCUSDT"),
            PositionView { long_size: dec!(0.002), long_entry: dec!(100), ..Default::default() }
        );
    }

    #[test]
    fn failed_auth_ends_session() {
        let tracker = PositionTracker::new();
        assert!(handle_private_text(&tracker, r#"{"op":"auth","success":false,"ret_msg":"invalid sign"}"#).is_err());
        assert!(handle_private_text(&tracker, r#"{"op":"auth","success":true}"#).is_ok());
        assert!(handle_private_text(&tracker, r#"{"op":"subscribe","success":true}"#).is_ok());
    }

    #[test]
    fn mock_book_is_sane() {
        let (ticker, book) = mock_payloads("BTCUSDT", dec!(100.05), dec!(0.1), dec!(0.1));
        assert_eq!(ticker["symbol"], "BTCUSDT");
        let snap = crate::domain::MarketSnapshot::from_payloads("BTCUSDT", ticker, book).unwrap();
        let (bid, ask) = (snap.best_bid().unwrap(), snap.best_ask().unwrap());
        assert!(ask > bid);
        assert_eq!(bid, dec!(99.9));
        assert_eq!(ask, dec!(100.1));
        assert_eq!(snap.bids.len(), 5);
        assert!(snap.bids.windows(2).all(|w| w[0].price > w[1].price));
    }

    #[test]
    fn topics_and_backoff() {
        assert_eq!(
            public_topics(&["BTCUSDT".into()], 1),
            vec!["tickers.BTCUSDT".to_string(), "orderbook.1.BTCUSDT".to_string()]
        );
        assert_eq!(backoff(1, 0), Duration::from_millis(1000));
        assert_eq!(backoff(6, 0), Duration::from_secs(32));
        assert_eq!(backoff(40, 100), Duration::from_millis(32_100));
    }
}
