// ===============================
// src/market_data.rs (latest ticker + orderbook per symbol)
// ===============================
//
// Feed tasks call `update()` from whatever thread delivers the message;
// the decision loop reads with `latest()` / `snapshot()`. Payloads are stored
// behind `Arc` so a reader only clones a pointer under the read lock.
//
// Ready gate: a `watch` channel that flips once both a ticker and an orderbook
// have been seen (for any symbol). Every waiter observes the same value.
//
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{FeedKind, MarketSnapshot, SnapshotError};
use crate::metrics::MD_UPDATES;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Seen {
    ticker: bool,
    orderbook: bool,
}

impl Seen {
    fn ready(&self) -> bool { self.ticker && self.orderbook }
}

pub struct MarketDataCache {
    payloads: RwLock<HashMap<(String, FeedKind), Arc<Value>>>,
    seen: watch::Sender<Seen>,
}

impl Default for MarketDataCache {
    fn default() -> Self { Self::new() }
}

impl MarketDataCache {
    pub fn new() -> Self {
        let (seen, _rx) = watch::channel(Seen::default());
        Self { payloads: RwLock::new(HashMap::new()), seen }
    }

    /// Replace the stored payload for `(symbol, kind)` and wake readiness waiters.
    pub fn update(&self, symbol: &str, kind: FeedKind, payload: Value) {
        {
            let mut map = self.payloads.write().unwrap_or_else(PoisonError::into_inner);
            map.insert((symbol.to_string(), kind), Arc::new(payload));
        }
        self.seen.send_modify(|s| match kind {
            FeedKind::Ticker => s.ticker = true,
            FeedKind::Orderbook => s.orderbook = true,
        });
        MD_UPDATES.with_label_values(&[kind.as_str()]).inc();
        debug!(%symbol, kind = kind.as_str(), "market data updated");
    }

    pub fn latest(&self, symbol: &str, kind: FeedKind) -> Option<Arc<Value>> {
        let map = self.payloads.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&(symbol.to_string(), kind)).cloned()
    }

    /// Both payloads for `symbol`, taken under one read lock, parsed into a snapshot.
    pub fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, SnapshotError> {
        let (ticker, orderbook) = {
            let map = self.payloads.read().unwrap_or_else(PoisonError::into_inner);
            (
                map.get(&(symbol.to_string(), FeedKind::Ticker)).cloned(),
                map.get(&(symbol.to_string(), FeedKind::Orderbook)).cloned(),
            )
        };
        let ticker = ticker.ok_or_else(|| SnapshotError::NotReceived("ticker", symbol.to_string()))?;
        let orderbook = orderbook.ok_or_else(|| SnapshotError::NotReceived("orderbook", symbol.to_string()))?;
        MarketSnapshot::from_payloads(symbol, (*ticker).clone(), (*orderbook).clone())
    }

    pub fn is_ready(&self) -> bool { self.seen.borrow().ready() }

    /// Wait until at least one ticker and one orderbook arrived, or `timeout` elapses.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.seen.subscribe();
        let ready = matches!(tokio::time::timeout(timeout, rx.wait_for(|s| s.ready())).await, Ok(Ok(_)));
        ready
    }
}
