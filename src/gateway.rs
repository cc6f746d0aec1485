// ===============================
// src/gateway.rs (order venue seam + dispatcher task)
// ===============================
//
// The decision loop sends `GatewayCmd`s over an mpsc channel; a single task
// drains them in order, so a tick's CancelAll always lands before its new
// quotes. Failures are logged per command and never stop the queue.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::OrderIntent;
use crate::metrics::GATEWAY_CMDS;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("exchange rejected request: code={code} msg={msg}")]
    Rejected { code: i64, msg: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCmd {
    CancelAll(String),
    Submit(OrderIntent),
}

#[async_trait]
pub trait OrderVenue: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the exchange order id.
    async fn submit(&self, intent: &OrderIntent) -> Result<String, GatewayError>;

    async fn cancel_all(&self, symbol: &str) -> Result<(), GatewayError>;
}

/// Drain commands until every sender is dropped.
pub async fn run<V: OrderVenue>(mut rx: mpsc::Receiver<GatewayCmd>, venue: V) {
    let venue_name = venue.name().to_string();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            GatewayCmd::CancelAll(symbol) => match venue.cancel_all(&symbol).await {
                Ok(()) => {
                    GATEWAY_CMDS.with_label_values(&[venue_name.as_str(), "cancel_ok"]).inc();
                }
                Err(e) => {
                    GATEWAY_CMDS.with_label_values(&[venue_name.as_str(), "cancel_err"]).inc();
                    warn!(venue = %venue_name, %symbol, error = %e, "cancel-all failed");
                }
            },
            GatewayCmd::Submit(intent) => match venue.submit(&intent).await {
                Ok(order_id) => {
                    GATEWAY_CMDS.with_label_values(&[venue_name.as_str(), "submit_ok"]).inc();
                    info!(venue = %venue_name, link = %intent.client_id, %order_id, "order accepted");
                }
                Err(e) => {
                    GATEWAY_CMDS.with_label_values(&[venue_name.as_str(), "submit_err"]).inc();
                    warn!(venue = %venue_name, link = %intent.client_id, error = %e, "order submit failed");
                }
            },
        }
    }
    info!(venue = %venue_name, "gateway: channel closed, stopped");
}

/// Dry-run venue: accepts everything, keeps a journal of what it was asked to do.
#[derive(Debug, Clone, Default)]
pub struct PaperVenue {
    seq: Arc<AtomicU64>,
    journal: Arc<Mutex<Vec<GatewayCmd>>>,
}

impl PaperVenue {
    pub fn new() -> Self { Self::default() }

    pub fn journal(&self) -> Vec<GatewayCmd> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn log(&self, cmd: GatewayCmd) {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).push(cmd);
    }
}

#[async_trait]
impl OrderVenue for PaperVenue {
    fn name(&self) -> &str { "paper" }

    async fn submit(&self, intent: &OrderIntent) -> Result<String, GatewayError> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            link = %intent.client_id, side = ?intent.side, qty = %intent.qty, px = ?intent.price,
            kind = ?intent.order_type, "[dry-run] order"
        );
        self.log(GatewayCmd::Submit(intent.clone()));
        Ok(format!("paper-{n}"))
    }

    async fn cancel_all(&self, symbol: &str) -> Result<(), GatewayError> {
        info!(%symbol, "[dry-run] cancel-all");
        self.log(GatewayCmd::CancelAll(symbol.to_string()));
        Ok(())
    }
}
