// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::domain::{PnlTotals, PositionView};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feeds --------
pub static MD_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("md_updates_total", "public market data payloads stored (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static PRIVATE_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("private_records_total", "private stream records applied (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

// -------- Decision loop --------
pub static TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total", "decision ticks by outcome (refreshed / held / skipped)"),
        &["outcome"],
    )
    .unwrap()
});

pub static INTENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("intents_total", "order intents emitted (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static GATEWAY_CMDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gateway_commands_total", "commands handled by the order venue"),
        &["venue", "result"],
    )
    .unwrap()
});

// -------- PnL & inventory --------
pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL (quote ccy)").unwrap());
pub static PNL_FEES: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_fees", "trading fees paid (quote ccy)").unwrap());
pub static PNL_FUNDING: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_funding", "funding received, negative when paid").unwrap());
pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized", "unrealized PnL (quote ccy)").unwrap());

pub static POSITION_SIZE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("position_size", "position size per side"), &["side"]).unwrap()
});

// ---- Config visibility ----
pub static CONFIG_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_mode", "active quoting mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(MD_UPDATES.clone())),
        REGISTRY.register(Box::new(PRIVATE_RECORDS.clone())),
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(INTENTS.clone())),
        REGISTRY.register(Box::new(GATEWAY_CMDS.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_FEES.clone())),
        REGISTRY.register(Box::new(PNL_FUNDING.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(POSITION_SIZE.clone())),
        REGISTRY.register(Box::new(CONFIG_MODE.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

fn as_f64(d: Decimal) -> f64 { d.to_f64().unwrap_or(0.0) }

pub fn export_pnl(t: &PnlTotals) {
    PNL_REALIZED.set(as_f64(t.realized));
    PNL_FEES.set(as_f64(t.fees));
    PNL_FUNDING.set(as_f64(t.funding));
    PNL_UNREALIZED.set(as_f64(t.unrealized));
}

pub fn export_position(p: &PositionView) {
    POSITION_SIZE.with_label_values(&["long"]).set(as_f64(p.long_size));
    POSITION_SIZE.with_label_values(&["short"]).set(as_f64(p.short_size));
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut rsp = Response::new(Body::from(encode_metrics()));
    rsp.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(rsp)
}

// Every path answers with the full registry (GET / and /metrics alike)
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    info!(%addr, "metrics listening on http://{addr}/metrics");
    if let Err(e) = server.serve(make_svc).await {
        error!(?e, "metrics server stopped");
    }
}
