// ===============================
// src/lib.rs
// ===============================
pub mod domain;
pub mod config;
pub mod metrics;
pub mod market_data;   // latest ticker/orderbook per symbol + ready gate
pub mod positions;     // PnL ledger + per-symbol position view
pub mod risk;
pub mod strategy;
pub mod driver;        // fixed-interval decision loop
pub mod gateway;       // venue seam + dispatcher task + paper venue
pub mod bybit;         // helper (signer/wire types) for Bybit v5
pub mod gateway_bybit; // real Bybit linear perps (REST)
pub mod feed;
