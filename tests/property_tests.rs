//! Property-based checks for the quoting math.

use perp_mm::domain::{round_down, InstrumentMeta, MarketSnapshot, PositionView, Side};
use perp_mm::risk::inventory_scale;
use perp_mm::strategy::{quote_frame, FlatMaker, LadderMaker, QuoteParams, QuoteStrategy};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1_000i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2)) // 10.00 to 100,000.00
}

fn step_strategy() -> impl Strategy<Value = Decimal> {
    prop_oneof![Just(dec!(0.001)), Just(dec!(0.01)), Just(dec!(0.1)), Just(dec!(0.5)), Just(dec!(1))]
}

fn qty_strategy() -> impl Strategy<Value = Decimal> {
    (-100_000i64..=100_000i64).prop_map(|x| Decimal::new(x, 4)) // -10 to 10
}

fn book(bid: Decimal, ask: Decimal) -> MarketSnapshot {
    MarketSnapshot::from_payloads(
        "BTCUSDT",
        json!({}),
        json!({"b": [[bid.to_string(), "1"]], "a": [[ask.to_string(), "1"]]}),
    )
    .unwrap()
}

proptest! {
    /// Rounding twice changes nothing, never rounds up, and loses less than one step
    #[test]
    fn round_down_idempotent_and_bounded(
        v in price_strategy(),
        step in step_strategy(),
    ) {
        let once = round_down(v, step);
        prop_assert_eq!(round_down(once, step), once);
        prop_assert!(once <= v);
        prop_assert!(v - once < step);
    }

    /// Target spread never drops under the configured floor
    #[test]
    fn target_spread_respects_floor(
        bid in price_strategy(),
        gap in 1i64..5_000i64,
        min_bps in 0i64..200i64,
        factor_pct in 1i64..300i64,
    ) {
        let ask = bid + Decimal::new(gap, 2);
        let params = QuoteParams {
            min_spread_bps: Decimal::from(min_bps),
            spread_factor: Decimal::new(factor_pct, 2),
            ..QuoteParams::default()
        };
        let f = quote_frame(&book(bid, ask), &params).unwrap();
        prop_assert!(f.target_spread_bps >= params.min_spread_bps);
        prop_assert!(f.target_spread_bps >= f.live_spread_bps * params.spread_factor);
        prop_assert!(f.mid > bid && f.mid < ask);
    }

    /// Scales stay in [0, 1]; inside the cap the exposure side keeps at least 0.2
    #[test]
    fn inventory_scale_bounds(
        net in qty_strategy(),
        max in (1i64..100_000i64).prop_map(|x| Decimal::new(x, 4)),
    ) {
        let (bid_s, ask_s) = inventory_scale(net, max);
        for s in [bid_s, ask_s] {
            prop_assert!(s >= Decimal::ZERO && s <= Decimal::ONE);
        }
        let exposure_side = if net > Decimal::ZERO { bid_s } else { ask_s };
        let reducing_side = if net > Decimal::ZERO { ask_s } else { bid_s };
        prop_assert_eq!(reducing_side, Decimal::ONE);
        if net.abs() <= max {
            prop_assert!(exposure_side >= dec!(0.2));
        } else {
            prop_assert_eq!(exposure_side, Decimal::ZERO);
        }
    }

    /// Ladder bids sit under mid and asks are never priced below the bids
    #[test]
    fn ladder_prices_straddle_mid(
        bid in price_strategy(),
        gap in 1i64..500i64,
        levels in 1u32..6u32,
        net in qty_strategy(),
    ) {
        let ask = bid + Decimal::new(gap, 2);
        let meta = InstrumentMeta { tick_size: dec!(0.01), lot_size: dec!(0.001), min_qty: dec!(0.001) };
        let params = QuoteParams {
            ladder_levels: levels,
            max_net_qty: dec!(5),
            min_spread_bps: dec!(1),
            ..QuoteParams::default()
        };
        let pos = if net >= Decimal::ZERO {
            PositionView { long_size: net, long_entry: bid, ..Default::default() }
        } else {
            PositionView { short_size: -net, short_entry: ask, ..Default::default() }
        };
        let mut s = LadderMaker::new("BTCUSDT".into(), params);
        let d = s.decide(&book(bid, ask), &meta, &pos).unwrap();
        let max_bid = d.intents.iter().filter(|i| i.side == Side::Buy).filter_map(|i| i.price).max();
        let min_ask = d.intents.iter().filter(|i| i.side == Side::Sell).filter_map(|i| i.price).min();
        if let Some(b) = max_bid {
            prop_assert!(b < d.mid);
        }
        if let (Some(b), Some(a)) = (max_bid, min_ask) {
            prop_assert!(b < a);
        }
        for i in &d.intents {
            prop_assert!(i.qty > Decimal::ZERO);
            if let Some(p) = i.price {
                prop_assert!(p > Decimal::ZERO);
            }
        }
    }

    /// Cheap instruments with very wide books never produce a price at or below zero
    #[test]
    fn wide_books_keep_every_price_positive(
        bid in (1i64..1_000i64).prop_map(|x| Decimal::new(x, 2)), // 0.01 to 9.99
        gap in 1i64..100_000i64,
        levels in 1u32..10u32,
        long in (0i64..20_000i64).prop_map(|x| Decimal::new(x, 4)),
        short in (0i64..20_000i64).prop_map(|x| Decimal::new(x, 4)),
    ) {
        let ask = bid + Decimal::new(gap, 2);
        let meta = InstrumentMeta { tick_size: dec!(0.01), lot_size: dec!(0.001), min_qty: dec!(0.001) };
        let params = QuoteParams { ladder_levels: levels, max_net_qty: dec!(5), ..QuoteParams::default() };
        let pos = PositionView { long_size: long, long_entry: bid, short_size: short, short_entry: ask };
        let snap = book(bid, ask);
        let mut two_sided = LadderMaker::new("BTCUSDT".into(), params.clone());
        let mut flat = FlatMaker::new("BTCUSDT".into(), params);
        for d in [two_sided.decide(&snap, &meta, &pos), flat.decide(&snap, &meta, &pos)].into_iter().flatten() {
            for i in &d.intents {
                prop_assert!(i.price.map_or(true, |p| p > Decimal::ZERO), "{:?}", i);
            }
        }
    }
}
