// ===============================
// src/risk.rs
// ===============================
//
// Pure inventory / notional / stop checks. No state; the quoting strategies
// call these once per tick with the latest position view.
//
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::PositionView;

const BPS: Decimal = dec!(10000);

/// `(bid_scale, ask_scale)` for a signed inventory.
///
/// Beyond the hard cap the side that would add exposure is zeroed (net long => no bids).
/// Inside the cap that side shrinks linearly, floored at 0.2 so skew alone never
/// silences the quotes. The side that reduces exposure stays at 1.0.
/// A non-positive `max_net_qty` disables inventory control.
pub fn inventory_scale(net_qty: Decimal, max_net_qty: Decimal) -> (Decimal, Decimal) {
    let one = Decimal::ONE;
    if max_net_qty <= Decimal::ZERO || net_qty.is_zero() {
        return (one, one);
    }
    let exposure = net_qty.abs();
    let shrunk = if exposure > max_net_qty {
        Decimal::ZERO
    } else {
        (one - exposure / max_net_qty).max(dec!(0.2))
    };
    if net_qty > Decimal::ZERO { (shrunk, one) } else { (one, shrunk) }
}

/// `(long + short) * mid >= cap`; a non-positive cap disables the check.
pub fn gross_cap_exceeded(position: &PositionView, mid: Decimal, cap: Decimal) -> bool {
    cap > Decimal::ZERO && position.gross_qty() * mid >= cap
}

/// Stop price for an entry: below entry for longs, above for shorts.
pub fn stop_price(entry: Decimal, stop_bps: Decimal, is_long: bool) -> Decimal {
    let off = stop_bps / BPS;
    if is_long { entry * (Decimal::ONE - off) } else { entry * (Decimal::ONE + off) }
}

/// A non-positive `stop_bps` disables the stop; so does an unknown (zero) entry.
pub fn stop_triggered(entry: Decimal, mid: Decimal, stop_bps: Decimal, is_long: bool) -> bool {
    if stop_bps <= Decimal::ZERO || entry <= Decimal::ZERO {
        return false;
    }
    let px = stop_price(entry, stop_bps, is_long);
    if is_long { mid <= px } else { mid >= px }
}
