// src/market/pricing.rs
//
// Bonding-curve pricing. Pure functions over ledger-reported state
// (supply, divisor, freebie counts). Used for display quotes and to size
// allowance requests; the ledger's own event is always the realized price.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Price floor of every unit, in payment-mint base units.
pub const BASE_UNIT_PRICE: u64 = 100_000;

/// Quadratic term coefficient: `CURVE_COEFFICIENT * supply^2 / divisor`.
pub const CURVE_COEFFICIENT: u64 = 10_000;

/// Creator fee charged on top of buys and deducted from sells.
pub const CREATOR_FEE_BPS: u64 = 250;

/// Platform fee charged on top of buys and deducted from sells.
pub const PLATFORM_FEE_BPS: u64 = 250;

/// Freebie units liquidate at half the regular sell payout.
pub const FREEBIE_SELL_DISCOUNT_BPS: u64 = 5_000;

const BPS_DENOMINATOR: u64 = 10_000;

// ============================================================================
// QUOTES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyQuote {
    pub amount: u64,
    pub curve_cost: u64,
    pub creator_fee: u64,
    pub platform_fee: u64,
    pub total: u64, // curve_cost + fees, what the buyer pays
}

impl BuyQuote {
    pub fn free(amount: u64) -> Self {
        Self {
            amount,
            curve_cost: 0,
            creator_fee: 0,
            platform_fee: 0,
            total: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellQuote {
    pub amount: u64,
    pub gross: u64, // Leaves the reward pool
    pub creator_fee: u64,
    pub platform_fee: u64,
    pub payout: u64, // gross - fees, what the seller receives
}

impl SellQuote {
    fn zero() -> Self {
        Self {
            amount: 0,
            gross: 0,
            creator_fee: 0,
            platform_fee: 0,
            payout: 0,
        }
    }
}

// ============================================================================
// CURVE
// ============================================================================

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Sum of k^2 for k in 1..=m, `None` on overflow.
fn sum_of_squares_upto(m: u128) -> Option<u128> {
    m.checked_mul(m + 1)
        .and_then(|v| v.checked_mul(2 * m + 1))
        .map(|v| v / 6)
}

fn fee(amount: u64, bps: u64) -> u64 {
    saturate(amount as u128 * bps as u128 / BPS_DENOMINATOR as u128)
}

/// Raw curve cost of `amount` successive units starting at `supply`,
/// before fees. Single floor over the whole batch.
pub fn curve_cost(supply: u64, divisor: u64, amount: u64) -> u64 {
    if amount == 0 {
        return 0;
    }
    let divisor = divisor.max(1) as u128;
    let first = supply as u128;
    let last = first + amount as u128 - 1;
    let Some(upto_last) = sum_of_squares_upto(last) else {
        return u64::MAX;
    };
    let below = if first == 0 {
        0
    } else {
        sum_of_squares_upto(first - 1).unwrap_or(upto_last)
    };
    let squares = upto_last - below;

    let base = BASE_UNIT_PRICE as u128 * amount as u128;
    let quadratic = squares.saturating_mul(CURVE_COEFFICIENT as u128) / divisor;
    saturate(base.saturating_add(quadratic))
}

/// Curve price of the next unit at `supply`. Always > 0.
pub fn unit_price(supply: u64, divisor: u64) -> u64 {
    curve_cost(supply, divisor, 1)
}

/// Total a buyer pays for `amount` units at `supply`. Price moves within
/// the batch, so this is not `unit_price * amount`.
pub fn buy_total(supply: u64, divisor: u64, amount: u64) -> BuyQuote {
    let curve = curve_cost(supply, divisor, amount);
    let creator_fee = fee(curve, CREATOR_FEE_BPS);
    let platform_fee = fee(curve, PLATFORM_FEE_BPS);
    BuyQuote {
        amount,
        curve_cost: curve,
        creator_fee,
        platform_fee,
        total: curve.saturating_add(creator_fee).saturating_add(platform_fee),
    }
}

fn sell_from_gross(amount: u64, gross: u64) -> SellQuote {
    let creator_fee = fee(gross, CREATOR_FEE_BPS);
    let platform_fee = fee(gross, PLATFORM_FEE_BPS);
    SellQuote {
        amount,
        gross,
        creator_fee,
        platform_fee,
        payout: gross.saturating_sub(creator_fee).saturating_sub(platform_fee),
    }
}

/// Payout for selling `amount` paid units back down the curve from `supply`.
/// `None` when the curve cannot cover the amount.
pub fn sell_total(supply: u64, divisor: u64, amount: u64) -> Option<SellQuote> {
    if amount > supply {
        return None;
    }
    if amount == 0 {
        return Some(SellQuote::zero());
    }
    let gross = curve_cost(supply - amount, divisor, amount);
    Some(sell_from_gross(amount, gross))
}

/// Sell quote for a specific holder: paid units are liquidated first at the
/// regular curve, then freebie units at the discounted freebie price.
pub fn holder_sell_total(
    supply: u64,
    divisor: u64,
    amount: u64,
    balance: u64,
    freebie_balance: u64,
) -> Option<SellQuote> {
    if amount > balance || amount > supply {
        return None;
    }
    let paid_held = balance.saturating_sub(freebie_balance);
    let paid = amount.min(paid_held);
    let freebie = amount - paid;

    let paid_gross = curve_cost(supply - paid, divisor, paid);
    let freebie_gross = curve_cost(supply - paid - freebie, divisor, freebie);
    let discounted = fee(freebie_gross, FREEBIE_SELL_DISCOUNT_BPS);
    Some(sell_from_gross(amount, paid_gross.saturating_add(discounted)))
}

/// Payout for liquidating one freebie-acquired unit at `supply`.
pub fn freebie_sell_price(supply: u64, divisor: u64) -> u64 {
    holder_sell_total(supply, divisor, 1, 1, 1)
        .map(|q| q.payout)
        .unwrap_or(0)
}

/// Gross owed by the reward pool if every circulating unit were sold back,
/// with outstanding freebie units liquidated last at the freebie price.
pub fn liability(supply: u64, divisor: u64, freebies_outstanding: u64) -> u64 {
    let freebies = freebies_outstanding.min(supply);
    holder_sell_total(supply, divisor, supply, supply, freebies)
        .map(|q| q.gross)
        .unwrap_or(0)
}

pub fn can_claim_freebie(remaining_quota: u32, has_claimed: bool) -> bool {
    remaining_quota > 0 && !has_claimed
}

/// Applies a slippage tolerance upward (for a buy's maximum cost).
pub fn with_slippage_up(amount: u64, slippage_bps: u32) -> u64 {
    saturate(amount as u128 * (BPS_DENOMINATOR as u128 + slippage_bps as u128) / BPS_DENOMINATOR as u128)
}

/// Applies a slippage tolerance downward (for a sell's minimum payout).
pub fn with_slippage_down(amount: u64, slippage_bps: u32) -> u64 {
    let keep = BPS_DENOMINATOR.saturating_sub(slippage_bps as u64);
    fee(amount, keep)
}

// ============================================================================
// TESTS
// ============================================================================
