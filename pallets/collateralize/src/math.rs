//! Fixed-Point Lending Arithmetic
//!
//! All amounts are integer "sat" (1 unit = 1e8 sat). Prices and ratios are
//! 8-decimal fixed-point scalars carried in `u128`. The legacy deployment
//! evaluated these formulas in float64 with an explicit `+1e-7` pre-rounding
//! nudge before truncating to 4 decimals; here every formula is an exact
//! u128 rational with the same rounding points, so results agree with the
//! float path on all in-range inputs while staying bit-identical across
//! nodes.

/// Fixed-point unit: 8 decimals for prices, ratios and sat-per-unit.
pub const SCALE: u128 = 100_000_000;

/// Collateral amounts are truncated to 4 decimals (sat granularity 1e4).
pub const COLLATERAL_STEP: u128 = 10_000;

/// Threshold inflation applied on top of pure loan-to-value (1.1).
pub const PRE_LIQUIDATION_RATIO: u128 = 110_000_000;

/// Early-warning band above the liquidation price (1.3).
pub const PRICE_WARNING_RATE: u128 = 130_000_000;

const E3: u128 = 1_000;
const E12: u128 = 1_000_000_000_000;
const E15: u128 = 1_000_000_000_000_000;
const E16: u128 = 10_000_000_000_000_000;

/// Collateral (sat) that must be posted to borrow `debt` sat of the stable
/// token at `price` (collateral units per stable unit) and liquidation
/// ratio `ratio`.
///
/// Exact form of `⌊((debt/1e8) / (price·ratio) + 1e-7) · 1e4⌋ · 1e4`.
/// Returns `None` when `price · ratio` is zero (no meaningful quote).
pub fn collateral_for_debt(debt: u128, price: u128, ratio: u128) -> Option<u128> {
    let quote = price.checked_mul(ratio)?;
    if quote == 0 {
        return None;
    }

    // debt·1e12 / quote is the collateral in 1e4-sat steps; the nudge adds
    // 1/1000 of a step before truncation.
    let steps = debt
        .checked_mul(E12)?
        .checked_mul(E3)?
        .checked_add(quote)?
        .checked_div(quote.checked_mul(E3)?)?;

    steps.checked_mul(COLLATERAL_STEP)
}

/// Interest charged when a loan of `debt` sat is repaid, at stability-fee
/// ratio `fee_ratio`. Truncated to 1e4-sat granularity with the same nudge
/// as [`collateral_for_debt`].
pub fn stability_fee(debt: u128, fee_ratio: u128) -> u128 {
    let steps = debt
        .saturating_mul(fee_ratio)
        .saturating_mul(E3)
        .saturating_add(E12)
        / E15;
    steps.saturating_mul(COLLATERAL_STEP)
}

/// Liquidation price fixed at borrow time: `ratio · price · 1.1`.
pub fn liquidation_price_on_borrow(price: u128, ratio: u128) -> u128 {
    ratio
        .saturating_mul(price)
        .saturating_mul(PRE_LIQUIDATION_RATIO)
        / E16
}

/// Liquidation price after collateral is appended: the loan-to-value
/// `debt / collateral`, inflated by 1.1. Distinct from the borrow-time
/// formula: here the debt is fixed and only the collateral moved.
pub fn liquidation_price_on_append(debt: u128, collateral: u128) -> u128 {
    debt.saturating_mul(PRE_LIQUIDATION_RATIO)
        .checked_div(collateral)
        .unwrap_or(0)
}

/// Volume-weighted mean of a feed round. `None` when total volume is zero.
pub fn weighted_price(prices: &[u128], volumes: &[u128]) -> Option<u128> {
    let total_volume: u128 = volumes.iter().sum();
    if total_volume == 0 {
        return None;
    }

    let weighted: u128 = prices
        .iter()
        .zip(volumes.iter())
        .map(|(p, v)| p.saturating_mul(*v))
        .sum();

    Some(weighted / total_volume)
}

/// True when `market_price` sits strictly above the warning band, i.e.
/// `liquidation_price · 1.3 < market_price`. Exact: no division.
pub fn clears_warning_band(liquidation_price: u128, market_price: u128) -> bool {
    liquidation_price.saturating_mul(PRICE_WARNING_RATE) < market_price.saturating_mul(SCALE)
}
