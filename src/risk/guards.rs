use crate::models::Position;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Buy limit sits this far above the ask for a fast fill
pub const BUY_LIMIT_MARKUP: f64 = 1.002;
/// Sell limit sits this far below the bid
pub const SELL_LIMIT_MARKDOWN: f64 = 0.998;

/// Limits applied before any order is placed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max % the ask may sit above the signal price
    pub anti_chase_pct: f64,
    pub family_protection_pct: f64,
    pub quick_profit_pct: f64,
    /// USD per entry
    pub position_notional: f64,
    pub max_positions: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            anti_chase_pct: 5.0,
            family_protection_pct: 10.0,
            quick_profit_pct: 3.0,
            position_notional: 50_000.0,
            max_positions: 5,
        }
    }
}

/// Why an order was not placed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Blocked {
    #[error("ask {ask:.4} is {over_pct:.2}% above signal price {reference:.4}")]
    Chasing {
        ask: f64,
        reference: f64,
        over_pct: f64,
    },
    #[error("notional {notional:.2} buys less than one share at {price:.4}")]
    BelowOneShare { notional: f64, price: f64 },
    #[error("{held} positions held or pending, limit {max}")]
    PositionCap { held: usize, max: usize },
    #[error("unrealized P&L {pnl:.2} is not positive")]
    NotProfitable { pnl: f64 },
    #[error("sell limit {limit} does not clear entry {entry:.4}")]
    SellBelowEntry { limit: Decimal, entry: f64 },
    #[error("invalid price {0}")]
    InvalidPrice(f64),
}

/// Reject entries after the move already ran past the signal
pub fn check_anti_chase(ask: f64, reference: f64, tolerance_pct: f64) -> Result<(), Blocked> {
    if reference <= 0.0 || !reference.is_finite() {
        return Err(Blocked::InvalidPrice(reference));
    }
    let over_pct = (ask - reference) / reference * 100.0;
    if over_pct > tolerance_pct {
        return Err(Blocked::Chasing {
            ask,
            reference,
            over_pct,
        });
    }
    Ok(())
}

/// Whole shares affordable with `notional` at `price`
pub fn position_size(notional: f64, price: f64) -> Result<u64, Blocked> {
    if price <= 0.0 || !price.is_finite() {
        return Err(Blocked::InvalidPrice(price));
    }
    let shares = (notional / price).floor();
    if shares < 1.0 {
        return Err(Blocked::BelowOneShare { notional, price });
    }
    Ok(shares as u64)
}

pub fn check_position_cap(held: usize, pending: usize, max: usize) -> Result<(), Blocked> {
    let total = held + pending;
    if total >= max {
        return Err(Blocked::PositionCap { held: total, max });
    }
    Ok(())
}

/// A sell is only ever considered for a position in profit
pub fn check_profitable(position: &Position) -> Result<(), Blocked> {
    if position.unrealized_pnl > 0.0 && position.unrealized_pnl_percent > 0.0 {
        Ok(())
    } else {
        Err(Blocked::NotProfitable {
            pnl: position.unrealized_pnl,
        })
    }
}

/// The sell limit itself must lock in a gain
pub fn check_sell_clears_entry(limit: Decimal, entry_price: f64) -> Result<(), Blocked> {
    let entry = Decimal::from_f64(entry_price).ok_or(Blocked::InvalidPrice(entry_price))?;
    if limit <= entry {
        return Err(Blocked::SellBelowEntry {
            limit,
            entry: entry_price,
        });
    }
    Ok(())
}

/// Round to a valid tick: cents at or above $1, four places below
pub fn round_limit_price(price: f64) -> Result<Decimal, Blocked> {
    if price <= 0.0 || !price.is_finite() {
        return Err(Blocked::InvalidPrice(price));
    }
    let value = Decimal::from_f64(price).ok_or(Blocked::InvalidPrice(price))?;
    let places = if value >= Decimal::ONE { 2 } else { 4 };
    Ok(value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero))
}

pub fn buy_limit_price(ask: f64) -> Result<Decimal, Blocked> {
    round_limit_price(ask * BUY_LIMIT_MARKUP)
}

pub fn sell_limit_price(bid: f64) -> Result<Decimal, Blocked> {
    round_limit_price(bid * SELL_LIMIT_MARKDOWN)
}

pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}
