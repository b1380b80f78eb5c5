use crate::domain::{CanonicalFill, Decimal, TimeMs};
use thiserror::Error;

/// Current share state of one (market, outcome) position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PositionState {
    /// Net shares held: positive = long, negative = short, zero = flat.
    pub net_shares: Decimal,

    /// Weighted average cost per share (only meaningful when net_shares != 0).
    pub avg_cost: Decimal,
}

impl PositionState {
    pub fn new() -> Self {
        Self {
            net_shares: Decimal::zero(),
            avg_cost: Decimal::zero(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.net_shares.is_zero()
    }

    pub fn is_short(&self) -> bool {
        self.net_shares.is_negative()
    }
}

/// Accumulates one position's shares, cost basis and cash from its fills.
///
/// Fills must arrive in deterministic order (event_time, natural_key).
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    pub state: PositionState,
    net_cash_flow: Decimal,
    trading_realized: Decimal,
    trade_count: u64,
    last_activity: TimeMs,
}

/// A fill whose amounts would overflow the decimal range of its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decimal overflow while applying fill")]
pub struct AmountOverflow;

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single fill.
    ///
    /// Returns true when this fill took net shares from zero-or-long to short,
    /// which has no short-sale semantics upstream and is reported as a
    /// data-quality warning by the caller. On overflow the tracker is left
    /// exactly as it was before the call.
    pub fn process_fill(&mut self, fill: &CanonicalFill) -> Result<bool, AmountOverflow> {
        let mut next = self.clone();
        let went_negative = next.apply(fill).ok_or(AmountOverflow)?;
        *self = next;
        Ok(went_negative)
    }

    fn apply(&mut self, fill: &CanonicalFill) -> Option<bool> {
        self.net_cash_flow = self.net_cash_flow.checked_add(fill.net_cash_flow)?;
        self.trade_count += 1;
        if fill.event_time > self.last_activity {
            self.last_activity = fill.event_time;
        }

        let signed_qty = fill.signed_shares();
        if signed_qty.is_zero() {
            return Some(false);
        }

        let old_size = self.state.net_shares;
        let new_size = old_size.checked_add(signed_qty)?;

        if self.is_flip(old_size, new_size) {
            self.handle_flip(fill.price, old_size, new_size)?;
        } else if old_size.is_zero() && !new_size.is_zero() {
            self.handle_open(fill.price, new_size);
        } else if !old_size.is_zero() && new_size.is_zero() {
            self.handle_close(fill.price, old_size)?;
        } else {
            self.handle_adjustment(fill.price, old_size, new_size)?;
        }

        Some(new_size.is_negative() && !old_size.is_negative())
    }

    /// Check if this is a flip (crossing from long to short or vice versa).
    fn is_flip(&self, old_size: Decimal, new_size: Decimal) -> bool {
        if old_size.is_zero() || new_size.is_zero() {
            return false;
        }
        old_size.is_positive() != new_size.is_positive()
    }

    fn handle_open(&mut self, price: Decimal, new_size: Decimal) {
        self.state.net_shares = new_size;
        self.state.avg_cost = price;
    }

    fn handle_close(&mut self, price: Decimal, old_size: Decimal) -> Option<()> {
        self.realize(price, old_size)?;
        self.state = PositionState::new();
        Some(())
    }

    /// Close the old side in full, then open the remainder at the fill price.
    fn handle_flip(&mut self, price: Decimal, old_size: Decimal, new_size: Decimal) -> Option<()> {
        self.realize(price, old_size)?;
        self.state.net_shares = new_size;
        self.state.avg_cost = price;
        Some(())
    }

    fn handle_adjustment(
        &mut self,
        price: Decimal,
        old_size: Decimal,
        new_size: Decimal,
    ) -> Option<()> {
        let old_abs = old_size.abs();
        let new_abs = new_size.abs();

        if new_abs > old_abs {
            let added_qty = new_abs.checked_sub(old_abs)?;
            let old_value = old_abs.checked_mul(self.state.avg_cost)?;
            let new_value = added_qty.checked_mul(price)?;
            self.state.avg_cost = old_value.checked_add(new_value)?.checked_div(new_abs)?;
        } else {
            // Same sign on both sides, so the difference is the closed quantity.
            let signed_reduced = old_size.checked_sub(new_size)?;
            self.realize(price, signed_reduced)?;
        }

        self.state.net_shares = new_size;
        Some(())
    }

    /// Book trading P&L for closing `signed_qty` (sign of the side being
    /// closed) at `price` against the average cost.
    fn realize(&mut self, price: Decimal, signed_qty: Decimal) -> Option<()> {
        let per_share = price.checked_sub(self.state.avg_cost)?;
        let booked = signed_qty.checked_mul(per_share)?;
        self.trading_realized = self.trading_realized.checked_add(booked)?;
        Some(())
    }

    pub fn net_shares(&self) -> Decimal {
        self.state.net_shares
    }

    pub fn avg_cost(&self) -> Decimal {
        self.state.avg_cost
    }

    pub fn net_cash_flow(&self) -> Decimal {
        self.net_cash_flow
    }

    pub fn trading_realized(&self) -> Decimal {
        self.trading_realized
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    pub fn last_activity(&self) -> TimeMs {
        self.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, MarketId, Side, SourceTag};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn fill(key: &str, side: Side, price: &str, size: &str, time_ms: i64) -> CanonicalFill {
        let price = d(price);
        let size = d(size);
        CanonicalFill {
            natural_key: key.to_string(),
            wallet: Address::new("0x1"),
            market_id: MarketId::new("0xm"),
            outcome_index: Some(0),
            side,
            price,
            size,
            usd_value: price * size,
            net_cash_flow: match side {
                Side::Buy => -(price * size),
                Side::Sell => price * size,
            },
            source: SourceTag::OrderBook,
            event_time: TimeMs::new(time_ms),
        }
    }

    #[test]
    fn test_open_and_increase_weights_cost() {
        let mut tracker = PositionTracker::new();
        assert!(!tracker.process_fill(&fill("a", Side::Buy, "0.4", "10", 1)).unwrap());
        assert!(!tracker.process_fill(&fill("b", Side::Buy, "0.6", "10", 2)).unwrap());

        assert_eq!(tracker.net_shares(), d("20"));
        assert_eq!(tracker.avg_cost(), d("0.5"));
        assert_eq!(tracker.net_cash_flow(), d("-10"));
        assert_eq!(tracker.trade_count(), 2);
        assert_eq!(tracker.last_activity(), TimeMs::new(2));
    }

    #[test]
    fn test_partial_reduce_realizes_against_avg_cost() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill("a", Side::Buy, "0.4", "10", 1)).unwrap();
        tracker.process_fill(&fill("b", Side::Sell, "0.7", "4", 2)).unwrap();

        assert_eq!(tracker.net_shares(), d("6"));
        assert_eq!(tracker.avg_cost(), d("0.4"));
        assert_eq!(tracker.trading_realized(), d("1.2"));
    }

    #[test]
    fn test_close_resets_state() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill("a", Side::Buy, "0.4", "10", 1)).unwrap();
        tracker.process_fill(&fill("b", Side::Sell, "0.5", "10", 2)).unwrap();

        assert!(tracker.state.is_flat());
        assert_eq!(tracker.avg_cost(), Decimal::zero());
        assert_eq!(tracker.trading_realized(), d("1"));
        assert_eq!(tracker.net_cash_flow(), d("1"));
    }

    #[test]
    fn test_flip_to_short_is_flagged_and_resets_cost() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill("a", Side::Buy, "0.4", "10", 1)).unwrap();
        let went_negative = tracker.process_fill(&fill("b", Side::Sell, "0.6", "15", 2)).unwrap();

        assert!(went_negative);
        assert!(tracker.state.is_short());
        assert_eq!(tracker.net_shares(), d("-5"));
        assert_eq!(tracker.avg_cost(), d("0.6"));
        assert_eq!(tracker.trading_realized(), d("2"));
    }

    #[test]
    fn test_short_cover_realizes_inverted() {
        let mut tracker = PositionTracker::new();
        assert!(tracker.process_fill(&fill("a", Side::Sell, "0.6", "10", 1)).unwrap());
        assert!(!tracker.process_fill(&fill("b", Side::Buy, "0.5", "4", 2)).unwrap());

        assert_eq!(tracker.net_shares(), d("-6"));
        assert_eq!(tracker.trading_realized(), d("0.4"));
    }

    #[test]
    fn test_cash_only_fill_touches_cash_not_shares() {
        let mut tracker = PositionTracker::new();
        let mut cash = fill("c", Side::Buy, "0", "0", 5);
        cash.net_cash_flow = d("12.5");
        cash.source = SourceTag::CashLeg;

        assert!(!tracker.process_fill(&cash).unwrap());
        assert!(tracker.state.is_flat());
        assert_eq!(tracker.net_cash_flow(), d("12.5"));
        assert_eq!(tracker.trade_count(), 1);
    }

    #[test]
    fn test_overflowing_fill_is_rejected_and_leaves_state() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill("a", Side::Buy, "0.5", "10", 1)).unwrap();
        let before = (tracker.net_shares(), tracker.net_cash_flow(), tracker.trade_count());

        let mut huge = fill("b", Side::Buy, "0", "0", 2);
        huge.size = Decimal::from(rust_decimal::Decimal::MAX);
        huge.net_cash_flow = -Decimal::from(rust_decimal::Decimal::MAX);
        assert_eq!(tracker.process_fill(&huge), Err(AmountOverflow));

        assert_eq!(
            (tracker.net_shares(), tracker.net_cash_flow(), tracker.trade_count()),
            before
        );
        assert_eq!(tracker.last_activity(), TimeMs::new(1));
    }
}
