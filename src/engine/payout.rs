//! Payout rules for resolved markets.

use crate::domain::Decimal;

/// Classification of a market resolution's payout numerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutRule {
    /// All numerators equal and nonzero: every outcome pays half.
    Cancelled,
    /// Exactly one nonzero numerator.
    Winner(u32),
    /// Anything else pays nothing.
    NoPayout,
}

impl PayoutRule {
    pub fn classify(numerators: &[u64]) -> Self {
        let nonzero: Vec<usize> = numerators
            .iter()
            .enumerate()
            .filter(|(_, n)| **n != 0)
            .map(|(i, _)| i)
            .collect();

        if numerators.len() >= 2 && nonzero.len() == numerators.len() {
            let first = numerators[0];
            if numerators.iter().all(|n| *n == first) {
                return PayoutRule::Cancelled;
            }
        }
        match nonzero.as_slice() {
            [winner] => u32::try_from(*winner)
                .map(PayoutRule::Winner)
                .unwrap_or(PayoutRule::NoPayout),
            _ => PayoutRule::NoPayout,
        }
    }

    /// Fraction of notional one share of `outcome_index` pays.
    pub fn rate(&self, outcome_index: u32) -> Decimal {
        match self {
            PayoutRule::Cancelled => Decimal::half(),
            PayoutRule::Winner(w) if *w == outcome_index => Decimal::one(),
            PayoutRule::Winner(_) | PayoutRule::NoPayout => Decimal::zero(),
        }
    }
}

/// Payout rate for one outcome of a resolved market.
pub fn payout_rate(numerators: &[u64], outcome_index: u32) -> Decimal {
    PayoutRule::classify(numerators).rate(outcome_index)
}
