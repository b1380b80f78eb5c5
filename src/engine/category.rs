//! Category aggregation and the omega ratio.

use crate::domain::{Address, Decimal, MarketCatalog, TimeMs};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use super::Position;

const UNBOUNDED: &str = "inf";

/// `sum(gains) / sum(|losses|)`, with a sentinel when there are no losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OmegaRatio {
    Finite(Decimal),
    /// Gains with zero losses.
    Unbounded,
}

impl OmegaRatio {
    /// None when there is no resolved activity on either side.
    pub fn from_sums(sum_gains: Decimal, sum_losses: Decimal) -> Option<Self> {
        let losses = sum_losses.abs();
        if losses.is_zero() {
            return sum_gains.is_positive().then_some(OmegaRatio::Unbounded);
        }
        sum_gains.checked_div(losses).map(OmegaRatio::Finite)
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, OmegaRatio::Unbounded)
    }
}

impl fmt::Display for OmegaRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OmegaRatio::Finite(v) => write!(f, "{}", v),
            OmegaRatio::Unbounded => f.write_str(UNBOUNDED),
        }
    }
}

impl FromStr for OmegaRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case(UNBOUNDED) {
            return Ok(OmegaRatio::Unbounded);
        }
        Decimal::from_str_canonical(s)
            .map(OmegaRatio::Finite)
            .map_err(|e| format!("invalid omega ratio {:?}: {}", s, e))
    }
}

impl Serialize for OmegaRatio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OmegaRatio::Finite(v) => v.serialize(serializer),
            OmegaRatio::Unbounded => serializer.serialize_str(UNBOUNDED),
        }
    }
}

impl<'de> Deserialize<'de> for OmegaRatio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(Decimal),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(OmegaRatio::Finite(v)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub wallet: Address,
    pub category: String,
    pub sum_gains: Decimal,
    /// Absolute value of the summed losses.
    pub sum_losses: Decimal,
    pub omega_ratio: Option<OmegaRatio>,
    pub trade_count: u64,
    pub last_activity: TimeMs,
}

#[derive(Debug, Default)]
struct Accumulator {
    sum_gains: Decimal,
    sum_losses: Decimal,
    trade_count: u64,
    last_activity: TimeMs,
}

/// Joins resolved positions to the category mapping in one pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryAggregator;

impl CategoryAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Score `positions` per category, ordered by category name.
    ///
    /// Open positions and markets without a category are skipped. Each
    /// position's realized P&L counts as a gain or a loss split at zero.
    pub fn aggregate(
        &self,
        wallet: &Address,
        positions: &[Position],
        catalog: &MarketCatalog,
    ) -> Vec<CategoryScore> {
        let mut by_category: BTreeMap<&str, Accumulator> = BTreeMap::new();

        for position in positions.iter().filter(|p| &p.wallet == wallet) {
            let Some(realized) = position.realized_pnl.filter(|_| position.is_resolved()) else {
                continue;
            };
            let Some(category) = catalog.category(&position.market_id) else {
                continue;
            };

            let acc = by_category.entry(category).or_default();
            let summed = if realized.is_positive() {
                acc.sum_gains.checked_add(realized).map(|v| acc.sum_gains = v)
            } else {
                acc.sum_losses.checked_add(realized.abs()).map(|v| acc.sum_losses = v)
            };
            if summed.is_none() {
                warn!(
                    wallet = %wallet,
                    category,
                    market = %position.market_id,
                    "Category sum overflowed, skipping position"
                );
                continue;
            }
            acc.trade_count += position.trade_count;
            if position.last_activity > acc.last_activity {
                acc.last_activity = position.last_activity;
            }
        }

        by_category
            .into_iter()
            .map(|(category, acc)| CategoryScore {
                wallet: wallet.clone(),
                category: category.to_string(),
                omega_ratio: OmegaRatio::from_sums(acc.sum_gains, acc.sum_losses),
                sum_gains: acc.sum_gains,
                sum_losses: acc.sum_losses,
                trade_count: acc.trade_count,
                last_activity: acc.last_activity,
            })
            .collect()
    }
}
