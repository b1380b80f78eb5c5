//! Pure computation engine(s) for deterministic P&L logic.

use crate::domain::{Address, Decimal, MarketId, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod category;
pub mod payout;
pub mod pnl;
pub mod position_tracker;

pub use category::{CategoryAggregator, CategoryScore, OmegaRatio};
pub use payout::{payout_rate, PayoutRule};
pub use pnl::{PnlEngine, WalletPnl};
pub use position_tracker::{AmountOverflow, PositionState, PositionTracker};

/// Position identity within one wallet; `outcome_index == None` is the
/// market-level cash bucket (collateral legs of split/merge, USDC transfers).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PositionKey {
    pub market_id: MarketId,
    pub outcome_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    ResolvedWon,
    ResolvedLost,
    /// Cancelled market; every outcome paid half.
    ResolvedPartial,
    /// Cash bucket of a resolved market.
    Settled,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::ResolvedWon => "resolved_won",
            PositionStatus::ResolvedLost => "resolved_lost",
            PositionStatus::ResolvedPartial => "resolved_partial",
            PositionStatus::Settled => "settled",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "resolved_won" => Ok(PositionStatus::ResolvedWon),
            "resolved_lost" => Ok(PositionStatus::ResolvedLost),
            "resolved_partial" => Ok(PositionStatus::ResolvedPartial),
            "settled" => Ok(PositionStatus::Settled),
            other => Err(format!("unknown position status: {}", other)),
        }
    }
}

/// Net aggregation of a wallet's fills for one (market, outcome).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub wallet: Address,
    pub market_id: MarketId,
    pub outcome_index: Option<u32>,
    pub net_shares: Decimal,
    pub avg_cost: Decimal,
    pub net_cash_flow: Decimal,
    /// P&L locked in by share reductions before resolution.
    pub trading_realized: Decimal,
    pub status: PositionStatus,
    /// Set once the market resolves.
    pub realized_pnl: Option<Decimal>,
    /// Set while the market is open.
    pub unrealized_pnl: Option<Decimal>,
    pub trade_count: u64,
    pub last_activity: TimeMs,
}

impl Position {
    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }
}

/// Non-fatal findings attached to a wallet's P&L result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PnlWarning {
    /// Market has fills but no metadata row; positions are treated as open.
    UnresolvedMarketDataMissing { market_id: MarketId },
    /// Net shares went below zero without a short-sale source.
    NegativeShares {
        market_id: MarketId,
        outcome_index: Option<u32>,
        natural_key: String,
        net_shares: Decimal,
    },
    /// Amounts left the decimal range; the fill or position was skipped.
    AmountOverflow {
        market_id: MarketId,
        outcome_index: Option<u32>,
        natural_key: Option<String>,
    },
}

impl fmt::Display for PnlWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PnlWarning::UnresolvedMarketDataMissing { market_id } => {
                write!(f, "no resolution data for market {}", market_id)
            }
            PnlWarning::NegativeShares {
                market_id,
                outcome_index,
                natural_key,
                net_shares,
            } => write!(
                f,
                "net shares {} below zero in market {} outcome {:?} at {}",
                net_shares, market_id, outcome_index, natural_key
            ),
            PnlWarning::AmountOverflow {
                market_id,
                outcome_index,
                natural_key,
            } => write!(
                f,
                "decimal overflow in market {} outcome {:?} at {}",
                market_id,
                outcome_index,
                natural_key.as_deref().unwrap_or("valuation")
            ),
        }
    }
}
