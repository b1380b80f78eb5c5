//! Canonical fill: the single normalized record shape every upstream event
//! is reduced to before it reaches the store.

use crate::domain::{Address, Decimal, MarketId, Side, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream mechanism that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    /// Order-book match on an exchange.
    OrderBook,
    /// Conditional-token mint/redeem/transfer.
    CtfToken,
    /// USDC cash movement.
    CashLeg,
    /// Token movement produced by an automated liquidity/conversion mechanism.
    InternalTransfer,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::OrderBook => "order_book",
            SourceTag::CtfToken => "ctf_token",
            SourceTag::CashLeg => "cash_leg",
            SourceTag::InternalTransfer => "internal_transfer",
        }
    }

    /// Whether records with this tag carry user-initiated economics.
    pub fn counts_toward_pnl(&self) -> bool {
        !matches!(self, SourceTag::InternalTransfer)
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order_book" => Ok(SourceTag::OrderBook),
            "ctf_token" => Ok(SourceTag::CtfToken),
            "cash_leg" => Ok(SourceTag::CashLeg),
            "internal_transfer" => Ok(SourceTag::InternalTransfer),
            other => Err(format!("unknown source tag: {}", other)),
        }
    }
}

/// One normalized trade/transfer record, unique by (`wallet`, `natural_key`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalFill {
    /// Source-assigned id (derived legs carry a `:n` suffix).
    pub natural_key: String,
    pub wallet: Address,
    pub market_id: MarketId,
    /// None for market-level cash legs.
    pub outcome_index: Option<u32>,
    pub side: Side,
    pub price: Decimal,
    /// Unsigned share quantity; zero for cash legs.
    pub size: Decimal,
    /// Unsigned USD value of the record.
    pub usd_value: Decimal,
    /// Signed cash from the wallet's perspective (negative = paid out).
    pub net_cash_flow: Decimal,
    pub source: SourceTag,
    pub event_time: TimeMs,
}

impl CanonicalFill {
    /// Signed share delta: `+size` for buys, `-size` for sells.
    pub fn signed_shares(&self) -> Decimal {
        match self.side {
            Side::Buy => self.size,
            Side::Sell => -self.size,
        }
    }
}
