//! Event adapter: raw upstream events to canonical fills.
//!
//! Pure transform, no I/O. The source tag assigned here decides whether a
//! record reaches P&L accumulation at all, so tagging is strict.

use crate::domain::{Address, CanonicalFill, Decimal, MarketId, RawEvent, Side, SourceTag, TimeMs};
use std::collections::HashSet;
use thiserror::Error;

/// Contracts whose token movements are liquidity/conversion mechanics rather
/// than user trades (exchanges settle through trade events already).
pub const INTERNAL_MECHANISM_ADDRESSES: [&str; 5] = [
    "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e", // CTF exchange
    "0xc5d563a36ae78145c45a50134d48a1215220f80a", // neg-risk exchange
    "0xd91e80cf2e7be2e162c6513ced06f1dd0da35296", // neg-risk adapter
    "0x78769d50be1763ed1ca0d5e878d93f05aabff29e",
    "0xa5ef39c3d3e10d0b270233af41cac69796b12966",
];

const DEFAULT_OUTCOME_COUNT: u32 = 2;
/// Upper bound on outcomes a split/merge may fan out to.
pub const MAX_OUTCOMES: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed event {event_id}: {reason}")]
pub struct MalformedEvent {
    pub event_id: String,
    pub reason: String,
}

impl MalformedEvent {
    fn new(raw: &RawEvent, reason: impl Into<String>) -> Self {
        Self {
            event_id: raw.display_id().to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventAdapter {
    internal_addresses: HashSet<Address>,
    /// USD paid out per share on full resolution (mint/merge cash legs).
    notional_per_share: Decimal,
}

impl Default for EventAdapter {
    fn default() -> Self {
        Self::new(
            INTERNAL_MECHANISM_ADDRESSES.iter().map(|a| Address::new(*a)),
            Decimal::one(),
        )
    }
}

/// Fields every event kind requires.
struct Common {
    id: String,
    market_id: MarketId,
    event_time: TimeMs,
}

impl EventAdapter {
    pub fn new(internal: impl IntoIterator<Item = Address>, notional_per_share: Decimal) -> Self {
        Self {
            internal_addresses: internal.into_iter().collect(),
            notional_per_share,
        }
    }

    pub fn is_internal(&self, addr: &Address) -> bool {
        self.internal_addresses.contains(addr)
    }

    /// Normalize one raw event observed for `wallet` into zero or more fills.
    pub fn normalize(
        &self,
        wallet: &Address,
        raw: &RawEvent,
    ) -> Result<Vec<CanonicalFill>, MalformedEvent> {
        let kind = raw
            .kind
            .as_deref()
            .map(|k| k.trim().to_ascii_lowercase())
            .ok_or_else(|| MalformedEvent::new(raw, "missing kind"))?;
        let common = self.common(raw)?;

        match kind.as_str() {
            "trade" => self.trade(wallet, raw, common),
            "split" => self.split_or_merge(wallet, raw, common, Side::Buy),
            "merge" => self.split_or_merge(wallet, raw, common, Side::Sell),
            "redeem" => self.redeem(wallet, raw, common),
            "transfer" => self.token_transfer(wallet, raw, common, false),
            "neg_risk_conversion" => self.token_transfer(wallet, raw, common, true),
            "usdc_transfer" => self.usdc_transfer(wallet, raw, common),
            other => Err(MalformedEvent::new(raw, format!("unknown kind {}", other))),
        }
    }

    fn common(&self, raw: &RawEvent) -> Result<Common, MalformedEvent> {
        let id = raw
            .id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MalformedEvent::new(raw, "missing id"))?
            .to_string();
        let market_id = raw
            .condition_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(MarketId::new)
            .ok_or_else(|| MalformedEvent::new(raw, "missing condition_id"))?;
        let timestamp = raw
            .timestamp
            .ok_or_else(|| MalformedEvent::new(raw, "missing timestamp"))?;
        if timestamp < 0 {
            return Err(MalformedEvent::new(raw, "negative timestamp"));
        }
        Ok(Common {
            id,
            market_id,
            event_time: TimeMs::from_secs(timestamp),
        })
    }

    fn trade(
        &self,
        wallet: &Address,
        raw: &RawEvent,
        common: Common,
    ) -> Result<Vec<CanonicalFill>, MalformedEvent> {
        let side = raw
            .side
            .as_deref()
            .and_then(Side::parse)
            .ok_or_else(|| MalformedEvent::new(raw, "missing or invalid side"))?;
        let outcome = required_outcome(raw)?;
        let price = non_negative(raw, "price", raw.price.as_deref())?;
        if price > Decimal::one() {
            return Err(MalformedEvent::new(raw, format!("price {} above 1", price)));
        }
        let size = non_negative(raw, "size", raw.size.as_deref())?;
        let usd_value = price * size;
        let net_cash_flow = match side {
            Side::Buy => -usd_value,
            Side::Sell => usd_value,
        };

        Ok(vec![CanonicalFill {
            natural_key: common.id,
            wallet: wallet.clone(),
            market_id: common.market_id,
            outcome_index: Some(outcome),
            side,
            price,
            size,
            usd_value,
            net_cash_flow,
            source: SourceTag::OrderBook,
            event_time: common.event_time,
        }])
    }

    /// Split mints every outcome for collateral; merge burns them back.
    fn split_or_merge(
        &self,
        wallet: &Address,
        raw: &RawEvent,
        common: Common,
        side: Side,
    ) -> Result<Vec<CanonicalFill>, MalformedEvent> {
        let size = non_negative(raw, "size", raw.size.as_deref())?;
        let outcome_count = raw.outcome_count.unwrap_or(DEFAULT_OUTCOME_COUNT);
        if outcome_count < 2 {
            return Err(MalformedEvent::new(raw, "outcome_count below 2"));
        }
        if outcome_count > MAX_OUTCOMES {
            return Err(MalformedEvent::new(
                raw,
                format!("outcome_count {} above {}", outcome_count, MAX_OUTCOMES),
            ));
        }

        let mut out = Vec::with_capacity(outcome_count as usize + 1);
        for outcome in 0..outcome_count {
            out.push(CanonicalFill {
                natural_key: format!("{}:{}", common.id, outcome),
                wallet: wallet.clone(),
                market_id: common.market_id.clone(),
                outcome_index: Some(outcome),
                side,
                price: Decimal::zero(),
                size,
                usd_value: Decimal::zero(),
                net_cash_flow: Decimal::zero(),
                source: SourceTag::CtfToken,
                event_time: common.event_time,
            });
        }

        let collateral = size
            .checked_mul(self.notional_per_share)
            .ok_or_else(|| MalformedEvent::new(raw, "collateral overflows"))?;
        // Minting shares costs collateral; merging returns it.
        let (cash_side, net_cash_flow) = match side {
            Side::Buy => (Side::Sell, -collateral),
            Side::Sell => (Side::Buy, collateral),
        };
        out.push(cash_leg(
            format!("{}:cash", common.id),
            wallet,
            common.market_id,
            cash_side,
            collateral,
            net_cash_flow,
            common.event_time,
        ));
        Ok(out)
    }

    fn redeem(
        &self,
        wallet: &Address,
        raw: &RawEvent,
        common: Common,
    ) -> Result<Vec<CanonicalFill>, MalformedEvent> {
        let outcome = required_outcome(raw)?;
        let size = non_negative(raw, "size", raw.size.as_deref())?;
        let payout = non_negative(raw, "usdc_amount", raw.usdc_amount.as_deref())?;

        // The payout belongs to the redeemed outcome, not the market cash bucket.
        let mut payout_leg = cash_leg(
            format!("{}:cash", common.id),
            wallet,
            common.market_id.clone(),
            Side::Buy,
            payout,
            payout,
            common.event_time,
        );
        payout_leg.outcome_index = Some(outcome);

        Ok(vec![
            CanonicalFill {
                natural_key: format!("{}:{}", common.id, outcome),
                wallet: wallet.clone(),
                market_id: common.market_id.clone(),
                outcome_index: Some(outcome),
                side: Side::Sell,
                price: Decimal::zero(),
                size,
                usd_value: Decimal::zero(),
                net_cash_flow: Decimal::zero(),
                source: SourceTag::CtfToken,
                event_time: common.event_time,
            },
            payout_leg,
        ])
    }

    fn token_transfer(
        &self,
        wallet: &Address,
        raw: &RawEvent,
        common: Common,
        always_internal: bool,
    ) -> Result<Vec<CanonicalFill>, MalformedEvent> {
        let outcome = required_outcome(raw)?;
        let size = non_negative(raw, "size", raw.size.as_deref())?;
        let (side, counterparty) = direction(wallet, raw)?;

        let internal = always_internal
            || counterparty
                .as_ref()
                .map(|c| self.is_internal(c))
                .unwrap_or(false);
        let source = if internal {
            SourceTag::InternalTransfer
        } else {
            SourceTag::CtfToken
        };

        Ok(vec![CanonicalFill {
            natural_key: common.id,
            wallet: wallet.clone(),
            market_id: common.market_id,
            outcome_index: Some(outcome),
            side,
            price: Decimal::zero(),
            size,
            usd_value: Decimal::zero(),
            net_cash_flow: Decimal::zero(),
            source,
            event_time: common.event_time,
        }])
    }

    fn usdc_transfer(
        &self,
        wallet: &Address,
        raw: &RawEvent,
        common: Common,
    ) -> Result<Vec<CanonicalFill>, MalformedEvent> {
        let amount = non_negative(raw, "usdc_amount", raw.usdc_amount.as_deref())?;
        let (side, _) = direction(wallet, raw)?;
        let net_cash_flow = match side {
            Side::Buy => amount,
            Side::Sell => -amount,
        };
        let mut leg = cash_leg(
            common.id,
            wallet,
            common.market_id,
            side,
            amount,
            net_cash_flow,
            common.event_time,
        );
        leg.outcome_index = raw.outcome_index;
        Ok(vec![leg])
    }
}

fn cash_leg(
    natural_key: String,
    wallet: &Address,
    market_id: MarketId,
    side: Side,
    usd_value: Decimal,
    net_cash_flow: Decimal,
    event_time: TimeMs,
) -> CanonicalFill {
    CanonicalFill {
        natural_key,
        wallet: wallet.clone(),
        market_id,
        outcome_index: None,
        side,
        price: Decimal::zero(),
        size: Decimal::zero(),
        usd_value,
        net_cash_flow,
        source: SourceTag::CashLeg,
        event_time,
    }
}

fn required_outcome(raw: &RawEvent) -> Result<u32, MalformedEvent> {
    raw.outcome_index
        .ok_or_else(|| MalformedEvent::new(raw, "missing outcome_index"))
}

fn non_negative(
    raw: &RawEvent,
    field: &str,
    value: Option<&str>,
) -> Result<Decimal, MalformedEvent> {
    let value = value.ok_or_else(|| MalformedEvent::new(raw, format!("missing {}", field)))?;
    let parsed = Decimal::from_str_canonical(value)
        .map_err(|e| MalformedEvent::new(raw, format!("invalid {}: {}", field, e)))?;
    if parsed.is_negative() {
        return Err(MalformedEvent::new(raw, format!("negative {}", field)));
    }
    Ok(parsed)
}

/// Buy when tokens/cash arrive at the wallet, sell when they leave it.
fn direction(
    wallet: &Address,
    raw: &RawEvent,
) -> Result<(Side, Option<Address>), MalformedEvent> {
    let from = raw.from.as_deref().map(Address::new);
    let to = raw.to.as_deref().map(Address::new);

    match (from, to) {
        (from, Some(to)) if &to == wallet => Ok((Side::Buy, from)),
        (Some(from), to) if &from == wallet => Ok((Side::Sell, to)),
        _ => Err(MalformedEvent::new(raw, "transfer does not involve wallet")),
    }
}
