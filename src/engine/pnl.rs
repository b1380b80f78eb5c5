//! Realized/unrealized P&L for one wallet from its canonical fills.
//!
//! Internal-mechanism transfers never reach accumulation. Every remaining
//! fill is folded into its (market, outcome) position in deterministic order;
//! resolved markets are valued with the payout rule, open ones at the latest
//! mark.

use crate::domain::{
    sort_fills_deterministic, Address, CanonicalFill, Decimal, MarketCatalog, MarketId, SourceTag,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::{payout::PayoutRule, PnlWarning, Position, PositionKey, PositionStatus, PositionTracker};

/// P&L result for one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletPnl {
    pub wallet: Address,
    /// Ordered by (market, outcome); the cash bucket sorts first.
    pub positions: Vec<Position>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub order_book_fills: u64,
    /// Internal-mechanism records dropped before accumulation.
    pub excluded_fills: u64,
    pub warnings: Vec<PnlWarning>,
}

impl WalletPnl {
    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn open_positions(&self) -> usize {
        self.positions
            .iter()
            .filter(|p| !p.is_resolved() && p.outcome_index.is_some())
            .count()
    }

    pub fn resolved_positions(&self) -> usize {
        self.positions
            .iter()
            .filter(|p| p.is_resolved() && p.outcome_index.is_some())
            .count()
    }

    pub fn has_negative_share_warnings(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, PnlWarning::NegativeShares { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct PnlEngine {
    notional_per_share: Decimal,
}

impl Default for PnlEngine {
    fn default() -> Self {
        Self::new(Decimal::one())
    }
}

impl PnlEngine {
    pub fn new(notional_per_share: Decimal) -> Self {
        Self { notional_per_share }
    }

    /// Compute P&L for `wallet` from all of its fills.
    ///
    /// Fills belonging to other wallets are ignored. Never fails: missing
    /// resolution data and negative share counts become warnings.
    pub fn compute_wallet(
        &self,
        wallet: &Address,
        fills: &[CanonicalFill],
        catalog: &MarketCatalog,
    ) -> WalletPnl {
        let mut ordered: Vec<CanonicalFill> =
            fills.iter().filter(|f| &f.wallet == wallet).cloned().collect();
        sort_fills_deterministic(&mut ordered);

        let mut trackers: BTreeMap<PositionKey, PositionTracker> = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut order_book_fills = 0u64;
        let mut excluded_fills = 0u64;

        for fill in &ordered {
            if !fill.source.counts_toward_pnl() {
                excluded_fills += 1;
                continue;
            }
            if fill.source == SourceTag::OrderBook {
                order_book_fills += 1;
            }

            let key = PositionKey {
                market_id: fill.market_id.clone(),
                outcome_index: fill.outcome_index,
            };
            let tracker = trackers.entry(key).or_default();
            match tracker.process_fill(fill) {
                Ok(false) => {}
                Ok(true) => {
                    warn!(
                        wallet = %wallet,
                        market = %fill.market_id,
                        outcome = ?fill.outcome_index,
                        key = %fill.natural_key,
                        net_shares = %tracker.net_shares(),
                        "Net shares went negative without short-sale semantics"
                    );
                    warnings.push(PnlWarning::NegativeShares {
                        market_id: fill.market_id.clone(),
                        outcome_index: fill.outcome_index,
                        natural_key: fill.natural_key.clone(),
                        net_shares: tracker.net_shares(),
                    });
                }
                Err(err) => {
                    warn!(
                        wallet = %wallet,
                        market = %fill.market_id,
                        outcome = ?fill.outcome_index,
                        key = %fill.natural_key,
                        error = %err,
                        "Skipping fill"
                    );
                    warnings.push(PnlWarning::AmountOverflow {
                        market_id: fill.market_id.clone(),
                        outcome_index: fill.outcome_index,
                        natural_key: Some(fill.natural_key.clone()),
                    });
                }
            }
        }

        let mut missing_markets: BTreeSet<MarketId> = BTreeSet::new();
        let mut positions = Vec::with_capacity(trackers.len());
        let mut realized_pnl = Decimal::zero();
        let mut unrealized_pnl = Decimal::zero();

        for (key, tracker) in trackers {
            if !catalog.contains(&key.market_id) {
                missing_markets.insert(key.market_id.clone());
            }
            let Some(position) = self.value_position(wallet, key.clone(), &tracker, catalog) else {
                warn!(
                    wallet = %wallet,
                    market = %key.market_id,
                    outcome = ?key.outcome_index,
                    "Position value overflowed, skipping"
                );
                warnings.push(PnlWarning::AmountOverflow {
                    market_id: key.market_id,
                    outcome_index: key.outcome_index,
                    natural_key: None,
                });
                continue;
            };
            let realized_total = match position.realized_pnl {
                Some(realized) => realized_pnl.checked_add(realized),
                None => Some(realized_pnl),
            };
            let unrealized_total = match position.unrealized_pnl {
                Some(unrealized) => unrealized_pnl.checked_add(unrealized),
                None => Some(unrealized_pnl),
            };
            let (Some(realized_total), Some(unrealized_total)) = (realized_total, unrealized_total)
            else {
                warn!(
                    wallet = %wallet,
                    market = %position.market_id,
                    "Wallet total overflowed, skipping position"
                );
                warnings.push(PnlWarning::AmountOverflow {
                    market_id: position.market_id,
                    outcome_index: position.outcome_index,
                    natural_key: None,
                });
                continue;
            };
            realized_pnl = realized_total;
            unrealized_pnl = unrealized_total;
            positions.push(position);
        }

        for market_id in missing_markets {
            warn!(
                wallet = %wallet,
                market = %market_id,
                "No resolution data for market with fills, treating as open"
            );
            warnings.push(PnlWarning::UnresolvedMarketDataMissing { market_id });
        }

        debug!(
            wallet = %wallet,
            positions = positions.len(),
            realized = %realized_pnl,
            unrealized = %unrealized_pnl,
            excluded = excluded_fills,
            "Computed wallet P&L"
        );

        WalletPnl {
            wallet: wallet.clone(),
            positions,
            realized_pnl,
            unrealized_pnl,
            order_book_fills,
            excluded_fills,
            warnings,
        }
    }

    fn value_position(
        &self,
        wallet: &Address,
        key: PositionKey,
        tracker: &PositionTracker,
        catalog: &MarketCatalog,
    ) -> Option<Position> {
        let net_shares = tracker.net_shares();
        let cash = tracker.net_cash_flow();
        let rule = catalog
            .payout_numerators(&key.market_id)
            .map(PayoutRule::classify);

        let (status, realized_pnl, unrealized_pnl) = match (rule, key.outcome_index) {
            (Some(_), None) => (PositionStatus::Settled, Some(cash), None),
            (Some(rule), Some(outcome)) => {
                let rate = rule.rate(outcome);
                let status = match rule {
                    PayoutRule::Cancelled => PositionStatus::ResolvedPartial,
                    _ if rate.is_positive() => PositionStatus::ResolvedWon,
                    _ => PositionStatus::ResolvedLost,
                };
                let realized = self.value_at(net_shares, rate, cash)?;
                (status, Some(realized), None)
            }
            (None, None) => (PositionStatus::Open, None, Some(cash)),
            (None, Some(outcome)) => {
                let mark = catalog
                    .mark(&key.market_id, outcome)
                    .unwrap_or_else(|| tracker.avg_cost());
                let unrealized = self.value_at(net_shares, mark, cash)?;
                (PositionStatus::Open, None, Some(unrealized))
            }
        };

        Some(Position {
            wallet: wallet.clone(),
            market_id: key.market_id,
            outcome_index: key.outcome_index,
            net_shares,
            avg_cost: tracker.avg_cost(),
            net_cash_flow: cash,
            trading_realized: tracker.trading_realized(),
            status,
            realized_pnl,
            unrealized_pnl,
            trade_count: tracker.trade_count(),
            last_activity: tracker.last_activity(),
        })
    }

    /// `shares * price * notional + cash`, `None` on overflow.
    fn value_at(&self, shares: Decimal, price: Decimal, cash: Decimal) -> Option<Decimal> {
        shares
            .checked_mul(price)?
            .checked_mul(self.notional_per_share)?
            .checked_add(cash)
    }
}
