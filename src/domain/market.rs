//! Market metadata consumed by the computation stages.

use crate::domain::{Decimal, MarketId, TimeMs};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// One row of the resolution/category metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketMeta {
    pub market_id: MarketId,
    pub category: Option<String>,
    /// None while unresolved.
    pub payout_numerators: Option<Vec<u64>>,
    pub resolved_at: Option<TimeMs>,
}

/// Latest mark price for one outcome of a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub market_id: MarketId,
    pub outcome_index: u32,
    pub price: Decimal,
    pub updated_at: TimeMs,
}

/// Market metadata loaded in bulk once per computation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketCatalog {
    markets: HashMap<MarketId, MarketMeta>,
    marks: HashMap<(MarketId, u32), Decimal>,
}

impl MarketCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_market(&mut self, meta: MarketMeta) {
        self.markets.insert(meta.market_id.clone(), meta);
    }

    pub fn insert_mark(&mut self, mark: MarkPrice) {
        self.marks
            .insert((mark.market_id, mark.outcome_index), mark.price);
    }

    pub fn with_market(mut self, meta: MarketMeta) -> Self {
        self.insert_market(meta);
        self
    }

    pub fn with_mark(mut self, mark: MarkPrice) -> Self {
        self.insert_mark(mark);
        self
    }

    /// Whether any metadata row exists for the market.
    pub fn contains(&self, market: &MarketId) -> bool {
        self.markets.contains_key(market)
    }

    pub fn payout_numerators(&self, market: &MarketId) -> Option<&[u64]> {
        self.markets
            .get(market)
            .and_then(|m| m.payout_numerators.as_deref())
    }

    pub fn category(&self, market: &MarketId) -> Option<&str> {
        self.markets.get(market).and_then(|m| m.category.as_deref())
    }

    pub fn mark(&self, market: &MarketId, outcome_index: u32) -> Option<Decimal> {
        self.marks.get(&(market.clone(), outcome_index)).copied()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Content digest; changes whenever any resolution, category, or mark changes.
    pub fn digest(&self) -> String {
        let markets: BTreeMap<&MarketId, &MarketMeta> = self.markets.iter().collect();
        let marks: BTreeMap<(&MarketId, u32), &Decimal> =
            self.marks.iter().map(|((m, o), p)| ((m, *o), p)).collect();

        let mut hasher = Sha256::new();
        for (id, meta) in markets {
            hasher.update(id.as_str());
            hasher.update(meta.category.as_deref().unwrap_or(""));
            if let Some(numerators) = &meta.payout_numerators {
                for n in numerators {
                    hasher.update(n.to_le_bytes());
                }
            }
            hasher.update(b";");
        }
        for ((id, outcome), price) in marks {
            hasher.update(id.as_str());
            hasher.update(outcome.to_le_bytes());
            hasher.update(price.to_canonical_string());
            hasher.update(b";");
        }
        hex::encode(&hasher.finalize()[..16])
    }
}
