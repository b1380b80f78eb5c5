//! Stable fill ordering for deterministic processing.

use crate::domain::CanonicalFill;

/// Sort fills deterministically so replays of the same set always agree.
pub fn sort_fills_deterministic(fills: &mut [CanonicalFill]) {
    fills.sort_by(|a, b| {
        a.event_time
            .cmp(&b.event_time)
            .then_with(|| a.natural_key.cmp(&b.natural_key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Decimal, MarketId, Side, SourceTag, TimeMs};

    fn make_fill(time_ms: i64, key: &str) -> CanonicalFill {
        CanonicalFill {
            natural_key: key.to_string(),
            wallet: Address::new("0x1"),
            market_id: MarketId::new("0xm"),
            outcome_index: Some(0),
            side: Side::Buy,
            price: Decimal::zero(),
            size: Decimal::one(),
            usd_value: Decimal::zero(),
            net_cash_flow: Decimal::zero(),
            source: SourceTag::OrderBook,
            event_time: TimeMs::new(time_ms),
        }
    }

    #[test]
    fn test_sort_fills_deterministic() {
        let mut fills = vec![
            make_fill(2000, "a"),
            make_fill(1000, "c"),
            make_fill(1000, "b"),
        ];
        sort_fills_deterministic(&mut fills);
        let keys: Vec<&str> = fills.iter().map(|f| f.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }

}
