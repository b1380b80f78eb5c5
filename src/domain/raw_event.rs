//! Wire shape of an upstream trade/transfer event.
//!
//! Every field is optional: deciding what is malformed belongs to the
//! adapter, not to deserialization.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: Option<String>,
    /// `trade`, `split`, `merge`, `redeem`, `transfer`, `usdc_transfer`, `neg_risk_conversion`.
    pub kind: Option<String>,
    pub condition_id: Option<String>,
    pub outcome_index: Option<u32>,
    pub outcome_count: Option<u32>,
    pub side: Option<String>,
    pub price: Option<String>,
    pub size: Option<String>,
    pub usdc_amount: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Venue for trades (`ctf` or `neg_risk`).
    pub exchange: Option<String>,
    /// Block timestamp in seconds.
    pub timestamp: Option<i64>,
}

impl RawEvent {
    /// Id used in logs when the event is rejected.
    pub fn display_id(&self) -> &str {
        self.id.as_deref().unwrap_or("<missing id>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_event() {
        let raw: RawEvent = serde_json::from_str(r#"{"id":"0x1-2","kind":"trade"}"#).unwrap();
        assert_eq!(raw.id.as_deref(), Some("0x1-2"));
        assert!(raw.price.is_none());
        assert_eq!(RawEvent::default().display_id(), "<missing id>");
    }
}
