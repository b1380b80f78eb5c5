//! Domain primitives: TimeMs, Address, MarketId, Side.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Time in milliseconds since Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeMs(pub i64);

impl TimeMs {
    /// Create a TimeMs from milliseconds.
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    /// Create a TimeMs from whole seconds (block timestamps).
    pub fn from_secs(secs: i64) -> Self {
        TimeMs(secs.saturating_mul(1000))
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        TimeMs(Utc::now().timestamp_millis())
    }

    /// Get the underlying milliseconds value.
    pub fn as_ms(&self) -> i64 {
        self.0
    }

    /// Monthly time partition (`YYYY-MM`, UTC) this instant falls into.
    pub fn partition_month(&self) -> String {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(dt) => dt.format("%Y-%m").to_string(),
            None => "0000-00".to_string(),
        }
    }
}

/// Wallet address (lowercased hex string).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Create an Address, normalizing to lowercase so lookups are case-insensitive.
    pub fn new(addr: impl Into<String>) -> Self {
        Address(addr.into().trim().to_ascii_lowercase())
    }

    /// Parse a `0x`-prefixed hex address.
    pub fn parse(input: &str) -> Result<Self, AddressParseError> {
        let trimmed = input.trim();
        let Some(hex_part) = trimmed.strip_prefix("0x") else {
            return Err(AddressParseError(trimmed.to_string()));
        };
        if hex_part.is_empty() || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressParseError(trimmed.to_string()));
        }
        Ok(Address::new(trimmed))
    }

    /// Get the address as a string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct AddressParseError(pub String);

/// Market / condition identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId(pub String);

impl MarketId {
    pub fn new(id: impl Into<String>) -> Self {
        MarketId(id.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MarketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade side from the wallet's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Shares received.
    Buy,
    /// Shares given up.
    Sell,
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" => Some(Side::Buy),
            "sell" | "s" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}
