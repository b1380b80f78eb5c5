//! Domain types and determinism layer.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: TimeMs, Address, MarketId, Side
//! - Raw upstream events and the canonical fill they normalize into
//! - Sync targets and market metadata
//! - Stable fill ordering for deterministic processing

pub mod decimal;
pub mod fill;
pub mod market;
pub mod ordering;
pub mod primitives;
pub mod raw_event;
pub mod target;

pub use decimal::Decimal;
pub use fill::{CanonicalFill, SourceTag};
pub use market::{MarkPrice, MarketCatalog, MarketMeta};
pub use ordering::sort_fills_deterministic;
pub use primitives::{Address, AddressParseError, MarketId, Side, TimeMs};
pub use raw_event::RawEvent;
pub use target::{SyncOutcome, SyncState, SyncTarget};
