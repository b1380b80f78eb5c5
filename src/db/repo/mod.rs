//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `fills.rs` - Canonical fill writes (idempotent upsert) and reads
//! - `markets.rs` - Resolution/category metadata and mark prices
//! - `metrics.rs` - Aggregated metrics store and compile fingerprints

mod fills;
mod markets;
mod metrics;

use crate::domain::Decimal;
use sqlx::sqlite::SqlitePool;
use std::str::FromStr;
use tracing::warn;

pub use markets::MarketImportError;
pub use metrics::{StoredCompileState, StoredWalletPnl, COMPILE_VERSION};

/// Result of one `upsert_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: u64,
    /// Records whose natural key already existed; absorbed without change.
    pub duplicates: u64,
}

impl UpsertSummary {
    pub fn merge(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
    }
}

/// Cheap change detector for a wallet's canonical fills.
///
/// Fills are append-only, so count plus latest ingestion time changes
/// whenever anything new lands for the wallet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletFingerprint {
    pub fill_count: i64,
    pub max_ingested_at: i64,
}

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Cheap liveness check used by the readiness endpoint.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Parse a stored decimal column, logging and defaulting on corruption.
fn parse_decimal(column: &str, key: &str, raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or_else(|e| {
        warn!(
            key = %key,
            column = column,
            value = %raw,
            error = %e,
            "Failed to parse stored decimal, using default"
        );
        Decimal::default()
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Repository;
    use crate::db::migrations::init_db;
    use crate::domain::{Address, CanonicalFill, Decimal, MarketId, Side, SourceTag, TimeMs};
    use std::str::FromStr;
    use tempfile::TempDir;

    pub async fn setup_repo() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }

    pub fn order_book_fill(key: &str, wallet: &Address, time_ms: i64, size: &str) -> CanonicalFill {
        let size = Decimal::from_str(size).unwrap();
        let price = Decimal::from_str("0.5").unwrap();
        CanonicalFill {
            natural_key: key.to_string(),
            wallet: wallet.clone(),
            market_id: MarketId::new("0xmarket"),
            outcome_index: Some(0),
            side: Side::Buy,
            price,
            size,
            usd_value: price * size,
            net_cash_flow: -(price * size),
            source: SourceTag::OrderBook,
            event_time: TimeMs::new(time_ms),
        }
    }
}
