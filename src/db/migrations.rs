//! Opening the canonical store and applying its schema.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Bumped whenever `schema.sql` gains a table or index, or a key changes.
pub const SCHEMA_VERSION: i64 = 2;

/// Version 2 keys fills by (wallet, natural_key) instead of natural_key alone.
const FILL_KEY_VERSION: i64 = 2;

const FILL_COLUMNS: &str = "natural_key, wallet, market_id, outcome_index, side, price, size, \
    usd_value, net_cash_flow, source_tag, event_time_ms, partition_month, ingested_at";

const POOL_SIZE: u32 = 5;

/// Open (creating if needed) the store at `db_path` and bring its schema up to date.
///
/// Every pooled connection runs in WAL mode with foreign keys enforced and a
/// five second busy timeout, so the sync workers and the API can share one file.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(dir) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(sqlx::Error::Io)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(POOL_SIZE)
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;
    info!(path = db_path, version = SCHEMA_VERSION, "Canonical store ready");
    Ok(pool)
}

/// Execute every statement in `schema.sql`. All of them are `IF NOT EXISTS`,
/// so reopening an existing store is a no-op apart from the version stamp.
/// A version 1 store has its fills table rebuilt under the wider key.
async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let (current,): (i64,) = sqlx::query_as("PRAGMA user_version")
        .fetch_one(pool)
        .await?;

    let statements = include_str!("schema.sql")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let rekey_fills = current > 0 && current < FILL_KEY_VERSION;

    let mut tx = pool.begin().await?;
    if rekey_fills {
        for statement in [
            "DROP INDEX IF EXISTS idx_canonical_fills_wallet_time",
            "DROP INDEX IF EXISTS idx_canonical_fills_partition",
            "ALTER TABLE canonical_fills RENAME TO canonical_fills_v1",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
    }

    let mut applied = 0usize;
    for statement in statements {
        sqlx::query(statement).execute(&mut *tx).await?;
        applied += 1;
    }

    if rekey_fills {
        let copied = sqlx::query(&format!(
            "INSERT INTO canonical_fills ({cols}) SELECT {cols} FROM canonical_fills_v1",
            cols = FILL_COLUMNS
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DROP TABLE canonical_fills_v1")
            .execute(&mut *tx)
            .await?;
        info!(rows = copied, "Re-keyed canonical fills by wallet");
    }
    if current < SCHEMA_VERSION {
        // PRAGMA does not accept bound parameters.
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    debug!(statements = applied, from = current, to = SCHEMA_VERSION, "Schema applied");
    Ok(())
}
