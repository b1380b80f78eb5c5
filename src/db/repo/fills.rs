//! Canonical fill operations for the repository.

use crate::domain::{Address, CanonicalFill, MarketId, Side, SourceTag, TimeMs};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, warn};

use super::{parse_decimal, Repository, UpsertSummary, WalletFingerprint};

const INSERT_FILL_SQL: &str = r#"
    INSERT INTO canonical_fills (
        natural_key, wallet, market_id, outcome_index, side, price, size,
        usd_value, net_cash_flow, source_tag, event_time_ms, partition_month,
        ingested_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(wallet, natural_key) DO NOTHING
"#;

const SELECT_FILL_COLUMNS: &str = r#"
    SELECT natural_key, wallet, market_id, outcome_index, side, price, size,
           usd_value, net_cash_flow, source_tag, event_time_ms
    FROM canonical_fills
"#;

impl Repository {
    /// Idempotently persist canonical fills keyed by (wallet, natural key).
    ///
    /// One upstream event seen from both sides of a transfer yields a record
    /// per wallet. Each record is its own atomic unit: an existing key is a
    /// no-op counted as a duplicate, and a failure part-way leaves earlier records
    /// committed (re-running the batch is safe).
    ///
    /// # Errors
    /// Returns an error if an insert fails.
    pub async fn upsert_batch(&self, fills: &[CanonicalFill]) -> Result<UpsertSummary, sqlx::Error> {
        let mut summary = UpsertSummary::default();
        if fills.is_empty() {
            return Ok(summary);
        }

        let ingested_at = TimeMs::now().as_ms();
        let mut conn = self.pool.acquire().await?;

        for fill in fills {
            let result = sqlx::query(INSERT_FILL_SQL)
                .bind(fill.natural_key.as_str())
                .bind(fill.wallet.as_str())
                .bind(fill.market_id.as_str())
                .bind(fill.outcome_index.map(i64::from))
                .bind(fill.side.to_string())
                .bind(fill.price.to_canonical_string())
                .bind(fill.size.to_canonical_string())
                .bind(fill.usd_value.to_canonical_string())
                .bind(fill.net_cash_flow.to_canonical_string())
                .bind(fill.source.as_str())
                .bind(fill.event_time.as_ms())
                .bind(fill.event_time.partition_month())
                .bind(ingested_at)
                .execute(&mut *conn)
                .await?;

            if result.rows_affected() > 0 {
                summary.inserted += 1;
            } else {
                summary.duplicates += 1;
            }
        }

        if summary.duplicates > 0 {
            debug!(
                inserted = summary.inserted,
                duplicates = summary.duplicates,
                "Absorbed duplicate canonical fills"
            );
        }
        Ok(summary)
    }

    /// Query a wallet's fills with an optional inclusive time window,
    /// ordered by (event_time, natural_key).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_wallet_fills(
        &self,
        wallet: &Address,
        from_ms: Option<TimeMs>,
        to_ms: Option<TimeMs>,
    ) -> Result<Vec<CanonicalFill>, sqlx::Error> {
        let from_ms = from_ms.unwrap_or(TimeMs::new(0)).as_ms();
        let to_ms = to_ms.unwrap_or(TimeMs::new(i64::MAX)).as_ms();

        let sql = format!(
            "{} WHERE wallet = ? AND event_time_ms >= ? AND event_time_ms <= ? \
             ORDER BY event_time_ms ASC, natural_key ASC",
            SELECT_FILL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(wallet.as_str())
            .bind(from_ms)
            .bind(to_ms)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(row_to_fill).collect())
    }

    /// Scan every fill in one monthly partition (`YYYY-MM`).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_partition_fills(
        &self,
        partition_month: &str,
    ) -> Result<Vec<CanonicalFill>, sqlx::Error> {
        let sql = format!(
            "{} WHERE partition_month = ? ORDER BY event_time_ms ASC, natural_key ASC, wallet ASC",
            SELECT_FILL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(partition_month)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(row_to_fill).collect())
    }

    /// All wallets with at least one canonical fill.
    pub async fn distinct_wallets(&self) -> Result<Vec<Address>, sqlx::Error> {
        let rows = sqlx::query("SELECT DISTINCT wallet FROM canonical_fills ORDER BY wallet ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| Address::new(row.get::<String, _>("wallet")))
            .collect())
    }

    /// Number of canonical fills stored for a wallet.
    pub async fn count_wallet_fills(&self, wallet: &Address) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM canonical_fills WHERE wallet = ?")
            .bind(wallet.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn wallet_fingerprint(
        &self,
        wallet: &Address,
    ) -> Result<WalletFingerprint, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS fill_count, COALESCE(MAX(ingested_at), 0) AS max_ingested_at
            FROM canonical_fills
            WHERE wallet = ?
            "#,
        )
        .bind(wallet.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(WalletFingerprint {
            fill_count: row.get("fill_count"),
            max_ingested_at: row.get("max_ingested_at"),
        })
    }
}

fn row_to_fill(row: &SqliteRow) -> Option<CanonicalFill> {
    let natural_key: String = row.get("natural_key");

    let side_str: String = row.get("side");
    let Some(side) = Side::parse(&side_str) else {
        warn!(key = %natural_key, side = %side_str, "Skipping stored fill with unknown side");
        return None;
    };
    let source_str: String = row.get("source_tag");
    let source: SourceTag = match source_str.parse() {
        Ok(source) => source,
        Err(e) => {
            warn!(key = %natural_key, error = %e, "Skipping stored fill with unknown source tag");
            return None;
        }
    };
    let outcome_index = row
        .get::<Option<i64>, _>("outcome_index")
        .and_then(|o| u32::try_from(o).ok());

    Some(CanonicalFill {
        wallet: Address::new(row.get::<String, _>("wallet")),
        market_id: MarketId::new(row.get::<String, _>("market_id")),
        outcome_index,
        side,
        price: parse_decimal("price", &natural_key, &row.get::<String, _>("price")),
        size: parse_decimal("size", &natural_key, &row.get::<String, _>("size")),
        usd_value: parse_decimal("usd_value", &natural_key, &row.get::<String, _>("usd_value")),
        net_cash_flow: parse_decimal(
            "net_cash_flow",
            &natural_key,
            &row.get::<String, _>("net_cash_flow"),
        ),
        source,
        event_time: TimeMs::new(row.get("event_time_ms")),
        natural_key,
    })
}
