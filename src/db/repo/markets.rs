//! Resolution/category metadata and mark prices.

use crate::domain::{Decimal, MarkPrice, MarketCatalog, MarketId, MarketMeta, TimeMs};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

use super::{parse_decimal, Repository};

#[derive(Debug, Error)]
pub enum MarketImportError {
    #[error("csv parse error: {0}")]
    Csv(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl Repository {
    /// Insert or replace one market's metadata row.
    pub async fn upsert_market_meta(&self, meta: &MarketMeta) -> Result<(), sqlx::Error> {
        let numerators = meta
            .payout_numerators
            .as_ref()
            .map(|n| serde_json::to_string(n).unwrap_or_else(|_| "[]".to_string()));

        sqlx::query(
            r#"
            INSERT INTO markets (market_id, category, payout_numerators, resolved_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(market_id) DO UPDATE SET
                category = excluded.category,
                payout_numerators = excluded.payout_numerators,
                resolved_at_ms = excluded.resolved_at_ms
            "#,
        )
        .bind(meta.market_id.as_str())
        .bind(meta.category.as_deref())
        .bind(numerators)
        .bind(meta.resolved_at.map(|t| t.as_ms()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the latest mark; older updates never overwrite newer ones.
    pub async fn upsert_mark(&self, mark: &MarkPrice) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO market_marks (market_id, outcome_index, price, updated_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(market_id, outcome_index) DO UPDATE SET
                price = excluded.price,
                updated_at_ms = excluded.updated_at_ms
            WHERE excluded.updated_at_ms >= market_marks.updated_at_ms
            "#,
        )
        .bind(mark.market_id.as_str())
        .bind(i64::from(mark.outcome_index))
        .bind(mark.price.to_canonical_string())
        .bind(mark.updated_at.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load all market metadata and marks in bulk, once per computation run.
    pub async fn load_market_catalog(&self) -> Result<MarketCatalog, sqlx::Error> {
        let mut catalog = MarketCatalog::new();

        let rows = sqlx::query(
            "SELECT market_id, category, payout_numerators, resolved_at_ms FROM markets",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let market_id: String = row.get("market_id");
            let raw_numerators: Option<String> = row.get("payout_numerators");
            let payout_numerators = match raw_numerators {
                Some(raw) => match serde_json::from_str::<Vec<u64>>(&raw) {
                    Ok(n) => Some(n),
                    Err(e) => {
                        warn!(
                            market = %market_id,
                            value = %raw,
                            error = %e,
                            "Unparseable payout numerators, treating market as unresolved"
                        );
                        None
                    }
                },
                None => None,
            };
            catalog.insert_market(MarketMeta {
                market_id: MarketId::new(market_id),
                category: row.get("category"),
                payout_numerators,
                resolved_at: row.get::<Option<i64>, _>("resolved_at_ms").map(TimeMs::new),
            });
        }

        let rows = sqlx::query(
            "SELECT market_id, outcome_index, price, updated_at_ms FROM market_marks",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let market_id: String = row.get("market_id");
            let Ok(outcome_index) = u32::try_from(row.get::<i64, _>("outcome_index")) else {
                continue;
            };
            let price = parse_decimal("price", &market_id, &row.get::<String, _>("price"));
            catalog.insert_mark(MarkPrice {
                market_id: MarketId::new(market_id),
                outcome_index,
                price,
                updated_at: TimeMs::new(row.get("updated_at_ms")),
            });
        }

        Ok(catalog)
    }

    /// Bulk-import market metadata from CSV with header
    /// `market_id,category,payout_numerators,resolved_at_ms`.
    ///
    /// `payout_numerators` is empty while unresolved, otherwise a JSON array
    /// (`"[1,0]"`) or a `|`-separated list (`1|0`).
    ///
    /// # Errors
    /// Returns on the first malformed row; rows before it stay imported.
    pub async fn import_markets_csv(&self, csv_bytes: &[u8]) -> Result<usize, MarketImportError> {
        #[derive(Debug, serde::Deserialize)]
        struct Row {
            market_id: String,
            category: Option<String>,
            payout_numerators: Option<String>,
            resolved_at_ms: Option<i64>,
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(csv_bytes);

        let mut imported = 0usize;
        for record in reader.deserialize::<Row>() {
            let row = record.map_err(|e| MarketImportError::Csv(e.to_string()))?;
            if row.market_id.is_empty() {
                return Err(MarketImportError::Csv("empty market_id".to_string()));
            }
            let payout_numerators = row
                .payout_numerators
                .as_deref()
                .map(parse_numerators)
                .transpose()
                .map_err(|e| MarketImportError::Csv(format!("{}: {}", row.market_id, e)))?
                .flatten();

            self.upsert_market_meta(&MarketMeta {
                market_id: MarketId::new(row.market_id),
                category: row.category.filter(|c| !c.is_empty()),
                payout_numerators,
                resolved_at: row.resolved_at_ms.map(TimeMs::new),
            })
            .await?;
            imported += 1;
        }

        info!(imported, "Imported market metadata");
        Ok(imported)
    }
}

impl Repository {
    /// Bulk-import mark prices from CSV with header
    /// `market_id,outcome_index,price,updated_at_ms`.
    ///
    /// Goes through `upsert_mark`, so a stale row never replaces a newer mark.
    pub async fn import_marks_csv(&self, csv_bytes: &[u8]) -> Result<usize, MarketImportError> {
        #[derive(Debug, serde::Deserialize)]
        struct Row {
            market_id: String,
            outcome_index: u32,
            price: String,
            updated_at_ms: i64,
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(csv_bytes);

        let mut imported = 0usize;
        for record in reader.deserialize::<Row>() {
            let row = record.map_err(|e| MarketImportError::Csv(e.to_string()))?;
            let price = Decimal::from_str_canonical(&row.price)
                .ok()
                .filter(|p| !p.is_negative() && *p <= Decimal::one())
                .ok_or_else(|| {
                    MarketImportError::Csv(format!("{}: invalid mark {:?}", row.market_id, row.price))
                })?;
            self.upsert_mark(&MarkPrice {
                market_id: MarketId::new(row.market_id),
                outcome_index: row.outcome_index,
                price,
                updated_at: TimeMs::new(row.updated_at_ms),
            })
            .await?;
            imported += 1;
        }

        info!(imported, "Imported mark prices");
        Ok(imported)
    }
}

fn parse_numerators(raw: &str) -> Result<Option<Vec<u64>>, String> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if inner.is_empty() {
        return Ok(None);
    }
    inner
        .split(|c| c == ',' || c == '|')
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid payout numerator {:?}: {}", part, e))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
