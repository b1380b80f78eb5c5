//! Aggregated metrics store: positions, wallet P&L and category scores.

use crate::domain::{Address, Decimal, MarketId, TimeMs};
use crate::engine::{CategoryScore, OmegaRatio, Position, PositionStatus, WalletPnl};
use serde::Serialize;
use sqlx::Row;
use tracing::warn;

use super::{parse_decimal, Repository, WalletFingerprint};

/// Bumped whenever the derivation rules change so stored rows get rebuilt.
pub const COMPILE_VERSION: i64 = 1;

/// Outcome index stored for the market-level cash bucket.
const CASH_BUCKET_OUTCOME: i64 = -1;

/// Persisted wallet-level P&L summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredWalletPnl {
    pub wallet: Address,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: i64,
    pub resolved_positions: i64,
    pub order_book_fills: i64,
    pub excluded_fills: i64,
    pub warnings: i64,
    pub computed_at: TimeMs,
}

/// What the last compile of a wallet saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCompileState {
    pub fingerprint: WalletFingerprint,
    pub catalog_digest: String,
    pub compile_version: i64,
}

impl Repository {
    /// Replace every derived row for `pnl.wallet` in one transaction and
    /// record the inputs it was computed from.
    pub async fn replace_wallet_metrics(
        &self,
        pnl: &WalletPnl,
        scores: &[CategoryScore],
        fingerprint: &WalletFingerprint,
        catalog_digest: &str,
    ) -> Result<(), sqlx::Error> {
        let wallet = pnl.wallet.as_str();
        let mut tx = self.pool.begin().await?;

        for table in ["wallet_positions", "category_scores", "wallet_pnl"] {
            sqlx::query(&format!("DELETE FROM {} WHERE wallet = ?", table))
                .bind(wallet)
                .execute(&mut *tx)
                .await?;
        }

        for position in &pnl.positions {
            sqlx::query(
                r#"
                INSERT INTO wallet_positions (
                    wallet, market_id, outcome_index, net_shares, avg_cost,
                    net_cash_flow, trading_realized, status, realized_pnl,
                    unrealized_pnl, trade_count, last_activity_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(wallet)
            .bind(position.market_id.as_str())
            .bind(
                position
                    .outcome_index
                    .map(i64::from)
                    .unwrap_or(CASH_BUCKET_OUTCOME),
            )
            .bind(position.net_shares.to_canonical_string())
            .bind(position.avg_cost.to_canonical_string())
            .bind(position.net_cash_flow.to_canonical_string())
            .bind(position.trading_realized.to_canonical_string())
            .bind(position.status.as_str())
            .bind(position.realized_pnl.map(|d| d.to_canonical_string()))
            .bind(position.unrealized_pnl.map(|d| d.to_canonical_string()))
            .bind(position.trade_count as i64)
            .bind(position.last_activity.as_ms())
            .execute(&mut *tx)
            .await?;
        }

        for score in scores {
            sqlx::query(
                r#"
                INSERT INTO category_scores (
                    wallet, category, sum_gains, sum_losses, omega_ratio,
                    trade_count, last_activity_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(wallet)
            .bind(score.category.as_str())
            .bind(score.sum_gains.to_canonical_string())
            .bind(score.sum_losses.to_canonical_string())
            .bind(score.omega_ratio.map(|o| o.to_string()))
            .bind(score.trade_count as i64)
            .bind(score.last_activity.as_ms())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO wallet_pnl (
                wallet, realized_pnl, unrealized_pnl, open_positions,
                resolved_positions, order_book_fills, excluded_fills, warnings,
                computed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(wallet)
        .bind(pnl.realized_pnl.to_canonical_string())
        .bind(pnl.unrealized_pnl.to_canonical_string())
        .bind(pnl.open_positions() as i64)
        .bind(pnl.resolved_positions() as i64)
        .bind(pnl.order_book_fills as i64)
        .bind(pnl.excluded_fills as i64)
        .bind(pnl.warnings.len() as i64)
        .bind(TimeMs::now().as_ms())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO compile_state (wallet, fill_count, max_ingested_at, catalog_digest, compile_version)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(wallet) DO UPDATE SET
                fill_count = excluded.fill_count,
                max_ingested_at = excluded.max_ingested_at,
                catalog_digest = excluded.catalog_digest,
                compile_version = excluded.compile_version
            "#,
        )
        .bind(wallet)
        .bind(fingerprint.fill_count)
        .bind(fingerprint.max_ingested_at)
        .bind(catalog_digest)
        .bind(COMPILE_VERSION)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_compile_state(
        &self,
        wallet: &Address,
    ) -> Result<Option<StoredCompileState>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT fill_count, max_ingested_at, catalog_digest, compile_version
            FROM compile_state
            WHERE wallet = ?
            "#,
        )
        .bind(wallet.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredCompileState {
            fingerprint: WalletFingerprint {
                fill_count: r.get("fill_count"),
                max_ingested_at: r.get("max_ingested_at"),
            },
            catalog_digest: r.get("catalog_digest"),
            compile_version: r.get("compile_version"),
        }))
    }

    /// Stored category scores for a wallet, ordered by category.
    pub async fn query_category_scores(
        &self,
        wallet: &Address,
    ) -> Result<Vec<CategoryScore>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT category, sum_gains, sum_losses, omega_ratio, trade_count, last_activity_ms
            FROM category_scores
            WHERE wallet = ?
            ORDER BY category ASC
            "#,
        )
        .bind(wallet.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let category: String = row.get("category");
                let omega_ratio = row
                    .get::<Option<String>, _>("omega_ratio")
                    .and_then(|raw| match raw.parse::<OmegaRatio>() {
                        Ok(omega) => Some(omega),
                        Err(e) => {
                            warn!(category = %category, error = %e, "Dropping unparseable omega ratio");
                            None
                        }
                    });
                CategoryScore {
                    wallet: wallet.clone(),
                    sum_gains: parse_decimal("sum_gains", &category, &row.get::<String, _>("sum_gains")),
                    sum_losses: parse_decimal(
                        "sum_losses",
                        &category,
                        &row.get::<String, _>("sum_losses"),
                    ),
                    omega_ratio,
                    trade_count: row.get::<i64, _>("trade_count").max(0) as u64,
                    last_activity: TimeMs::new(row.get("last_activity_ms")),
                    category,
                }
            })
            .collect())
    }

    pub async fn query_wallet_pnl(
        &self,
        wallet: &Address,
    ) -> Result<Option<StoredWalletPnl>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT realized_pnl, unrealized_pnl, open_positions, resolved_positions,
                   order_book_fills, excluded_fills, warnings, computed_at
            FROM wallet_pnl
            WHERE wallet = ?
            "#,
        )
        .bind(wallet.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredWalletPnl {
            wallet: wallet.clone(),
            realized_pnl: parse_decimal(
                "realized_pnl",
                wallet.as_str(),
                &r.get::<String, _>("realized_pnl"),
            ),
            unrealized_pnl: parse_decimal(
                "unrealized_pnl",
                wallet.as_str(),
                &r.get::<String, _>("unrealized_pnl"),
            ),
            open_positions: r.get("open_positions"),
            resolved_positions: r.get("resolved_positions"),
            order_book_fills: r.get("order_book_fills"),
            excluded_fills: r.get("excluded_fills"),
            warnings: r.get("warnings"),
            computed_at: TimeMs::new(r.get("computed_at")),
        }))
    }

    /// Stored positions for a wallet, ordered by (market, outcome).
    pub async fn query_wallet_positions(
        &self,
        wallet: &Address,
    ) -> Result<Vec<Position>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT market_id, outcome_index, net_shares, avg_cost, net_cash_flow,
                   trading_realized, status, realized_pnl, unrealized_pnl,
                   trade_count, last_activity_ms
            FROM wallet_positions
            WHERE wallet = ?
            ORDER BY market_id ASC, outcome_index ASC
            "#,
        )
        .bind(wallet.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let market_id: String = row.get("market_id");
            let status_str: String = row.get("status");
            let status = match status_str.parse::<PositionStatus>() {
                Ok(status) => status,
                Err(e) => {
                    warn!(market = %market_id, error = %e, "Skipping stored position");
                    continue;
                }
            };
            let outcome_index = u32::try_from(row.get::<i64, _>("outcome_index")).ok();
            let optional = |column: &str| {
                row.get::<Option<String>, _>(column)
                    .map(|raw| parse_decimal(column, &market_id, &raw))
            };

            positions.push(Position {
                wallet: wallet.clone(),
                outcome_index,
                net_shares: parse_decimal("net_shares", &market_id, &row.get::<String, _>("net_shares")),
                avg_cost: parse_decimal("avg_cost", &market_id, &row.get::<String, _>("avg_cost")),
                net_cash_flow: parse_decimal(
                    "net_cash_flow",
                    &market_id,
                    &row.get::<String, _>("net_cash_flow"),
                ),
                trading_realized: parse_decimal(
                    "trading_realized",
                    &market_id,
                    &row.get::<String, _>("trading_realized"),
                ),
                status,
                realized_pnl: optional("realized_pnl"),
                unrealized_pnl: optional("unrealized_pnl"),
                trade_count: row.get::<i64, _>("trade_count").max(0) as u64,
                last_activity: TimeMs::new(row.get("last_activity_ms")),
                market_id: MarketId::new(market_id.clone()),
            });
        }
        Ok(positions)
    }
}
