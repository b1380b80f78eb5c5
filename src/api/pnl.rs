use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{parse_wallet, AppState};
use crate::engine::{PnlWarning, Position, WalletPnl};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct PnlQuery {
    pub wallet: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    pub market_id: String,
    /// Absent for the market-level cash bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_index: Option<u32>,
    pub status: String,
    pub net_shares: String,
    pub avg_cost: String,
    pub net_cash_flow: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<String>,
    pub trade_count: u64,
}

impl From<&Position> for PositionResponse {
    fn from(p: &Position) -> Self {
        Self {
            market_id: p.market_id.to_string(),
            outcome_index: p.outcome_index,
            status: p.status.to_string(),
            net_shares: p.net_shares.to_canonical_string(),
            avg_cost: p.avg_cost.to_canonical_string(),
            net_cash_flow: p.net_cash_flow.to_canonical_string(),
            realized_pnl: p.realized_pnl.map(|d| d.to_canonical_string()),
            unrealized_pnl: p.unrealized_pnl.map(|d| d.to_canonical_string()),
            trade_count: p.trade_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlResponse {
    pub wallet: String,
    pub realized_pnl: String,
    pub unrealized_pnl: String,
    pub total_pnl: String,
    pub order_book_fills: u64,
    pub excluded_fills: u64,
    pub positions: Vec<PositionResponse>,
    pub warnings: Vec<PnlWarning>,
}

impl From<&WalletPnl> for PnlResponse {
    fn from(pnl: &WalletPnl) -> Self {
        Self {
            wallet: pnl.wallet.to_string(),
            realized_pnl: pnl.realized_pnl.to_canonical_string(),
            unrealized_pnl: pnl.unrealized_pnl.to_canonical_string(),
            total_pnl: pnl.total_pnl().to_canonical_string(),
            order_book_fills: pnl.order_book_fills,
            excluded_fills: pnl.excluded_fills,
            positions: pnl.positions.iter().map(PositionResponse::from).collect(),
            warnings: pnl.warnings.clone(),
        }
    }
}

/// P&L computed on demand from the canonical store.
pub async fn get_pnl(
    Query(params): Query<PnlQuery>,
    State(state): State<AppState>,
) -> Result<Json<PnlResponse>, AppError> {
    let wallet = parse_wallet(&params.wallet)?;

    let catalog = state.repo.load_market_catalog().await?;
    let fills = state.repo.query_wallet_fills(&wallet, None, None).await?;
    let pnl = state.engine.compute_wallet(&wallet, &fills, &catalog);

    Ok(Json(PnlResponse::from(&pnl)))
}
