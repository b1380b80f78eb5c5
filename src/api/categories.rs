use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{parse_wallet, AppState};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct CategoriesQuery {
    pub wallet: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryResponse {
    pub category: String,
    pub sum_gains: String,
    pub sum_losses: String,
    /// `"inf"` when there were gains and no losses; null with no activity.
    pub omega_ratio: Option<String>,
    pub trade_count: u64,
    pub last_activity_ms: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoriesResponse {
    pub wallet: String,
    pub categories: Vec<CategoryResponse>,
}

/// Category scores from the aggregated metrics store.
pub async fn get_categories(
    Query(params): Query<CategoriesQuery>,
    State(state): State<AppState>,
) -> Result<Json<CategoriesResponse>, AppError> {
    let wallet = parse_wallet(&params.wallet)?;

    let scores = state.repo.query_category_scores(&wallet).await?;
    let categories = scores
        .into_iter()
        .map(|s| CategoryResponse {
            category: s.category,
            sum_gains: s.sum_gains.to_canonical_string(),
            sum_losses: s.sum_losses.to_canonical_string(),
            omega_ratio: s.omega_ratio.map(|o| o.to_string()),
            trade_count: s.trade_count,
            last_activity_ms: s.last_activity.as_ms(),
        })
        .collect();

    Ok(Json(CategoriesResponse {
        wallet: wallet.to_string(),
        categories,
    }))
}
