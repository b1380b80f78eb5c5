use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::checkpoint::{ProgressCounters, StateCounts};
use crate::domain::{SyncState, SyncTarget};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct SyncStatusQuery {
    /// Only list targets in this state.
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub wallet: String,
    pub state: SyncState,
    pub watermark_ms: Option<i64>,
    pub last_synced_at_ms: Option<i64>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub trade_count: u64,
}

impl From<&SyncTarget> for TargetStatus {
    fn from(target: &SyncTarget) -> Self {
        Self {
            wallet: target.wallet.to_string(),
            state: target.state,
            watermark_ms: target.watermark.map(|t| t.as_ms()),
            last_synced_at_ms: target.last_synced_at.map(|t| t.as_ms()),
            consecutive_errors: target.consecutive_errors,
            last_error: target.last_error.clone(),
            trade_count: target.trade_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub run_id: String,
    pub snapshot_at_ms: i64,
    pub counters: ProgressCounters,
    pub states: StateCounts,
    pub targets: Vec<TargetStatus>,
}

pub async fn get_sync_status(
    Query(params): Query<SyncStatusQuery>,
    State(state): State<AppState>,
) -> Result<Json<SyncStatusResponse>, AppError> {
    let filter = params
        .state
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<SyncState>())
        .transpose()
        .map_err(AppError::BadRequest)?;

    let checkpoint = state
        .status
        .snapshot()
        .await
        .ok_or_else(|| AppError::Unavailable("no sync progress published yet".to_string()))?;

    let targets = checkpoint
        .targets()
        .iter()
        .filter(|t| filter.map_or(true, |s| t.state == s))
        .map(TargetStatus::from)
        .collect();

    Ok(Json(SyncStatusResponse {
        run_id: checkpoint.run_id.to_string(),
        snapshot_at_ms: checkpoint.snapshot_at.as_ms(),
        counters: checkpoint.counters,
        states: checkpoint.state_counts(),
        targets,
    }))
}
