pub mod categories;
pub mod health;
pub mod pnl;
pub mod sync_status;

use crate::db::Repository;
use crate::domain::Address;
use crate::engine::PnlEngine;
use crate::error::AppError;
use crate::orchestration::StatusBoard;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    /// Progress published by the running orchestrator.
    pub status: StatusBoard,
    pub engine: PnlEngine,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, status: StatusBoard, engine: PnlEngine) -> Self {
        Self {
            repo,
            status,
            engine,
        }
    }
}

pub(crate) fn parse_wallet(input: &str) -> Result<Address, AppError> {
    Address::parse(input).map_err(|_| AppError::BadRequest("Invalid wallet address".to_string()))
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/sync/status", get(sync_status::get_sync_status))
        .route("/v1/pnl", get(pnl::get_pnl))
        .route("/v1/categories", get(categories::get_categories))
        .layer(cors)
        .with_state(state)
}
