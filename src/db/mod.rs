//! Canonical store backed by SQLite.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - Repository layer: canonical fill upserts, market catalog, derived metrics

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{
    MarketImportError, Repository, StoredCompileState, StoredWalletPnl, UpsertSummary,
    WalletFingerprint, COMPILE_VERSION,
};
