//! Metrics compiler: canonical fills -> aggregated metrics store.
//!
//! Each wallet is recomputed from scratch (P&L engine, then the category
//! aggregator) and its derived rows replaced in one transaction. A wallet is
//! skipped when its fill fingerprint, the market catalog digest and the
//! compile version all match what the previous compile recorded.

use crate::db::{Repository, COMPILE_VERSION};
use crate::domain::{Address, MarketCatalog};
use crate::engine::{CategoryAggregator, PnlEngine};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Result of compiling one wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompileOutcome {
    Compiled { positions: usize, categories: usize },
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompileSummary {
    pub compiled: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct MetricsCompiler {
    repo: Arc<Repository>,
    engine: PnlEngine,
    aggregator: CategoryAggregator,
}

impl MetricsCompiler {
    pub fn new(repo: Arc<Repository>, engine: PnlEngine) -> Self {
        Self {
            repo,
            engine,
            aggregator: CategoryAggregator::new(),
        }
    }

    /// Recompute and persist metrics for one wallet.
    ///
    /// # Arguments
    /// * `catalog` - Market metadata shared across the compile
    /// * `catalog_digest` - `catalog.digest()`, passed in so fan-out computes it once
    /// * `wallet` - Wallet to compile
    /// * `force` - Recompute even when nothing changed
    pub async fn compile_wallet(
        &self,
        catalog: &MarketCatalog,
        catalog_digest: &str,
        wallet: &Address,
        force: bool,
    ) -> Result<CompileOutcome, CompileError> {
        // Fingerprint first: fills landing after this read trigger another compile.
        let fingerprint = self.repo.wallet_fingerprint(wallet).await?;

        if !force {
            if let Some(state) = self.repo.get_compile_state(wallet).await? {
                if state.fingerprint == fingerprint
                    && state.catalog_digest == catalog_digest
                    && state.compile_version == COMPILE_VERSION
                {
                    debug!(wallet = %wallet, "Metrics unchanged, skipping");
                    return Ok(CompileOutcome::Unchanged);
                }
            }
        }

        let fills = self.repo.query_wallet_fills(wallet, None, None).await?;
        let pnl = self.engine.compute_wallet(wallet, &fills, catalog);
        let scores = self.aggregator.aggregate(wallet, &pnl.positions, catalog);

        for warning in &pnl.warnings {
            debug!(wallet = %wallet, warning = %warning, "P&L data-quality warning");
        }

        self.repo
            .replace_wallet_metrics(&pnl, &scores, &fingerprint, catalog_digest)
            .await?;

        debug!(
            wallet = %wallet,
            fills = fills.len(),
            positions = pnl.positions.len(),
            categories = scores.len(),
            realized = %pnl.realized_pnl,
            unrealized = %pnl.unrealized_pnl,
            "Compiled wallet metrics"
        );
        Ok(CompileOutcome::Compiled {
            positions: pnl.positions.len(),
            categories: scores.len(),
        })
    }

    /// Compile every wallet in `wallets` over one bulk-loaded catalog.
    ///
    /// A wallet that fails is logged and counted; the rest still compile.
    ///
    /// # Errors
    /// Only when the market catalog cannot be loaded.
    pub async fn compile_all(
        &self,
        wallets: &[Address],
        concurrency: usize,
        force: bool,
    ) -> Result<CompileSummary, CompileError> {
        let catalog = self.repo.load_market_catalog().await?;
        let digest = catalog.digest();
        let catalog = &catalog;
        let digest = digest.as_str();

        let results: Vec<(&Address, Result<CompileOutcome, CompileError>)> =
            stream::iter(wallets)
                .map(|wallet| async move {
                    (wallet, self.compile_wallet(catalog, digest, wallet, force).await)
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

        let mut summary = CompileSummary::default();
        for (wallet, result) in results {
            match result {
                Ok(CompileOutcome::Compiled { .. }) => summary.compiled += 1,
                Ok(CompileOutcome::Unchanged) => summary.unchanged += 1,
                Err(e) => {
                    warn!(wallet = %wallet, error = %e, "Metrics compile failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            wallets = wallets.len(),
            compiled = summary.compiled,
            unchanged = summary.unchanged,
            failed = summary.failed,
            markets = catalog.len(),
            "Metrics compile finished"
        );
        Ok(summary)
    }
}
