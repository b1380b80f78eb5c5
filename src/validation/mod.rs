//! Comparison of computed wallet P&L against an external reference oracle.
//!
//! Disagreements are classified so that expected differences (open
//! positions valued at marks, wallets the oracle only sees through
//! non-order-book activity, residual error after over-selling) are
//! separated from real mismatches.

use crate::datasource::DataSourceError;
use crate::db::Repository;
use crate::domain::{Address, Decimal, MarketCatalog};
use crate::engine::{PnlEngine, WalletPnl};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod reference;

pub use reference::{HttpReferencePnl, ReferencePnlSource, StaticReferencePnl};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("reference oracle error: {0}")]
    Reference(#[from] DataSourceError),
    #[error("report error: {0}")]
    Csv(#[from] csv::Error),
    #[error("report io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Within tolerance.
    Match,
    /// Differs, but the wallet still holds open positions valued at marks.
    OpenPositionVariance,
    /// Oracle reports exactly zero and the wallet never traded on the book.
    NonOrderBookOnly,
    /// Differs on a fully resolved wallet that sold more than it held.
    ShortResidual,
    Mismatch,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Match => "match",
            Verdict::OpenPositionVariance => "open_position_variance",
            Verdict::NonOrderBookOnly => "non_order_book_only",
            Verdict::ShortResidual => "short_residual",
            Verdict::Mismatch => "mismatch",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify one comparison.
pub fn classify(computed: &WalletPnl, reference: Decimal, tolerance: Decimal) -> Verdict {
    let difference = (computed.total_pnl() - reference).abs();
    if difference <= tolerance {
        Verdict::Match
    } else if reference.is_zero() && computed.order_book_fills == 0 {
        Verdict::NonOrderBookOnly
    } else if computed.open_positions() > 0 {
        Verdict::OpenPositionVariance
    } else if computed.has_negative_share_warnings() {
        Verdict::ShortResidual
    } else {
        Verdict::Mismatch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationRow {
    pub wallet: Address,
    pub computed: Decimal,
    /// None when the oracle does not know the wallet.
    pub reference: Option<Decimal>,
    pub difference: Option<Decimal>,
    pub open_positions: usize,
    pub order_book_fills: u64,
    pub verdict: Option<Verdict>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub rows: Vec<ValidationRow>,
    /// Wallets whose comparison could not run.
    pub errors: usize,
}

impl ValidationReport {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.rows
            .iter()
            .filter(|r| r.verdict == Some(verdict))
            .count()
    }

    pub fn mismatches(&self) -> usize {
        self.count(Verdict::Mismatch)
    }

    /// Write the report as CSV.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), ValidationError> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record([
            "wallet",
            "computed_pnl",
            "reference_pnl",
            "difference",
            "open_positions",
            "order_book_fills",
            "verdict",
        ])?;
        for row in &self.rows {
            wtr.write_record([
                row.wallet.as_str().to_string(),
                row.computed.to_string(),
                row.reference.map(|d| d.to_string()).unwrap_or_default(),
                row.difference.map(|d| d.to_string()).unwrap_or_default(),
                row.open_positions.to_string(),
                row.order_book_fills.to_string(),
                row.verdict.map(|v| v.to_string()).unwrap_or_else(|| "no_reference".to_string()),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_csv_file(&self, path: &Path) -> Result<(), ValidationError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.write_csv(std::fs::File::create(path)?)
    }
}

/// Recomputes wallet P&L from the canonical store and compares it with the
/// reference oracle.
#[derive(Debug, Clone)]
pub struct Validator {
    repo: Arc<Repository>,
    engine: PnlEngine,
    reference: Arc<dyn ReferencePnlSource>,
    tolerance: Decimal,
}

impl Validator {
    pub fn new(
        repo: Arc<Repository>,
        engine: PnlEngine,
        reference: Arc<dyn ReferencePnlSource>,
        tolerance: Decimal,
    ) -> Self {
        Self {
            repo,
            engine,
            reference,
            tolerance,
        }
    }

    pub async fn validate_wallet(
        &self,
        catalog: &MarketCatalog,
        wallet: &Address,
    ) -> Result<ValidationRow, ValidationError> {
        let fills = self.repo.query_wallet_fills(wallet, None, None).await?;
        let computed = self.engine.compute_wallet(wallet, &fills, catalog);
        let reference = self.reference.total_pnl(wallet).await?;

        let verdict = reference.map(|r| classify(&computed, r, self.tolerance));
        Ok(ValidationRow {
            wallet: wallet.clone(),
            computed: computed.total_pnl(),
            reference,
            difference: reference.map(|r| computed.total_pnl() - r),
            open_positions: computed.open_positions(),
            order_book_fills: computed.order_book_fills,
            verdict,
        })
    }

    /// Validate wallets one after another (the oracle is rate limited).
    pub async fn validate_all(&self, wallets: &[Address]) -> Result<ValidationReport, ValidationError> {
        let catalog = self.repo.load_market_catalog().await?;
        let mut report = ValidationReport::default();

        for wallet in wallets {
            match self.validate_wallet(&catalog, wallet).await {
                Ok(row) => {
                    if row.verdict == Some(Verdict::Mismatch) {
                        warn!(
                            wallet = %wallet,
                            computed = %row.computed,
                            reference = ?row.reference.map(|d| d.to_string()),
                            "P&L mismatch against reference"
                        );
                    }
                    report.rows.push(row);
                }
                Err(e) => {
                    warn!(wallet = %wallet, error = %e, "Validation failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            wallets = wallets.len(),
            matched = report.count(Verdict::Match),
            open_variance = report.count(Verdict::OpenPositionVariance),
            non_order_book = report.count(Verdict::NonOrderBookOnly),
            short_residual = report.count(Verdict::ShortResidual),
            mismatched = report.mismatches(),
            errors = report.errors,
            "Validation finished"
        );
        Ok(report)
    }
}
