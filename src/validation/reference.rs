//! External reference P&L oracle.

use crate::datasource::DataSourceError;
use crate::domain::{Address, Decimal};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Source of an independently computed total P&L per wallet.
#[async_trait]
pub trait ReferencePnlSource: Send + Sync + fmt::Debug {
    /// Total (realized + unrealized) P&L in USD, or None when the oracle
    /// has no record of the wallet.
    async fn total_pnl(&self, wallet: &Address) -> Result<Option<Decimal>, DataSourceError>;
}

/// `GET {base}/pnl?wallet=<addr>` returning `{"total_pnl": <number|string>}`.
#[derive(Debug, Clone)]
pub struct HttpReferencePnl {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ReferenceResponse {
    total_pnl: Option<Value>,
}

impl HttpReferencePnl {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, DataSourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataSourceError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// The oracle reports numbers as JSON numbers or strings.
fn parse_total(value: &Value) -> Result<Option<Decimal>, DataSourceError> {
    let raw = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(DataSourceError::ParseError(format!(
                "unexpected total_pnl {}",
                other
            )))
        }
    };
    Decimal::from_str(&raw)
        .map(Some)
        .map_err(|e| DataSourceError::ParseError(format!("total_pnl {}: {}", raw, e)))
}

#[async_trait]
impl ReferencePnlSource for HttpReferencePnl {
    async fn total_pnl(&self, wallet: &Address) -> Result<Option<Decimal>, DataSourceError> {
        let url = format!("{}/pnl", self.base_url);
        debug!(wallet = %wallet, "Fetching reference P&L");

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let response = retry(backoff, || async {
            let response = self
                .client
                .get(&url)
                .query(&[("wallet", wallet.as_str())])
                .send()
                .await
                .map_err(|e| {
                    let err = if e.is_timeout() {
                        DataSourceError::Timeout
                    } else {
                        DataSourceError::NetworkError(e.to_string())
                    };
                    backoff::Error::transient(err)
                })?;

            let status = response.status();
            if status == 404 {
                return Ok(None);
            }
            if status == 429 {
                return Err(backoff::Error::transient(DataSourceError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(DataSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(DataSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<ReferenceResponse>()
                .await
                .map(Some)
                .map_err(|e| backoff::Error::permanent(DataSourceError::ParseError(e.to_string())))
        })
        .await?;

        match response.and_then(|r| r.total_pnl) {
            Some(value) => parse_total(&value),
            None => Ok(None),
        }
    }
}

/// Fixed answers, for tests and offline comparisons.
#[derive(Debug, Clone, Default)]
pub struct StaticReferencePnl {
    totals: HashMap<Address, Decimal>,
}

impl StaticReferencePnl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_total(mut self, wallet: &Address, total: Decimal) -> Self {
        self.totals.insert(wallet.clone(), total);
        self
    }
}

#[async_trait]
impl ReferencePnlSource for StaticReferencePnl {
    async fn total_pnl(&self, wallet: &Address) -> Result<Option<Decimal>, DataSourceError> {
        Ok(self.totals.get(wallet).copied())
    }
}
