//! Remote event source abstraction for fetching raw wallet events.

use crate::domain::{Address, RawEvent, TimeMs};
use async_trait::async_trait;
use std::fmt;

pub mod http;
pub mod mock;

pub use http::HttpEventSource;
pub use mock::MockEventSource;

/// One page of raw events, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    /// Opaque cursor for the next page; None when exhausted.
    pub next_cursor: Option<String>,
}

/// Paginated source of raw trade/transfer events per wallet.
///
/// Events are monotonic in time within a page. Duplicates across calls are
/// allowed and absorbed by natural-key dedup downstream.
#[async_trait]
pub trait EventSource: Send + Sync + fmt::Debug {
    /// Fetch one page of events for `wallet` with timestamps `>= since`.
    ///
    /// # Arguments
    /// * `wallet` - Wallet address
    /// * `since` - Inclusive lower bound (the wallet's watermark)
    /// * `cursor` - Cursor returned by the previous page, None for the first
    /// * `limit` - Maximum events per page
    async fn fetch_events(
        &self,
        wallet: &Address,
        since: TimeMs,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, DataSourceError>;
}

/// Error type for data source operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSourceError {
    /// Network error (e.g., connection reset, DNS failure)
    NetworkError(String),
    /// HTTP error (e.g., 5xx server error, 4xx client error)
    HttpError { status: u16, message: String },
    /// Parsing error (invalid JSON or malformed response)
    ParseError(String),
    /// Rate limit exceeded
    RateLimited,
    /// Call exceeded its deadline
    Timeout,
    /// Other error
    Other(String),
}

impl DataSourceError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DataSourceError::NetworkError(_)
            | DataSourceError::RateLimited
            | DataSourceError::Timeout => true,
            DataSourceError::HttpError { status, .. } => *status >= 500,
            DataSourceError::ParseError(_) | DataSourceError::Other(_) => false,
        }
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            DataSourceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            DataSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DataSourceError::RateLimited => write!(f, "Rate limited"),
            DataSourceError::Timeout => write!(f, "Timed out"),
            DataSourceError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for DataSourceError {}
