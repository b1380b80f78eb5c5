//! HTTP client for the wallet event indexer.

use super::{DataSourceError, EventPage, EventSource};
use crate::domain::{Address, RawEvent, TimeMs};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Event source backed by a paginated JSON indexer API:
/// `GET {base}/wallets/{wallet}/events?since=<secs>&limit=<n>[&cursor=<c>]`.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    client: Client,
    base_url: String,
    /// Cap on total time spent retrying one call.
    max_retry_elapsed: Duration,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    events: Vec<RawEvent>,
    next_cursor: Option<String>,
}

impl HttpEventSource {
    /// Create a new source. `request_timeout` bounds each individual request
    /// and `retry_budget` the transient-error retries of one page fetch; a
    /// caller with its own deadline should keep their sum below it.
    pub fn new(
        base_url: String,
        request_timeout: Duration,
        retry_budget: Duration,
    ) -> Result<Self, DataSourceError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DataSourceError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retry_elapsed: retry_budget,
        })
    }

    fn events_url(&self, wallet: &Address) -> String {
        format!("{}/wallets/{}/events", self.base_url, wallet.as_str())
    }

    async fn get_page(&self, url: &str, query: &[(&str, String)]) -> Result<PageResponse, DataSourceError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.max_retry_elapsed),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .get(url)
                .query(query)
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
                .json::<PageResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(DataSourceError::ParseError(e.to_string())))
        })
        .await
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn fetch_events(
        &self,
        wallet: &Address,
        since: TimeMs,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, DataSourceError> {
        debug!(
            wallet = %wallet,
            since_ms = since.as_ms(),
            cursor = cursor.unwrap_or(""),
            "Fetching event page"
        );

        let mut query = vec![
            ("since", (since.as_ms() / 1000).to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }

        let page = self.get_page(&self.events_url(wallet), &query).await?;
        Ok(EventPage {
            events: page.events,
            next_cursor: page.next_cursor.filter(|c| !c.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Indexer stub answering 503 on the first call and one event afterwards.
    async fn flaky_indexer(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/wallets/:wallet/events",
            get(move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        Json(serde_json::json!({
                            "events": [{"id": "0x1-0", "kind": "trade", "timestamp": 1}]
                        }))
                        .into_response()
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_within_one_fetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = flaky_indexer(hits.clone()).await;
        let config = Config::from_env_map(HashMap::from([
            ("DATABASE_PATH".to_string(), "/tmp/unused.db".to_string()),
            ("EVENTS_API_URL".to_string(), base_url.clone()),
            ("FETCH_TIMEOUT_MS".to_string(), "6000".to_string()),
        ]))
        .unwrap();

        let source =
            HttpEventSource::new(base_url, config.request_timeout(), config.retry_budget()).unwrap();
        let page = tokio::time::timeout(
            config.fetch_timeout(),
            source.fetch_events(&Address::new("0xabc"), TimeMs::new(0), None, 10),
        )
        .await
        .expect("retries outlived the fetch timeout")
        .unwrap();

        assert_eq!(page.events.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_events_url_strips_trailing_slash() {
        let source = HttpEventSource::new(
            "http://indexer.local/".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
        .unwrap();
        let url = source.events_url(&Address::new("0xABC"));
        assert_eq!(url, "http://indexer.local/wallets/0xabc/events");
    }

    #[test]
    fn test_page_response_parses() {
        let page: PageResponse = serde_json::from_value(serde_json::json!({
            "events": [{"id": "0x1-0", "kind": "trade", "timestamp": 1}],
            "next_cursor": "abc"
        }))
        .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));

        let empty: PageResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(empty.events.is_empty());
        assert!(empty.next_cursor.is_none());
    }
}
