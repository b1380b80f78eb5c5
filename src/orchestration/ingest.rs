use crate::adapter::EventAdapter;
use crate::datasource::{DataSourceError, EventSource};
use crate::db::{Repository, UpsertSummary};
use crate::domain::{Address, TimeMs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Fetch -> normalize -> write pipeline for a single target.
#[derive(Clone)]
pub struct TargetSyncer {
    source: Arc<dyn EventSource>,
    repo: Arc<Repository>,
    adapter: Arc<EventAdapter>,
    page_size: usize,
    fetch_timeout: Duration,
    dry_run: bool,
}

impl TargetSyncer {
    pub fn new(
        source: Arc<dyn EventSource>,
        repo: Arc<Repository>,
        adapter: Arc<EventAdapter>,
        page_size: usize,
        fetch_timeout: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            source,
            repo,
            adapter,
            page_size: page_size.max(1),
            fetch_timeout,
            dry_run,
        }
    }

    /// Sync every event for `wallet` at or after `since`.
    ///
    /// Pages are applied in source order and written as they arrive; the
    /// returned watermark is only meaningful once every page succeeded, so a
    /// failure part-way leaves the caller's watermark untouched and the
    /// already-written records are absorbed as duplicates on retry.
    pub async fn sync_target(
        &self,
        wallet: &Address,
        since: TimeMs,
    ) -> Result<TargetSyncReport, TargetSyncError> {
        let mut report = TargetSyncReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = tokio::time::timeout(
                self.fetch_timeout,
                self.source
                    .fetch_events(wallet, since, cursor.as_deref(), self.page_size),
            )
            .await
            .map_err(|_| DataSourceError::Timeout)??;

            report.pages += 1;
            report.fetched += page.events.len() as u64;

            let mut fills = Vec::with_capacity(page.events.len());
            for raw in &page.events {
                match self.adapter.normalize(wallet, raw) {
                    Ok(normalized) => fills.extend(normalized),
                    Err(e) => {
                        warn!(
                            wallet = %wallet,
                            event_id = %e.event_id,
                            reason = %e.reason,
                            "Skipping malformed event"
                        );
                        report.skipped += 1;
                    }
                }
            }

            if let Some(max_time) = fills.iter().map(|f| f.event_time).max() {
                report.new_watermark = Some(report.new_watermark.map_or(max_time, |w| w.max(max_time)));
            }
            report.normalized += fills.len() as u64;

            if !self.dry_run {
                let summary = self.repo.upsert_batch(&fills).await?;
                report.store.merge(summary);
            }

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(DataSourceError::Other(format!(
                        "event source repeated cursor {}",
                        next
                    ))
                    .into());
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(
            wallet = %wallet,
            pages = report.pages,
            fetched = report.fetched,
            inserted = report.store.inserted,
            duplicates = report.store.duplicates,
            skipped = report.skipped,
            dry_run = self.dry_run,
            "Target sync finished"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSyncReport {
    pub pages: u64,
    pub fetched: u64,
    /// Canonical records produced by the adapter.
    pub normalized: u64,
    /// Malformed raw events.
    pub skipped: u64,
    pub store: UpsertSummary,
    /// Latest event time seen; None when nothing new arrived.
    pub new_watermark: Option<TimeMs>,
}

#[derive(Debug, Error)]
pub enum TargetSyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] DataSourceError),
    #[error("store write failed: {0}")]
    Store(#[from] sqlx::Error),
    #[error("sync task panicked: {0}")]
    Panicked(String),
}

impl TargetSyncError {
    /// Whether another attempt in the same run may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TargetSyncError::Fetch(e) => e.is_transient(),
            // Lock contention and pool timeouts clear up on their own.
            TargetSyncError::Store(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Database(_)
            ),
            TargetSyncError::Panicked(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MockEventSource;
    use crate::db::migrations::init_db;
    use crate::domain::RawEvent;
    use tempfile::TempDir;

    async fn setup_repo() -> (Arc<Repository>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Arc::new(Repository::new(pool)), temp_dir)
    }

    fn trade(id: &str, ts: i64) -> RawEvent {
        RawEvent {
            id: Some(id.to_string()),
            kind: Some("trade".to_string()),
            condition_id: Some("0xcond".to_string()),
            outcome_index: Some(0),
            side: Some("buy".to_string()),
            price: Some("0.5".to_string()),
            size: Some("10".to_string()),
            timestamp: Some(ts),
            ..Default::default()
        }
    }

    fn syncer(source: MockEventSource, repo: Arc<Repository>, dry_run: bool) -> TargetSyncer {
        TargetSyncer::new(
            Arc::new(source),
            repo,
            Arc::new(EventAdapter::default()),
            2,
            Duration::from_secs(5),
            dry_run,
        )
    }

    #[tokio::test]
    async fn test_sync_target_pages_and_advances_watermark() {
        let wallet = Address::new("0xw");
        let source = MockEventSource::new().with_events(
            &wallet,
            vec![trade("a", 100), trade("b", 200), trade("c", 300)],
        );
        let (repo, _temp) = setup_repo().await;

        let report = syncer(source, repo.clone(), false)
            .sync_target(&wallet, TimeMs::new(0))
            .await
            .unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(report.store.inserted, 3);
        assert_eq!(report.new_watermark, Some(TimeMs::from_secs(300)));
        assert_eq!(repo.count_wallet_fills(&wallet).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_malformed_events_are_skipped_not_fatal() {
        let wallet = Address::new("0xw");
        let mut bad = trade("bad", 150);
        bad.size = Some("-1".to_string());
        let source =
            MockEventSource::new().with_events(&wallet, vec![trade("a", 100), bad, trade("c", 300)]);
        let (repo, _temp) = setup_repo().await;

        let report = syncer(source, repo, false)
            .sync_target(&wallet, TimeMs::new(0))
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.store.inserted, 2);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let wallet = Address::new("0xw");
        let source = MockEventSource::new().with_events(&wallet, vec![trade("a", 100)]);
        let (repo, _temp) = setup_repo().await;

        let report = syncer(source, repo.clone(), true)
            .sync_target(&wallet, TimeMs::new(0))
            .await
            .unwrap();

        assert_eq!(report.normalized, 1);
        assert_eq!(report.store, UpsertSummary::default());
        assert_eq!(repo.count_wallet_fills(&wallet).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_transient() {
        let wallet = Address::new("0xw");
        let source = MockEventSource::new()
            .with_events(&wallet, vec![trade("a", 100)])
            .with_delay(Duration::from_millis(200));
        let (repo, _temp) = setup_repo().await;
        let syncer = TargetSyncer::new(
            Arc::new(source),
            repo,
            Arc::new(EventAdapter::default()),
            10,
            Duration::from_millis(10),
            false,
        );

        let err = syncer
            .sync_target(&wallet, TimeMs::new(0))
            .await
            .unwrap_err();
        assert!(matches!(err, TargetSyncError::Fetch(DataSourceError::Timeout)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_no_new_events_leaves_watermark_unset() {
        let wallet = Address::new("0xw");
        let source = MockEventSource::new().with_events(&wallet, vec![trade("a", 100)]);
        let (repo, _temp) = setup_repo().await;

        let report = syncer(source, repo, false)
            .sync_target(&wallet, TimeMs::from_secs(101))
            .await
            .unwrap();
        assert_eq!(report.fetched, 0);
        assert!(report.new_watermark.is_none());
    }
}
