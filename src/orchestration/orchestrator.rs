use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointManager};
use crate::domain::{Address, SyncOutcome, SyncState, TimeMs};
use crate::orchestration::ingest::{TargetSyncError, TargetSyncReport, TargetSyncer};
use crate::orchestration::{StatusBoard, SyncSettings};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Bulk,
    Incremental,
}

/// What one run did; every queued target ends up in exactly one of
/// `completed`, `failed` or `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub dry_run: bool,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    /// Left pending because the run was cancelled.
    pub pending: usize,
    /// Targets a bulk run passed over because they were already completed.
    pub skipped_targets: usize,
    /// Malformed raw events skipped during normalization.
    pub skipped_records: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub cancelled: bool,
}

impl RunSummary {
    fn new(run_id: Uuid, mode: RunMode, dry_run: bool) -> Self {
        Self {
            run_id,
            mode,
            dry_run,
            queued: 0,
            completed: 0,
            failed: 0,
            pending: 0,
            skipped_targets: 0,
            skipped_records: 0,
            inserted: 0,
            duplicates: 0,
            retries: 0,
            cancelled: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Durability failures are the only ones that abort a run.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone)]
struct Job {
    wallet: Address,
    since: TimeMs,
    attempt: u32,
}

type JobResult = (Job, Result<TargetSyncReport, TargetSyncError>);

/// Drives sync runs. The coordinating loop is the only writer of the
/// checkpoint; workers return their results to it.
#[derive(Clone)]
pub struct SyncOrchestrator {
    syncer: TargetSyncer,
    checkpoints: CheckpointManager,
    settings: SyncSettings,
    status: StatusBoard,
}

impl SyncOrchestrator {
    pub fn new(syncer: TargetSyncer, checkpoints: CheckpointManager, settings: SyncSettings) -> Self {
        Self {
            syncer,
            checkpoints,
            settings,
            status: StatusBoard::new(),
        }
    }

    /// Publish progress to `status` as the run advances.
    pub fn with_status_board(mut self, status: StatusBoard) -> Self {
        self.status = status;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Resume from the durable checkpoint (or start fresh) and fold in the
    /// current external roster.
    ///
    /// # Errors
    /// Refuses to continue from a corrupt checkpoint.
    pub async fn load_checkpoint(
        &self,
        roster: impl IntoIterator<Item = Address>,
    ) -> Result<Checkpoint, OrchestrationError> {
        let mut checkpoint = self.checkpoints.load()?.unwrap_or_default();
        let added = checkpoint.merge_roster(roster);
        if added > 0 {
            info!(added, total = checkpoint.targets().len(), "Discovered new sync targets");
        }
        self.status.publish(&checkpoint).await;
        Ok(checkpoint)
    }

    /// Sync every pending/failed target from its stored watermark.
    /// Completed targets are not touched.
    pub async fn run_bulk(
        &self,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, OrchestrationError> {
        let jobs: Vec<Job> = checkpoint
            .targets()
            .iter()
            .filter(|t| t.needs_bulk_sync())
            .map(|t| Job {
                wallet: t.wallet.clone(),
                since: t.watermark.unwrap_or_default(),
                attempt: 0,
            })
            .collect();
        let skipped_targets = checkpoint.targets().len() - jobs.len();

        self.run(checkpoint, jobs, skipped_targets, RunMode::Bulk, cancel)
            .await
    }

    /// Sync every target, fetching only events at or after its watermark
    /// (or the given override). Safe to repeat: with no new upstream events
    /// it writes nothing.
    pub async fn run_incremental(
        &self,
        checkpoint: &mut Checkpoint,
        since_overrides: &HashMap<Address, TimeMs>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, OrchestrationError> {
        checkpoint.reset_all();
        let jobs: Vec<Job> = checkpoint
            .targets()
            .iter()
            .map(|t| Job {
                wallet: t.wallet.clone(),
                since: since_overrides
                    .get(&t.wallet)
                    .copied()
                    .or(t.watermark)
                    .unwrap_or_default(),
                attempt: 0,
            })
            .collect();

        self.run(checkpoint, jobs, 0, RunMode::Incremental, cancel)
            .await
    }

    async fn run(
        &self,
        checkpoint: &mut Checkpoint,
        jobs: Vec<Job>,
        skipped_targets: usize,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, OrchestrationError> {
        let run_id = Uuid::new_v4();
        checkpoint.run_id = run_id;
        let concurrency = self.settings.concurrency.max(1);
        let batch_size = self.settings.batch_size.max(1);

        let mut summary = RunSummary::new(run_id, mode, self.settings.dry_run);
        summary.queued = jobs.len();
        summary.skipped_targets = skipped_targets;

        info!(
            run_id = %run_id,
            mode = ?mode,
            queued = jobs.len(),
            skipped = skipped_targets,
            concurrency,
            dry_run = self.settings.dry_run,
            "Sync run starting"
        );

        let mut ready: VecDeque<Job> = jobs.into();
        let mut in_flight: JoinSet<JobResult> = JoinSet::new();
        let mut retry_timers: JoinSet<Job> = JoinSet::new();
        let mut since_save = 0usize;

        loop {
            while !cancel.is_cancelled() && in_flight.len() < concurrency {
                let Some(job) = ready.pop_front() else {
                    break;
                };
                checkpoint.begin(&job.wallet);
                self.spawn_job(&mut in_flight, job);
            }

            let stopping = cancel.is_cancelled();
            if in_flight.is_empty() && (stopping || (ready.is_empty() && retry_timers.is_empty())) {
                break;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let (job, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            // Panics are caught inside the task; this is an abort.
                            error!(run_id = %run_id, error = %e, "Sync task lost");
                            continue;
                        }
                    };
                    if self.handle_result(checkpoint, &mut summary, &mut retry_timers, job, result, cancel) {
                        since_save += 1;
                    }
                    if since_save >= batch_size {
                        self.persist(checkpoint).await?;
                        since_save = 0;
                    }
                }
                Some(timer) = retry_timers.join_next(), if !retry_timers.is_empty() && !stopping => {
                    if let Ok(job) = timer {
                        ready.push_back(job);
                    }
                }
                _ = cancel.cancelled(), if !stopping => {
                    info!(run_id = %run_id, in_flight = in_flight.len(), "Cancellation requested, draining in-flight targets");
                }
            }
        }

        retry_timers.abort_all();
        summary.cancelled = cancel.is_cancelled();

        // Anything still marked syncing lost its worker; record it.
        let lost: Vec<Address> = checkpoint
            .targets()
            .iter()
            .filter(|t| t.state == SyncState::Syncing)
            .map(|t| t.wallet.clone())
            .collect();
        for wallet in lost {
            checkpoint.advance(
                &wallet,
                None,
                SyncOutcome::Failed {
                    error: "sync task lost".to_string(),
                },
            );
            summary.failed += 1;
        }
        summary.pending = summary.queued - summary.completed - summary.failed;

        self.persist(checkpoint).await?;

        info!(
            run_id = %run_id,
            completed = summary.completed,
            failed = summary.failed,
            pending = summary.pending,
            skipped_targets = summary.skipped_targets,
            skipped_records = summary.skipped_records,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            retries = summary.retries,
            cancelled = summary.cancelled,
            "Sync run finished"
        );
        Ok(summary)
    }

    fn spawn_job(&self, in_flight: &mut JoinSet<JobResult>, job: Job) {
        let syncer = self.syncer.clone();
        in_flight.spawn(async move {
            let result = AssertUnwindSafe(syncer.sync_target(&job.wallet, job.since))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(TargetSyncError::Panicked(panic_payload_to_string(
                        payload.as_ref(),
                    )))
                });
            (job, result)
        });
    }

    /// Apply one worker result. Returns true when the target reached a
    /// terminal state.
    fn handle_result(
        &self,
        checkpoint: &mut Checkpoint,
        summary: &mut RunSummary,
        retry_timers: &mut JoinSet<Job>,
        job: Job,
        result: Result<TargetSyncReport, TargetSyncError>,
        cancel: &CancellationToken,
    ) -> bool {
        match result {
            Ok(report) => {
                checkpoint.record_skipped(report.skipped);
                checkpoint.advance(
                    &job.wallet,
                    report.new_watermark,
                    SyncOutcome::Completed {
                        inserted: report.store.inserted,
                    },
                );
                summary.completed += 1;
                summary.skipped_records += report.skipped;
                summary.inserted += report.store.inserted;
                summary.duplicates += report.store.duplicates;
                true
            }
            Err(e) if e.is_transient() && cancel.is_cancelled() => {
                // Left pending for the next run rather than failed.
                checkpoint.record_retry(&job.wallet, e.to_string());
                false
            }
            Err(e) if e.is_transient() && job.attempt + 1 < self.settings.retry_ceiling => {
                let delay = self.settings.retry_delay(job.attempt);
                warn!(
                    wallet = %job.wallet,
                    attempt = job.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient sync failure, re-enqueueing"
                );
                checkpoint.record_retry(&job.wallet, e.to_string());
                summary.retries += 1;
                let next = Job {
                    attempt: job.attempt + 1,
                    ..job
                };
                retry_timers.spawn(async move {
                    tokio::time::sleep(delay).await;
                    next
                });
                false
            }
            Err(e) => {
                warn!(
                    wallet = %job.wallet,
                    attempts = job.attempt + 1,
                    error = %e,
                    "Target sync failed"
                );
                checkpoint.advance(
                    &job.wallet,
                    None,
                    SyncOutcome::Failed {
                        error: e.to_string(),
                    },
                );
                summary.failed += 1;
                true
            }
        }
    }

    /// Save (unless dry-run) and publish the checkpoint.
    async fn persist(&self, checkpoint: &mut Checkpoint) -> Result<(), OrchestrationError> {
        if !self.settings.dry_run {
            self.checkpoints.save_async(checkpoint).await.map_err(|e| {
                error!(
                    path = %self.checkpoints.path().display(),
                    error = %e,
                    "Checkpoint save failed, aborting run"
                );
                e
            })?;
        }
        self.status.publish(checkpoint).await;
        Ok(())
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EventAdapter;
    use crate::datasource::{DataSourceError, MockEventSource};
    use crate::db::migrations::init_db;
    use crate::db::Repository;
    use crate::domain::RawEvent;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        repo: Arc<Repository>,
        checkpoint_path: std::path::PathBuf,
        _temp: TempDir,
    }

    async fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("test.db").to_string_lossy().to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        Harness {
            repo: Arc::new(Repository::new(pool)),
            checkpoint_path: temp.path().join("checkpoint.json"),
            _temp: temp,
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            concurrency: 4,
            retry_ceiling: 3,
            batch_size: 2,
            page_size: 10,
            fetch_timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(1),
            dry_run: false,
        }
    }

    fn orchestrator(h: &Harness, source: MockEventSource, settings: SyncSettings) -> SyncOrchestrator {
        let syncer = TargetSyncer::new(
            Arc::new(source),
            h.repo.clone(),
            Arc::new(EventAdapter::default()),
            settings.page_size,
            settings.fetch_timeout,
            settings.dry_run,
        );
        SyncOrchestrator::new(syncer, CheckpointManager::new(&h.checkpoint_path), settings)
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

    #[tokio::test]
    async fn test_bulk_run_completes_targets_and_saves() {
        let h = harness().await;
        let w1 = Address::new("0x1");
        let w2 = Address::new("0x2");
        let source = MockEventSource::new()
            .with_events(&w1, vec![trade("a", 100), trade("b", 200)])
            .with_events(&w2, vec![trade("c", 300)]);
        let orch = orchestrator(&h, source, settings());

        let mut checkpoint = orch.load_checkpoint([w1.clone(), w2.clone()]).await.unwrap();
        let summary = orch
            .run_bulk(&mut checkpoint, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.pending, 0);
        let t1 = checkpoint.target(&w1).unwrap();
        assert_eq!(t1.state, SyncState::Completed);
        assert_eq!(t1.watermark, Some(TimeMs::from_secs(200)));
        assert_eq!(t1.trade_count, 2);

        let saved = CheckpointManager::new(&h.checkpoint_path).load().unwrap().unwrap();
        assert_eq!(saved.run_id, summary.run_id);
        assert_eq!(saved.state_counts().completed, 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_within_ceiling() {
        let h = harness().await;
        let w = Address::new("0x1");
        let source = MockEventSource::new()
            .with_events(&w, vec![trade("a", 100)])
            .with_failures(&w, 2, DataSourceError::RateLimited);
        let orch = orchestrator(&h, source, settings());

        let mut checkpoint = orch.load_checkpoint([w.clone()]).await.unwrap();
        let summary = orch
            .run_bulk(&mut checkpoint, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.retries, 2);
        let target = checkpoint.target(&w).unwrap();
        assert_eq!(target.state, SyncState::Completed);
        assert_eq!(target.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed_and_run_continues() {
        let h = harness().await;
        let bad = Address::new("0xbad");
        let good = Address::new("0x900d");
        let source = MockEventSource::new()
            .with_events(&good, vec![trade("a", 100)])
            .with_failures(&bad, 10, DataSourceError::Timeout);
        let orch = orchestrator(&h, source, settings());

        let mut checkpoint = orch.load_checkpoint([bad.clone(), good.clone()]).await.unwrap();
        let summary = orch
            .run_bulk(&mut checkpoint, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        let target = checkpoint.target(&bad).unwrap();
        assert_eq!(target.state, SyncState::Failed);
        assert_eq!(target.consecutive_errors, 3);
        assert_eq!(target.last_error.as_deref(), Some("fetch failed: Timed out"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness().await;
        let w = Address::new("0x1");
        let source = MockEventSource::new().with_failures(
            &w,
            1,
            DataSourceError::HttpError {
                status: 404,
                message: "Client error".to_string(),
            },
        );
        let orch = orchestrator(&h, source, settings());

        let mut checkpoint = orch.load_checkpoint([w.clone()]).await.unwrap();
        let summary = orch
            .run_bulk(&mut checkpoint, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retries, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_all_pending() {
        let h = harness().await;
        let w = Address::new("0x1");
        let orch = orchestrator(&h, MockEventSource::new(), settings());

        let mut checkpoint = orch.load_checkpoint([w.clone()]).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orch.run_bulk(&mut checkpoint, &cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.pending, 1);
        assert_eq!(checkpoint.target(&w).unwrap().state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_dry_run_saves_no_checkpoint() {
        let h = harness().await;
        let w = Address::new("0x1");
        let source = MockEventSource::new().with_events(&w, vec![trade("a", 100)]);
        let orch = orchestrator(
            &h,
            source,
            SyncSettings {
                dry_run: true,
                ..settings()
            },
        );

        let mut checkpoint = orch.load_checkpoint([w.clone()]).await.unwrap();
        let summary = orch
            .run_bulk(&mut checkpoint, &CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.inserted, 0);
        assert!(!h.checkpoint_path.exists());
        assert_eq!(h.repo.count_wallet_fills(&w).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_skips_completed_targets() {
        let h = harness().await;
        let w = Address::new("0x1");
        let source = MockEventSource::new().with_events(&w, vec![trade("a", 100)]);
        let orch = orchestrator(&h, source, settings());

        let mut checkpoint = orch.load_checkpoint([w.clone()]).await.unwrap();
        orch.run_bulk(&mut checkpoint, &CancellationToken::new())
            .await
            .unwrap();
        let second = orch
            .run_bulk(&mut checkpoint, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(second.queued, 0);
        assert_eq!(second.skipped_targets, 1);
    }

    #[test]
    fn test_panic_payload_to_string() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_payload_to_string(payload.as_ref()), "bang");
    }
}
