//! Sync orchestration: bounded-concurrency fetch/normalize/write runs over
//! the checkpointed target set.

use crate::checkpoint::Checkpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub mod ingest;
pub mod orchestrator;

pub use ingest::{TargetSyncError, TargetSyncReport, TargetSyncer};
pub use orchestrator::{OrchestrationError, RunMode, RunSummary, SyncOrchestrator};

/// Explicit run parameters; nothing here is read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Maximum targets in flight at once.
    pub concurrency: usize,
    /// Attempts per target per run.
    pub retry_ceiling: u32,
    /// Terminal outcomes between checkpoint saves.
    pub batch_size: usize,
    pub page_size: usize,
    pub fetch_timeout: Duration,
    /// First re-enqueue delay; doubles per attempt up to `MAX_RETRY_DELAY`.
    pub retry_base_delay: Duration,
    pub dry_run: bool,
}

pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: 32,
            retry_ceiling: 3,
            batch_size: 10,
            page_size: 500,
            fetch_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(500),
            dry_run: false,
        }
    }
}

impl SyncSettings {
    /// Delay before re-enqueueing a target whose `attempt` (0-based) failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

/// Latest published checkpoint, read by the observability API.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Option<Checkpoint>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, checkpoint: &Checkpoint) {
        *self.inner.write().await = Some(checkpoint.clone());
    }

    pub async fn snapshot(&self) -> Option<Checkpoint> {
        self.inner.read().await.clone()
    }
}
