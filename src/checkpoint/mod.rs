//! Durable, resumable progress ledger over the sync targets.
//!
//! The checkpoint file is a JSON envelope carrying the serialized body and
//! its sha256. Saves go through a synced temp file and a rename, so a crash
//! mid-write leaves the previous snapshot in place. A file that fails the
//! checksum or does not parse is reported as corrupt and never resumed from.

use crate::domain::{Address, SyncOutcome, SyncState, SyncTarget, TimeMs};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint writer task failed: {0}")]
    Writer(String),
}

/// Progress counters accumulated over the checkpoint's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    /// Dispatches, including in-run retries.
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Malformed records skipped during normalization.
    pub skipped: u64,
}

/// Count of targets per sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run that last wrote this checkpoint.
    pub run_id: Uuid,
    targets: Vec<SyncTarget>,
    #[serde(skip)]
    index: HashMap<Address, usize>,
    pub counters: ProgressCounters,
    pub snapshot_at: TimeMs,
}

impl PartialEq for Checkpoint {
    fn eq(&self, other: &Self) -> bool {
        self.run_id == other.run_id
            && self.targets == other.targets
            && self.counters == other.counters
            && self.snapshot_at == other.snapshot_at
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    body: String,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            targets: Vec::new(),
            index: HashMap::new(),
            counters: ProgressCounters::default(),
            snapshot_at: TimeMs::now(),
        }
    }

    pub fn from_roster(wallets: impl IntoIterator<Item = Address>) -> Self {
        let mut checkpoint = Self::new();
        checkpoint.merge_roster(wallets);
        checkpoint
    }

    /// Add newly discovered wallets as pending targets, preserving order.
    /// Existing targets are never removed. Returns how many were added.
    pub fn merge_roster(&mut self, wallets: impl IntoIterator<Item = Address>) -> usize {
        let mut added = 0;
        for wallet in wallets {
            if self.index.contains_key(&wallet) {
                continue;
            }
            self.index.insert(wallet.clone(), self.targets.len());
            self.targets.push(SyncTarget::new(wallet));
            added += 1;
        }
        added
    }

    pub fn targets(&self) -> &[SyncTarget] {
        &self.targets
    }

    pub fn target(&self, wallet: &Address) -> Option<&SyncTarget> {
        self.index.get(wallet).map(|&i| &self.targets[i])
    }

    fn target_mut(&mut self, wallet: &Address) -> Option<&mut SyncTarget> {
        match self.index.get(wallet) {
            Some(&i) => self.targets.get_mut(i),
            None => None,
        }
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for target in &self.targets {
            match target.state {
                SyncState::Pending => counts.pending += 1,
                SyncState::Syncing => counts.syncing += 1,
                SyncState::Completed => counts.completed += 1,
                SyncState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Mark a target as dispatched.
    pub fn begin(&mut self, wallet: &Address) -> bool {
        let Some(target) = self.target_mut(wallet) else {
            return false;
        };
        target.state = SyncState::Syncing;
        self.counters.attempted += 1;
        true
    }

    /// Record a terminal outcome for a target.
    ///
    /// A completed sync moves the watermark forward (never backward) and
    /// clears the error streak; a failure keeps the watermark untouched.
    pub fn advance(
        &mut self,
        wallet: &Address,
        new_watermark: Option<TimeMs>,
        outcome: SyncOutcome,
    ) -> bool {
        let now = TimeMs::now();
        let Some(target) = self.target_mut(wallet) else {
            warn!(wallet = %wallet, "Outcome for unknown sync target ignored");
            return false;
        };

        match outcome {
            SyncOutcome::Completed { inserted } => {
                target.state = SyncState::Completed;
                if let Some(w) = new_watermark {
                    target.watermark = Some(target.watermark.map_or(w, |old| old.max(w)));
                }
                target.last_synced_at = Some(now);
                target.consecutive_errors = 0;
                target.last_error = None;
                target.trade_count += inserted;
                self.counters.succeeded += 1;
            }
            SyncOutcome::Failed { error } => {
                target.state = SyncState::Failed;
                target.consecutive_errors += 1;
                target.last_error = Some(error);
                self.counters.failed += 1;
            }
        }
        true
    }

    /// Record a failed attempt that will be retried within the same run.
    pub fn record_retry(&mut self, wallet: &Address, error: String) {
        if let Some(target) = self.target_mut(wallet) {
            target.state = SyncState::Pending;
            target.consecutive_errors += 1;
            target.last_error = Some(error);
        }
    }

    pub fn record_skipped(&mut self, skipped: u64) {
        self.counters.skipped += skipped;
    }

    /// Explicitly reset targets back to `pending`.
    pub fn reset<'a>(&mut self, wallets: impl IntoIterator<Item = &'a Address>) {
        for wallet in wallets {
            if let Some(target) = self.target_mut(wallet) {
                target.reset();
            }
        }
    }

    pub fn reset_all(&mut self) {
        for target in &mut self.targets {
            target.reset();
        }
    }

    fn rebuild_index(&mut self) -> Result<(), String> {
        self.index.clear();
        for (i, target) in self.targets.iter().enumerate() {
            if self.index.insert(target.wallet.clone(), i).is_some() {
                return Err(format!("duplicate target {}", target.wallet));
            }
        }
        Ok(())
    }

    /// Targets left `syncing` by an interrupted run are re-queued.
    fn requeue_in_flight(&mut self) -> usize {
        let mut requeued = 0;
        for target in &mut self.targets {
            if target.state == SyncState::Syncing {
                target.state = SyncState::Pending;
                requeued += 1;
            }
        }
        requeued
    }
}

/// Loads and atomically saves the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> CheckpointError {
        CheckpointError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Load the last durable snapshot, or None when none exists yet.
    ///
    /// # Errors
    /// `Corrupt` when the file exists but cannot be trusted.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(&self.path, e)),
        };

        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| self.corrupt(format!("unreadable envelope: {}", e)))?;
        if envelope.version != CHECKPOINT_VERSION {
            return Err(self.corrupt(format!("unsupported version {}", envelope.version)));
        }
        let actual = checksum(&envelope.body);
        if actual != envelope.checksum {
            return Err(self.corrupt(format!(
                "checksum mismatch (stored {}, computed {})",
                envelope.checksum, actual
            )));
        }

        let mut checkpoint: Checkpoint = serde_json::from_str(&envelope.body)
            .map_err(|e| self.corrupt(format!("unreadable body: {}", e)))?;
        checkpoint.rebuild_index().map_err(|e| self.corrupt(e))?;

        let requeued = checkpoint.requeue_in_flight();
        info!(
            path = %self.path.display(),
            targets = checkpoint.targets.len(),
            requeued,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Durably replace the checkpoint file with `checkpoint`.
    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.snapshot_at = TimeMs::now();
        let body = serde_json::to_string(checkpoint)?;
        let envelope = Envelope {
            version: CHECKPOINT_VERSION,
            checksum: checksum(&body),
            body,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(parent, e))?;
            }
        }

        let temp_path = self.temp_path();
        {
            let mut file = File::create(&temp_path).map_err(|e| self.io_err(&temp_path, e))?;
            file.write_all(&bytes)
                .map_err(|e| self.io_err(&temp_path, e))?;
            file.sync_all().map_err(|e| self.io_err(&temp_path, e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| self.io_err(&self.path, e))?;

        debug!(
            path = %self.path.display(),
            targets = checkpoint.targets.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// [`save`](Self::save) on the blocking pool, for callers on an async worker.
    pub async fn save_async(&self, checkpoint: &mut Checkpoint) -> Result<(), CheckpointError> {
        let manager = self.clone();
        let mut snapshot = checkpoint.clone();
        let snapshot_at = tokio::task::spawn_blocking(move || {
            manager.save(&mut snapshot).map(|()| snapshot.snapshot_at)
        })
        .await
        .map_err(|e| CheckpointError::Writer(e.to_string()))??;
        checkpoint.snapshot_at = snapshot_at;
        Ok(())
    }
}

fn checksum(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}
