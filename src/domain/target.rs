//! Sync targets: one wallet kept in sync with the remote event source.

use crate::domain::{Address, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-target sync state.
///
/// `pending -> syncing -> {completed | failed}`; `failed` and `completed`
/// re-enter `pending` only through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Syncing => "syncing",
            SyncState::Completed => "completed",
            SyncState::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SyncState::Pending),
            "syncing" => Ok(SyncState::Syncing),
            "completed" => Ok(SyncState::Completed),
            "failed" => Ok(SyncState::Failed),
            other => Err(format!("unknown sync state: {}", other)),
        }
    }
}

/// Terminal result of one sync attempt, as reported to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { inserted: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub wallet: Address,
    pub state: SyncState,
    /// Timestamp of the latest ingested event.
    pub watermark: Option<TimeMs>,
    pub last_synced_at: Option<TimeMs>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    /// Canonical records newly inserted for this wallet over its lifetime.
    pub trade_count: u64,
}

impl SyncTarget {
    pub fn new(wallet: Address) -> Self {
        Self {
            wallet,
            state: SyncState::Pending,
            watermark: None,
            last_synced_at: None,
            consecutive_errors: 0,
            last_error: None,
            trade_count: 0,
        }
    }

    /// Whether a bulk run should pick this target up.
    pub fn needs_bulk_sync(&self) -> bool {
        matches!(
            self.state,
            SyncState::Pending | SyncState::Failed | SyncState::Syncing
        )
    }

    /// Explicit reset back to `pending`; error history is kept.
    pub fn reset(&mut self) {
        self.state = SyncState::Pending;
    }
}
