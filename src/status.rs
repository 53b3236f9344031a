//! Sync status observable.
//!
//! A single process-wide value (`idle` | `syncing` | `offline`) published
//! over a watch channel so any number of local observers (status bars,
//! diagnostics) can follow synchronizer state without polling. The value is
//! process-lifetime only and never persisted.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Current state of the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Offline,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Offline => "offline",
        }
    }
}

/// Publisher side of the status observable.
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::Idle);
        Self { tx }
    }

    /// Publish a new status. No-op when unchanged, so observers only wake
    /// on real transitions.
    pub fn set(&self, status: SyncStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(status = status.as_str(), "sync status changed");
        }
    }

    pub fn get(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}
