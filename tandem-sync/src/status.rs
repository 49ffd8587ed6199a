//! Tri-state sync indicator.
//!
//! A pure projection of batcher and resolver state. Consumers should treat it
//! as best-effort: `Synchronized` means the server accepted the latest flush,
//! not that every peer has received it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Synchronized,
    Saving,
    Unsynchronized,
}

impl SyncStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Synchronized => "synchronized",
            Self::Saving => "saving",
            Self::Unsynchronized => "unsynchronized",
        }
    }
}

/// Inputs to the status projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSignals {
    pub online: bool,
    /// Local edits not yet covered by a sent flush
    pub dirty: bool,
    /// Last flush was rejected or never acknowledged
    pub failed: bool,
    /// A flush is awaiting its acknowledgment
    pub in_flight: bool,
    /// A debounce timer is pending
    pub batching: bool,
    /// Waiting for the authoritative copy after reconnecting
    pub reconciling: bool,
}

impl StatusSignals {
    pub fn project(self) -> SyncStatus {
        if self.failed || (self.dirty && (!self.online || self.reconciling)) {
            return SyncStatus::Unsynchronized;
        }
        if self.in_flight || self.batching {
            return SyncStatus::Saving;
        }
        if self.dirty {
            return SyncStatus::Unsynchronized;
        }
        SyncStatus::Synchronized
    }
}

/// Publishes status changes to any number of UI observers.
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::Synchronized);
        Self { tx }
    }

    /// Publish `status`; observers are only woken on an actual change.
    pub fn publish(&self, status: SyncStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                log::debug!("sync status: {} -> {}", current.label(), status.label());
                *current = status;
                true
            }
        })
    }

    pub fn current(&self) -> SyncStatus {
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
