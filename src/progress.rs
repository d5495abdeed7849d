//! Sync progress publication.
//!
//! The orchestrator reports through a `ProgressTracker`; UI layers hold a
//! `watch::Receiver<SyncProgress>` and always see a whole snapshot. Each
//! update edits the snapshot in place under the channel's write lock, so a
//! reader never observes a half-applied change and concurrent updates do not
//! overwrite each other. Updates happen at batch boundaries, after the
//! batch's local transaction has committed.
//!
//! Completion is announced separately as a `SyncEvent` on a broadcast
//! channel, which is what list views listen to for a refresh.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Capacity of the completion event channel. Slow receivers skip old events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Share of the overall bar spent on the upload phase of a two-way pass
const UPLOAD_SHARE: f64 = 0.5;

/// Observable state of the current (or last) sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Overall ratio in [0, 1]
    pub progress: f64,
    pub status: String,
    pub synced_notes: usize,
    pub total_notes: usize,
    pub synced_folders: usize,
    pub total_folders: usize,
    pub downloaded: usize,
    pub total_download: usize,
    pub is_downloading: bool,
    pub conflicts_resolved: usize,
}

/// Announced once per pass when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Completed { summary: String },
    Failed { message: String },
}

pub struct ProgressTracker {
    snapshot: watch::Sender<SyncProgress>,
    events: broadcast::Sender<SyncEvent>,
    two_way: AtomicBool,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(SyncProgress::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            snapshot,
            events,
            two_way: AtomicBool::new(true),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Current snapshot
    pub fn current(&self) -> SyncProgress {
        self.snapshot.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut SyncProgress)) {
        self.snapshot.send_modify(|p| {
            f(p);
            p.progress = p.progress.clamp(0.0, 1.0);
        });
    }

    /// Reset for a new pass
    pub fn start_pass(&self, two_way: bool) {
        self.two_way.store(two_way, Ordering::Relaxed);
        self.snapshot.send_replace(SyncProgress {
            status: "Preparing sync...".to_string(),
            ..Default::default()
        });
    }

    pub fn upload_started(&self, total_notes: usize, total_folders: usize) {
        self.update(|p| {
            p.status = "Uploading changes...".to_string();
            p.total_notes = total_notes;
            p.total_folders = total_folders;
            p.progress = 0.0;
        });
    }

    /// A batch of records was acknowledged and marked synced
    pub fn records_pushed(&self, notes: usize, folders: usize) {
        let upload_span = if self.two_way.load(Ordering::Relaxed) {
            UPLOAD_SHARE
        } else {
            1.0
        };
        self.update(|p| {
            p.synced_notes += notes;
            p.synced_folders += folders;
            let total = p.total_notes + p.total_folders;
            if total > 0 {
                let done = (p.synced_notes + p.synced_folders) as f64 / total as f64;
                p.progress = done * upload_span;
            }
            p.status = format!(
                "Uploaded {} of {} changes",
                p.synced_notes + p.synced_folders,
                total
            );
        });
    }

    pub fn download_started(&self, total: usize) {
        self.update(|p| {
            p.is_downloading = true;
            p.total_download = total;
            p.progress = UPLOAD_SHARE;
            p.status = "Downloading changes...".to_string();
        });
    }

    /// A batch of remote records was committed locally
    pub fn records_pulled(&self, count: usize, conflicts: usize) {
        self.update(|p| {
            p.downloaded += count;
            p.conflicts_resolved += conflicts;
            if p.total_download > 0 {
                let done = p.downloaded as f64 / p.total_download as f64;
                p.progress = UPLOAD_SHARE + done * (1.0 - UPLOAD_SHARE);
            }
            p.status = format!("Downloaded {} of {}", p.downloaded, p.total_download);
        });
    }

    pub fn complete(&self, summary: &str) {
        self.update(|p| {
            p.progress = 1.0;
            p.is_downloading = false;
            p.status = summary.to_string();
        });
        // No receivers is fine
        let _ = self.events.send(SyncEvent::Completed {
            summary: summary.to_string(),
        });
    }

    pub fn fail(&self, message: &str) {
        self.update(|p| {
            p.is_downloading = false;
            p.status = message.to_string();
        });
        let _ = self.events.send(SyncEvent::Failed {
            message: message.to_string(),
        });
    }
}
