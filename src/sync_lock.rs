//! Single-flight guard for sync passes.
//!
//! At most one pass (sync or remote repair) may run per `SyncLock`. A second
//! caller gets `NotesError::Locked` right away instead of queueing. The slot
//! is released when the returned guard drops, so every exit path of a pass
//! (success, error, cancellation, panic unwind) frees it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{NotesError, NotesResult};

#[derive(Debug, Clone, Default)]
pub struct SyncLock {
    held: Arc<AtomicBool>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot or fail with `Locked`
    pub fn try_acquire(&self) -> NotesResult<SyncLockGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| NotesError::Locked)?;
        tracing::trace!("Sync lock acquired");
        Ok(SyncLockGuard {
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the sync slot on drop
#[derive(Debug)]
pub struct SyncLockGuard {
    held: Arc<AtomicBool>,
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
        tracing::trace!("Sync lock released");
    }
}
