//! One-off data repairs that run outside the regular sync pipeline.
//!
//! Both repairs only ever move records toward a state the pipeline already
//! handles, so running them again finds nothing left to fix.

use serde::Serialize;
use uuid::Uuid;

use crate::database::Database;
use crate::error::NotesResult;
use crate::models::{EntityKind, SourceType};
use crate::remote::RemoteBackend;

/// Counts of remote rows flipped from `pending` to `synced`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStatusRepair {
    pub notes: usize,
    pub folders: usize,
}

impl RemoteStatusRepair {
    pub fn total(&self) -> usize {
        self.notes + self.folders
    }
}

/// Re-flag audio and recording notes that were saved without a sync status.
///
/// Older builds created these notes without ever setting `pending`, so the
/// upload phase never picked them up. Returns how many notes were fixed.
pub fn fix_audio_sync(db: &Database) -> NotesResult<usize> {
    let fixed = db.connection().execute(
        "UPDATE notes SET sync_status = 'pending' WHERE source_type IN (?, ?) AND sync_status IS NULL",
        [SourceType::Audio.as_str(), SourceType::Recording.as_str()],
    )?;

    if fixed > 0 {
        tracing::info!("Re-flagged {} audio notes for upload", fixed);
    } else {
        tracing::debug!("No audio notes needed re-flagging");
    }
    Ok(fixed)
}

/// Clear remote rows of `user_id` that were stored with `sync_status = pending`.
///
/// The remote copy of a row is by definition confirmed, so a `pending` there
/// is stale bookkeeping written by older clients.
pub async fn fix_remote_status<R: RemoteBackend>(
    remote: &R,
    user_id: Uuid,
) -> NotesResult<RemoteStatusRepair> {
    let mut repair = RemoteStatusRepair::default();

    for kind in [EntityKind::Folder, EntityKind::Note] {
        let ids = remote.fetch_remote_pending_ids(kind, user_id).await?;
        if ids.is_empty() {
            continue;
        }
        let fixed = remote.mark_remote_synced(kind, &ids).await?;
        tracing::info!("Marked {} remote {} synced", fixed, kind.table());
        match kind {
            EntityKind::Note => repair.notes = fixed,
            EntityKind::Folder => repair.folders = fixed,
        }
    }

    Ok(repair)
}
