//! Sync orchestrator for notesync.
//!
//! A pass runs these phases in order:
//! 1. take the single sync slot (fails fast with `Locked`)
//! 2. merge duplicate all-notes folders
//! 3. upload: push locally dirty folders, then notes, in batches; records of
//!    an acknowledged batch are marked `synced`
//! 4. download (two-way only): pull remote changes since the watermark,
//!    fetch the records the watermark cannot see (edited offline before it,
//!    or held back during upload), resolve each against its local copy and
//!    commit batch by batch
//! 5. persist the new watermark, only if nothing failed
//!
//! A failed batch does not stop the batches after it. The pass then ends
//! with `PartialBatchFailure`, and the records of the failed batches stay
//! `pending` for the next pass. Authentication failures and cancellation
//! end the pass at once.
//!
//! The database mutex is never held across an await point.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, SyncOptions};
use crate::conflicts::{remote_is_ahead, remote_supersedes, resolve, Winner};
use crate::database::{apply_remote, mark_pending, Database, LocalRecord};
use crate::error::{NotesError, NotesResult};
use crate::models::{now_millis, EntityKind, Folder, Note};
use crate::progress::{ProgressTracker, SyncEvent, SyncProgress};
use crate::remote::{Pulled, PushOutcome, RemoteBackend};
use crate::repair::{self, RemoteStatusRepair};
use crate::sync_lock::SyncLock;
use crate::UUID_SHORT_LEN;

/// How far the pull watermark is moved back to cover clock skew and writes
/// that were in flight when the previous pass started
const WATERMARK_OVERLAP_SECS: i64 = 2;

const DEFAULT_BATCH_SIZE: usize = 50;

/// Outcome of a successful pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub notes_pushed: usize,
    pub folders_pushed: usize,
    /// Dirty records held back because the remote already had a winning version
    pub deferred: usize,
    pub notes_pulled: usize,
    pub folders_pulled: usize,
    /// Pulled records the watermark filter missed, fetched by id
    pub caught_up: usize,
    pub conflicts_resolved: usize,
    pub duplicate_folders_merged: usize,
    pub summary: String,
}

impl SyncReport {
    fn describe(&self) -> String {
        let pushed = self.notes_pushed + self.folders_pushed;
        let pulled = self.notes_pulled + self.folders_pulled;
        if pushed == 0 && pulled == 0 {
            return "Everything is up to date".to_string();
        }

        let mut summary = format!("Sync complete: {} uploaded, {} downloaded", pushed, pulled);
        if self.conflicts_resolved > 0 {
            summary.push_str(&format!(
                ", {} conflict{} resolved",
                self.conflicts_resolved,
                if self.conflicts_resolved == 1 { "" } else { "s" }
            ));
        }
        summary
    }
}

/// Per-pass batch bookkeeping
#[derive(Debug, Default)]
struct BatchLedger {
    total: usize,
    failures: Vec<NotesError>,
}

impl BatchLedger {
    fn started(&mut self) {
        self.total += 1;
    }

    /// Record a failed batch. Errors that make every later batch pointless
    /// are handed back so the pass ends now.
    fn failed(&mut self, err: NotesError) -> NotesResult<()> {
        if err.aborts_pass() {
            return Err(err);
        }
        tracing::warn!("Sync batch failed: {}", err);
        self.failures.push(err);
        Ok(())
    }

    fn into_result(self) -> NotesResult<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let message = self
            .failures
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(NotesError::PartialBatchFailure {
            failed_batches: self.failures.len(),
            total_batches: self.total,
            message,
        })
    }
}

/// Result of pushing one batch. A failure leaves the records after the
/// acknowledged prefix pending.
#[derive(Debug)]
struct PushedBatch {
    acknowledged: usize,
    deferred: usize,
    failure: Option<NotesError>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ApplyStats {
    applied: usize,
    conflicts: usize,
}

/// Drives sync passes between the local store and a remote backend.
pub struct SyncClient<R: RemoteBackend> {
    db: Arc<Mutex<Database>>,
    remote: R,
    user_id: Uuid,
    batch_size: usize,
    lock: SyncLock,
    progress: ProgressTracker,
    cancel: Mutex<CancellationToken>,
}

impl<R: RemoteBackend> SyncClient<R> {
    pub fn new(db: Arc<Mutex<Database>>, remote: R, user_id: Uuid) -> Self {
        Self {
            db,
            remote,
            user_id,
            batch_size: DEFAULT_BATCH_SIZE,
            lock: SyncLock::new(),
            progress: ProgressTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Create a client for the signed-in user of `config`
    pub fn from_config(db: Arc<Mutex<Database>>, remote: R, config: &Config) -> NotesResult<Self> {
        let user_id = config.user_id()?.ok_or(NotesError::AuthenticationRequired)?;
        Ok(Self::new(db, remote, user_id).with_batch_size(config.sync_config().batch_size))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.progress.subscribe_events()
    }

    pub fn is_syncing(&self) -> bool {
        self.lock.is_held()
    }

    /// Ask the running pass to stop. It stops at the next batch boundary;
    /// a batch already being committed finishes first.
    pub fn cancel(&self) {
        match self.cancel.lock() {
            Ok(token) => token.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    fn fresh_cancellation(&self) -> NotesResult<CancellationToken> {
        let mut token = self
            .cancel
            .lock()
            .map_err(|_| NotesError::persistence("cancellation lock poisoned"))?;
        *token = CancellationToken::new();
        Ok(token.clone())
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> NotesResult<T>) -> NotesResult<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| NotesError::persistence("database lock poisoned"))?;
        f(&db)
    }

    /// Run one sync pass.
    pub async fn synchronize(&self, options: SyncOptions) -> NotesResult<SyncReport> {
        let _guard = self.lock.try_acquire()?;
        let cancel = self.fresh_cancellation()?;

        tracing::info!(
            "Sync started for user {} (two-way: {}, binary: {})",
            &self.user_id.simple().to_string()[..UUID_SHORT_LEN],
            options.two_way_sync,
            options.include_binary_data
        );
        self.progress.start_pass(options.two_way_sync);

        let result = self.run_pass(options, &cancel).await;
        match &result {
            Ok(report) => {
                tracing::info!("{}", report.summary);
                self.progress.complete(&report.summary);
            }
            Err(e) => {
                tracing::warn!("Sync failed: {}", e);
                self.progress.fail(&e.user_message());
            }
        }
        result
    }

    async fn run_pass(&self, options: SyncOptions, cancel: &CancellationToken) -> NotesResult<SyncReport> {
        let pass_started = now_millis();
        let mut report = SyncReport::default();
        let mut ledger = BatchLedger::default();

        report.duplicate_folders_merged =
            self.with_db(|db| db.deduplicate_all_notes_folders(self.user_id))?;

        let mut deferred = HashSet::new();
        self.upload(options.include_binary_data, cancel, &mut deferred, &mut report, &mut ledger)
            .await?;

        if options.two_way_sync {
            self.download(&deferred, cancel, &mut report, &mut ledger).await?;
        }

        ledger.into_result()?;

        if options.two_way_sync {
            self.with_db(|db| db.set_watermark(self.user_id, pass_started))?;
        }

        report.summary = report.describe();
        Ok(report)
    }

    fn check_cancelled(cancel: &CancellationToken) -> NotesResult<()> {
        if cancel.is_cancelled() {
            return Err(NotesError::Cancelled);
        }
        Ok(())
    }

    // ========================================================================
    // Upload
    // ========================================================================

    async fn upload(
        &self,
        include_binary: bool,
        cancel: &CancellationToken,
        deferred: &mut HashSet<Uuid>,
        report: &mut SyncReport,
        ledger: &mut BatchLedger,
    ) -> NotesResult<()> {
        let (folders, notes) = self.with_db(|db| {
            let folders: Vec<Folder> = db.fetch_dirty(self.user_id)?;
            let notes: Vec<Note> = db.fetch_dirty(self.user_id)?;
            Ok((folders, notes))
        })?;
        self.progress.upload_started(notes.len(), folders.len());
        tracing::debug!("Uploading {} folders and {} notes", folders.len(), notes.len());

        // Folders first so notes never reference a folder the remote lacks
        for batch in folders.chunks(self.batch_size) {
            Self::check_cancelled(cancel)?;
            ledger.started();
            let pushed = match self.hold_back_superseded(batch).await {
                Ok((to_push, held_back)) => {
                    deferred.extend(held_back.iter().copied());
                    let outcome = if to_push.is_empty() {
                        PushOutcome::default()
                    } else {
                        self.remote.push_folders(&to_push).await
                    };
                    self.settle_push(EntityKind::Folder, outcome, held_back.len())
                }
                Err(e) => Err(e),
            };
            match pushed {
                Ok(pushed) => {
                    report.folders_pushed += pushed.acknowledged;
                    report.deferred += pushed.deferred;
                    self.progress.records_pushed(0, pushed.acknowledged + pushed.deferred);
                    if let Some(e) = pushed.failure {
                        ledger.failed(e)?;
                    }
                }
                Err(e) => ledger.failed(e)?,
            }
        }

        for batch in notes.chunks(self.batch_size) {
            Self::check_cancelled(cancel)?;
            ledger.started();
            let pushed = match self.hold_back_superseded(batch).await {
                Ok((to_push, held_back)) => {
                    deferred.extend(held_back.iter().copied());
                    let outcome = if to_push.is_empty() {
                        PushOutcome::default()
                    } else {
                        self.remote.push_notes(&to_push, include_binary).await
                    };
                    self.settle_push(EntityKind::Note, outcome, held_back.len())
                }
                Err(e) => Err(e),
            };
            match pushed {
                Ok(pushed) => {
                    report.notes_pushed += pushed.acknowledged;
                    report.deferred += pushed.deferred;
                    self.progress.records_pushed(pushed.acknowledged + pushed.deferred, 0);
                    if let Some(e) = pushed.failure {
                        ledger.failed(e)?;
                    }
                }
                Err(e) => ledger.failed(e)?,
            }
        }

        Ok(())
    }

    /// Split off dirty records whose stored remote version would win.
    ///
    /// Pushing those would overwrite the winner, so they stay pending and the
    /// download phase resolves them. Returns the records to push and the ids
    /// held back.
    async fn hold_back_superseded<T: LocalRecord>(&self, batch: &[T]) -> NotesResult<(Vec<T>, Vec<Uuid>)> {
        let ids: Vec<Uuid> = batch.iter().map(|r| r.id()).collect();
        let versions = self.remote.fetch_versions(T::KIND, &ids).await?;

        let mut to_push = Vec::with_capacity(batch.len());
        let mut held_back = Vec::new();
        for record in batch {
            let superseded = versions
                .iter()
                .any(|v| v.id == record.id() && remote_supersedes(record, v));
            if superseded {
                tracing::debug!(
                    "Holding back {:?} {}: remote version wins",
                    T::KIND,
                    &record.id().simple().to_string()[..UUID_SHORT_LEN]
                );
                held_back.push(record.id());
            } else {
                to_push.push(record.clone());
            }
        }
        Ok((to_push, held_back))
    }

    /// Mark the acknowledged prefix of a push synced.
    ///
    /// Records edited while the push was in flight no longer match the pushed
    /// clock and stay pending.
    fn settle_push(&self, kind: EntityKind, outcome: PushOutcome, deferred: usize) -> NotesResult<PushedBatch> {
        let cleared = if outcome.acknowledged.is_empty() {
            0
        } else {
            self.with_db(|db| db.mark_synced(kind, &outcome.acknowledged))?
        };
        if cleared < outcome.acknowledged.len() {
            tracing::debug!(
                "{} pushed {} were edited during the push and stay pending",
                outcome.acknowledged.len() - cleared,
                kind.table()
            );
        }

        Ok(PushedBatch {
            acknowledged: outcome.acknowledged.len(),
            deferred,
            failure: outcome.failure,
        })
    }

    // ========================================================================
    // Download
    // ========================================================================

    async fn download(
        &self,
        deferred: &HashSet<Uuid>,
        cancel: &CancellationToken,
        report: &mut SyncReport,
        ledger: &mut BatchLedger,
    ) -> NotesResult<()> {
        let since = self
            .with_db(|db| db.get_watermark(self.user_id))?
            .map(|watermark| watermark - Duration::seconds(WATERMARK_OVERLAP_SECS));

        Self::check_cancelled(cancel)?;
        let mut folders = self.remote.pull_folders(self.user_id, since).await?;
        Self::check_cancelled(cancel)?;
        let mut notes = self.remote.pull_notes(self.user_id, since).await?;

        // A full pull already saw everything
        if since.is_some() {
            Self::check_cancelled(cancel)?;
            let missed = self.missed_by_pull(&folders.records, deferred).await?;
            if !missed.is_empty() {
                let fetched = self.remote.fetch_folders(&missed).await?;
                report.caught_up += fetched.records.len();
                folders.append(fetched);
            }

            Self::check_cancelled(cancel)?;
            let missed = self.missed_by_pull(&notes.records, deferred).await?;
            if !missed.is_empty() {
                let fetched = self.remote.fetch_notes(&missed).await?;
                report.caught_up += fetched.records.len();
                notes.append(fetched);
            }
        }

        Self::count_malformed(EntityKind::Folder, &folders, ledger)?;
        Self::count_malformed(EntityKind::Note, &notes, ledger)?;

        let (folders, notes) = (folders.records, notes.records);
        self.progress.download_started(folders.len() + notes.len());
        tracing::debug!(
            "Pulled {} folders and {} notes since {:?} ({} caught up)",
            folders.len(),
            notes.len(),
            since,
            report.caught_up
        );

        for batch in folders.chunks(self.batch_size) {
            Self::check_cancelled(cancel)?;
            ledger.started();
            match self.apply_batch(batch) {
                Ok(stats) => {
                    report.folders_pulled += stats.applied;
                    report.conflicts_resolved += stats.conflicts;
                    self.progress.records_pulled(stats.applied, stats.conflicts);
                }
                Err(e) => ledger.failed(e)?,
            }
        }

        for batch in notes.chunks(self.batch_size) {
            Self::check_cancelled(cancel)?;
            ledger.started();
            match self.apply_batch(batch) {
                Ok(stats) => {
                    report.notes_pulled += stats.applied;
                    report.conflicts_resolved += stats.conflicts;
                    self.progress.records_pulled(stats.applied, stats.conflicts);
                }
                Err(e) => ledger.failed(e)?,
            }
        }

        Ok(())
    }

    /// Ids of remote records the watermark pull did not return but this
    /// device still needs.
    ///
    /// A record edited offline is pushed with its edit time, which can be
    /// older than the watermark, so no later pull returns it. Every remote
    /// record missing locally or ahead of its local copy is fetched by id,
    /// and so is every record held back during this pass's upload.
    async fn missed_by_pull<T: LocalRecord>(&self, pulled: &[T], deferred: &HashSet<Uuid>) -> NotesResult<Vec<Uuid>> {
        let remote_versions = self.remote.list_versions(T::KIND, self.user_id).await?;
        let local_versions = self.with_db(|db| db.local_versions(T::KIND, self.user_id))?;
        let pulled: HashSet<Uuid> = pulled.iter().map(|r| r.id()).collect();

        Ok(remote_versions
            .into_iter()
            .filter(|remote| !pulled.contains(&remote.id))
            .filter(|remote| match local_versions.get(&remote.id) {
                Some(local) => deferred.contains(&remote.id) || remote_is_ahead(local, remote),
                None => true,
            })
            .map(|remote| remote.id)
            .collect())
    }

    /// Undecodable rows fail the pass like a failed batch, so the watermark
    /// stays put and they are pulled again next time
    fn count_malformed<T>(kind: EntityKind, pulled: &Pulled<T>, ledger: &mut BatchLedger) -> NotesResult<()> {
        if pulled.malformed == 0 {
            return Ok(());
        }
        ledger.started();
        ledger.failed(NotesError::MalformedRows {
            table: kind.table(),
            count: pulled.malformed,
        })
    }

    /// Resolve and commit one batch of remote records in a single transaction
    fn apply_batch<T: LocalRecord>(&self, batch: &[T]) -> NotesResult<ApplyStats> {
        self.with_db(|db| {
            db.with_transaction(|tx| {
                let mut stats = ApplyStats::default();
                for remote in batch {
                    let local = T::load(tx, remote.id())?;
                    let resolution = resolve(local.as_ref(), remote);
                    match resolution.winner {
                        Winner::TakeRemote => apply_remote(tx, local.as_ref(), remote)?,
                        Winner::KeepLocal => {
                            mark_pending(tx, T::KIND, remote.id())?;
                        }
                    }
                    stats.applied += 1;
                    if resolution.conflict {
                        stats.conflicts += 1;
                    }
                }
                Ok(stats)
            })
        })
    }

    // ========================================================================
    // Repairs
    // ========================================================================

    /// Re-flag audio notes that were never marked pending
    pub fn fix_audio_sync(&self) -> NotesResult<usize> {
        self.with_db(repair::fix_audio_sync)
    }

    /// Clear stale `pending` statuses on the remote. Takes the sync slot, so it
    /// fails with `Locked` while a pass is running.
    pub async fn fix_remote_status(&self) -> NotesResult<RemoteStatusRepair> {
        let _guard = self.lock.try_acquire()?;
        repair::fix_remote_status(&self.remote, self.user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    use crate::models::{SourceType, SyncStatus, ALL_NOTES_FOLDER_NAME};
    use crate::remote::fake::FakeRemote;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn setup() -> (SyncClient<FakeRemote>, Arc<Mutex<Database>>, Uuid) {
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let user_id = Uuid::now_v7();
        let client = SyncClient::new(db.clone(), FakeRemote::new(), user_id);
        (client, db, user_id)
    }

    fn synced_note(user_id: Uuid, title: &str, modified: DateTime<Utc>) -> Note {
        let mut note = Note::new(title, title.as_bytes().to_vec(), SourceType::Text, user_id, None);
        note.created_at = modified;
        note.last_modified = modified;
        note.sync_status = Some(SyncStatus::Synced);
        note
    }

    fn local_note(db: &Arc<Mutex<Database>>, id: Uuid) -> Note {
        db.lock().unwrap().get_note(id, true).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_newer_remote_version_replaces_local() {
        let (client, db, user_id) = setup();
        let local = synced_note(user_id, "Local draft", ts("2024-01-01T00:00:00Z"));
        Note::store(db.lock().unwrap().connection(), &local).unwrap();

        let mut remote = local.clone();
        remote.title = "Edited on tablet".to_string();
        remote.original_content = b"newer body".to_vec();
        remote.last_modified = ts("2024-01-02T00:00:00Z");
        client.remote().insert_note(remote.clone());

        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.notes_pulled, 1);
        assert_eq!(report.conflicts_resolved, 1);

        let stored = local_note(&db, local.id);
        assert_eq!(stored.title, "Edited on tablet");
        assert_eq!(stored.original_content, b"newer body");
        assert_eq!(stored.last_modified, remote.last_modified);
        assert_eq!(stored.sync_status, Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_rest_of_batch_pending() {
        let (client, db, user_id) = setup();
        let base = ts("2024-02-01T09:00:00Z");
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut note = Note::new(format!("Note {}", i), vec![i], SourceType::Text, user_id, None);
            note.last_modified = base + Duration::seconds(i as i64);
            ids.push(db.lock().unwrap().create_note(note).unwrap().id);
        }
        *client.remote().fail_note_write.lock().unwrap() = Some(2);

        let err = client.synchronize(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            NotesError::PartialBatchFailure { failed_batches: 1, .. }
        ));

        assert_eq!(local_note(&db, ids[0]).sync_status, Some(SyncStatus::Synced));
        assert_eq!(local_note(&db, ids[1]).sync_status, Some(SyncStatus::Pending));
        assert_eq!(local_note(&db, ids[2]).sync_status, Some(SyncStatus::Pending));
        assert!(client.remote().note(ids[0]).is_some());
        assert!(client.remote().note(ids[1]).is_none());

        // No partial watermark advancement
        assert!(db.lock().unwrap().get_watermark(user_id).unwrap().is_none());

        // The next pass picks up where this one failed
        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.notes_pushed, 2);
        assert_eq!(db.lock().unwrap().count_pending(EntityKind::Note).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_passes_are_single_flight() {
        let (client, _db, _) = setup();
        *client.remote().pull_delay.lock().unwrap() = Some(std::time::Duration::from_millis(50));

        let (a, b) = tokio::join!(
            client.synchronize(SyncOptions::default()),
            client.synchronize(SyncOptions::default())
        );

        let locked = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(NotesError::Locked)))
            .count();
        assert_eq!(locked, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(client.remote().pulls.load(Ordering::SeqCst), 2);

        // Slot is free again afterwards
        assert!(!client.is_syncing());
        assert!(client.synchronize(SyncOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_tombstone_reaches_remote() {
        let (client, db, user_id) = setup();
        let note = db
            .lock()
            .unwrap()
            .create_note(Note::new("Temp", vec![1], SourceType::Text, user_id, None))
            .unwrap();
        client.synchronize(SyncOptions::default()).await.unwrap();

        db.lock().unwrap().delete_note(note.id).unwrap();
        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.notes_pushed, 1);

        assert!(client.remote().note(note.id).unwrap().deleted_at.is_some());
        let local = local_note(&db, note.id);
        assert!(local.is_deleted());
        assert_eq!(local.sync_status, Some(SyncStatus::Synced));
        assert!(db.lock().unwrap().get_note(note.id, false).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_tombstone_beats_stale_local_edit() {
        let (client, db, user_id) = setup();
        let original = synced_note(user_id, "Shared", ts("2024-03-01T10:00:00Z"));
        Note::store(db.lock().unwrap().connection(), &original).unwrap();

        // Deleted on another device
        let mut tombstone = original.clone();
        tombstone.deleted_at = Some(ts("2024-03-01T11:00:00Z"));
        tombstone.last_modified = ts("2024-03-01T11:00:00Z");
        client.remote().insert_note(tombstone);

        // Edited here later, not yet synced
        let edit = crate::database::NoteUpdate {
            title: Some("Late edit".to_string()),
            ..Default::default()
        };
        db.lock().unwrap().update_note(original.id, edit).unwrap();

        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.notes_pushed, 0);

        // Remote tombstone survived and was applied locally
        assert!(client.remote().note(original.id).unwrap().deleted_at.is_some());
        let local = local_note(&db, original.id);
        assert!(local.is_deleted());
        assert_eq!(local.sync_status, Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_newer_local_edit_survives_download() {
        let (client, db, user_id) = setup();
        let note = db
            .lock()
            .unwrap()
            .create_note(Note::new("Mine", vec![], SourceType::Text, user_id, None))
            .unwrap();

        let mut older = note.clone();
        older.title = "Stale".to_string();
        older.last_modified = note.last_modified - Duration::hours(1);
        client.remote().insert_note(older);

        client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(client.remote().note(note.id).unwrap().title, "Mine");
        assert_eq!(local_note(&db, note.id).title, "Mine");
    }

    #[tokio::test]
    async fn test_one_way_sync_skips_download() {
        let (client, db, user_id) = setup();
        db.lock()
            .unwrap()
            .create_note(Note::new("Up only", vec![], SourceType::Text, user_id, None))
            .unwrap();
        client
            .remote()
            .insert_note(synced_note(user_id, "Remote only", now_millis()));

        let options = SyncOptions {
            include_binary_data: true,
            two_way_sync: false,
        };
        let report = client.synchronize(options).await.unwrap();
        assert_eq!(report.notes_pushed, 1);
        assert_eq!(report.notes_pulled, 0);
        assert_eq!(client.remote().pulls.load(Ordering::SeqCst), 0);
        assert!(db.lock().unwrap().get_watermark(user_id).unwrap().is_none());
        assert_eq!(db.lock().unwrap().get_all_notes(false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_overlap_repulls_recent_changes() {
        let (client, db, user_id) = setup();
        let known = synced_note(user_id, "Seen before", ts("2024-05-01T12:00:00Z"));
        Note::store(db.lock().unwrap().connection(), &known).unwrap();
        client.remote().insert_note(known.clone());
        client.synchronize(SyncOptions::default()).await.unwrap();
        let watermark = db.lock().unwrap().get_watermark(user_id).unwrap().unwrap();

        let late = synced_note(user_id, "Written during last pass", watermark - Duration::seconds(1));
        client.remote().insert_note(late.clone());
        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.notes_pulled, 1);
        assert_eq!(report.caught_up, 0);
        assert!(db.lock().unwrap().get_note(late.id, false).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_edits_older_than_watermark_are_pulled() {
        let (client, db, user_id) = setup();
        let known = synced_note(user_id, "Seen before", ts("2024-05-01T12:00:00Z"));
        Note::store(db.lock().unwrap().connection(), &known).unwrap();
        client.remote().insert_note(known.clone());
        client.synchronize(SyncOptions::default()).await.unwrap();
        let watermark = db.lock().unwrap().get_watermark(user_id).unwrap().unwrap();

        // Another device comes online and pushes work done before our watermark
        let created_offline = synced_note(user_id, "Written on a plane", watermark - Duration::hours(1));
        client.remote().insert_note(created_offline.clone());
        let mut edited_offline = known.clone();
        edited_offline.title = "Edited on a plane".to_string();
        edited_offline.last_modified = watermark - Duration::minutes(30);
        client.remote().insert_note(edited_offline.clone());

        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.caught_up, 2);
        assert_eq!(report.notes_pulled, 2);
        assert_eq!(local_note(&db, created_offline.id).title, "Written on a plane");
        let stored = local_note(&db, known.id);
        assert_eq!(stored.title, "Edited on a plane");
        assert_eq!(stored.last_modified, edited_offline.last_modified);

        // Nothing left to catch up afterwards
        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.caught_up, 0);
    }

    #[tokio::test]
    async fn test_equal_clocks_defer_to_remote_copy() {
        let (client, db, user_id) = setup();
        client.synchronize(SyncOptions::default()).await.unwrap();

        let clock = ts("2024-04-01T08:00:00Z");
        let mut local = synced_note(user_id, "local version", clock);
        local.sync_status = Some(SyncStatus::Pending);
        Note::store(db.lock().unwrap().connection(), &local).unwrap();
        let mut remote = local.clone();
        remote.title = "remote version".to_string();
        remote.sync_status = Some(SyncStatus::Synced);
        client.remote().insert_note(remote);

        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.notes_pushed, 0);
        assert_eq!(report.caught_up, 1);
        assert_eq!(report.conflicts_resolved, 1);

        // The remote copy was not overwritten and replaced the local one
        assert_eq!(client.remote().note(local.id).unwrap().title, "remote version");
        let stored = local_note(&db, local.id);
        assert_eq!(stored.title, "remote version");
        assert_eq!(stored.sync_status, Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_malformed_rows_keep_watermark() {
        let (client, db, user_id) = setup();
        let readable = synced_note(user_id, "Readable", ts("2024-06-01T00:00:00Z"));
        client.remote().insert_note(readable.clone());
        client.remote().malformed_note_rows.store(2, Ordering::SeqCst);

        let err = client.synchronize(SyncOptions::default()).await.unwrap_err();
        match err {
            NotesError::PartialBatchFailure {
                failed_batches,
                message,
                ..
            } => {
                assert_eq!(failed_batches, 1);
                assert!(message.contains("2 notes rows"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Good rows are applied, but the bad ones will be pulled again
        assert_eq!(local_note(&db, readable.id).title, "Readable");
        assert!(db.lock().unwrap().get_watermark(user_id).unwrap().is_none());

        client.remote().malformed_note_rows.store(0, Ordering::SeqCst);
        client.synchronize(SyncOptions::default()).await.unwrap();
        assert!(db.lock().unwrap().get_watermark(user_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remote_folder_deletion_moves_notes_to_all_notes() {
        let (client, db, user_id) = setup();
        let (folder, note) = {
            let db = db.lock().unwrap();
            let folder = db.create_folder(user_id, "Trips", "#FF9500").unwrap();
            let note = Note::new("Packing list", vec![], SourceType::Text, user_id, Some(folder.id));
            (folder, db.create_note(note).unwrap())
        };
        client.synchronize(SyncOptions::default()).await.unwrap();

        let mut tombstone = client.remote().folder(folder.id).unwrap();
        tombstone.deleted_at = Some(now_millis());
        tombstone.updated_at = now_millis();
        client.remote().insert_folder(tombstone);

        client.synchronize(SyncOptions::default()).await.unwrap();
        assert!(db.lock().unwrap().get_folder(folder.id, false).unwrap().is_none());
        assert_eq!(
            local_note(&db, note.id).folder_id,
            Some(crate::models::all_notes_folder_id(user_id))
        );
        // The move itself reaches the remote on the next pass
        client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(
            client.remote().note(note.id).unwrap().folder_id,
            Some(crate::models::all_notes_folder_id(user_id))
        );
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_pass() {
        let (client, db, user_id) = setup();
        db.lock()
            .unwrap()
            .create_note(Note::new("Blocked", vec![], SourceType::Text, user_id, None))
            .unwrap();
        client.remote().reject_auth.store(true, Ordering::SeqCst);
        let mut events = client.subscribe_events();

        let err = client.synchronize(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, NotesError::AuthenticationRequired));
        assert_eq!(db.lock().unwrap().count_pending(EntityKind::Note).unwrap(), 1);
        assert_eq!(client.remote().pulls.load(Ordering::SeqCst), 0);

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::Failed {
                message: "Please sign in again.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_uploaded_records_synced() {
        let (client, db, user_id) = setup();
        let note = db
            .lock()
            .unwrap()
            .create_note(Note::new("Uploaded", vec![], SourceType::Text, user_id, None))
            .unwrap();
        client.remote().fail_pull.store(true, Ordering::SeqCst);

        let err = client.synchronize(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, NotesError::Network(_)));
        assert_eq!(local_note(&db, note.id).sync_status, Some(SyncStatus::Synced));
        assert!(db.lock().unwrap().get_watermark(user_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_at_phase_boundary() {
        let (client, db, user_id) = setup();
        let note = db
            .lock()
            .unwrap()
            .create_note(Note::new("Before cancel", vec![], SourceType::Text, user_id, None))
            .unwrap();
        *client.remote().pull_delay.lock().unwrap() = Some(std::time::Duration::from_millis(50));

        let (result, _) = tokio::join!(client.synchronize(SyncOptions::default()), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client.cancel();
        });

        assert!(matches!(result, Err(NotesError::Cancelled)));
        // The upload committed before the cancellation point
        assert_eq!(local_note(&db, note.id).sync_status, Some(SyncStatus::Synced));
        assert!(!client.is_syncing());
    }

    #[tokio::test]
    async fn test_progress_and_completion_event() {
        let (client, db, user_id) = setup();
        db.lock()
            .unwrap()
            .create_note(Note::new("Tracked", vec![], SourceType::Text, user_id, None))
            .unwrap();
        let progress = client.subscribe_progress();
        let mut events = client.subscribe_events();

        let report = client.synchronize(SyncOptions::default()).await.unwrap();

        let snapshot = progress.borrow().clone();
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.synced_notes, 1);
        assert_eq!(snapshot.synced_folders, 1);
        assert!(!snapshot.is_downloading);
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::Completed {
                summary: report.summary.clone()
            }
        );
        assert!(report.summary.starts_with("Sync complete"));
    }

    #[tokio::test]
    async fn test_duplicate_all_notes_folders_merged_before_upload() {
        let (client, db, user_id) = setup();
        {
            let db = db.lock().unwrap();
            db.ensure_all_notes_folder(user_id).unwrap();
            let legacy = Folder::new(ALL_NOTES_FOLDER_NAME, "#8E8E93", user_id);
            Folder::store(db.connection(), &legacy).unwrap();
        }

        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.duplicate_folders_merged, 1);
        assert_eq!(report.folders_pushed, 2);

        let live = db.lock().unwrap().get_all_folders(false).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, crate::models::all_notes_folder_id(user_id));
    }

    #[tokio::test]
    async fn test_metadata_only_push_keeps_remote_binary() {
        let (client, db, user_id) = setup();
        let note = db
            .lock()
            .unwrap()
            .create_note(Note::new("Lecture", b"big audio transcript".to_vec(), SourceType::Audio, user_id, None))
            .unwrap();
        client.synchronize(SyncOptions::default()).await.unwrap();

        db.lock().unwrap().toggle_favorite(note.id).unwrap();
        let options = SyncOptions {
            include_binary_data: false,
            two_way_sync: true,
        };
        client.synchronize(options).await.unwrap();

        let remote = client.remote().note(note.id).unwrap();
        assert!(remote.is_favorite);
        assert_eq!(remote.original_content, b"big audio transcript");
        assert_eq!(local_note(&db, note.id).original_content, b"big audio transcript");
    }

    #[tokio::test]
    async fn test_repairs_through_client() {
        let (client, db, user_id) = setup();
        let mut legacy = Note::new("Voice memo", vec![7], SourceType::Recording, user_id, None);
        legacy.sync_status = None;
        Note::store(db.lock().unwrap().connection(), &legacy).unwrap();
        client
            .remote()
            .pending_rows
            .lock()
            .unwrap()
            .push((EntityKind::Folder, Uuid::now_v7()));

        assert_eq!(client.fix_audio_sync().unwrap(), 1);
        assert_eq!(client.fix_audio_sync().unwrap(), 0);

        let report = client.synchronize(SyncOptions::default()).await.unwrap();
        assert_eq!(report.notes_pushed, 1);
        assert!(client.remote().note(legacy.id).is_some());

        let repair = client.fix_remote_status().await.unwrap();
        assert_eq!(repair, RemoteStatusRepair { notes: 0, folders: 1 });
        assert_eq!(client.fix_remote_status().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_from_config_requires_signed_in_user() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));

        assert!(matches!(
            SyncClient::from_config(db.clone(), FakeRemote::new(), &config),
            Err(NotesError::AuthenticationRequired)
        ));

        let user_id = Uuid::now_v7();
        config.set_user_id(Some(user_id)).unwrap();
        let client = SyncClient::from_config(db, FakeRemote::new(), &config).unwrap();
        assert_eq!(client.user_id(), user_id);
    }
}
