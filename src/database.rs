//! Database operations for notesync.
//!
//! This module is the local repository adapter: all data access to the
//! on-device SQLite store. Every user-facing mutation stamps the record
//! `pending` and advances its modification clock; only the sync
//! orchestrator clears records back to `synced`.
//!
//! UUIDs are stored as BLOB (16 bytes); timestamps as INTEGER Unix
//! milliseconds.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::error::{NotesError, NotesResult};
use crate::models::{
    advance_timestamp, all_notes_folder_id, now_millis, EntityKind, Folder, Note,
    ProcessingStatus, RecordVersion, SourceType, SyncRecord, SyncStatus, ALL_NOTES_FOLDER_NAME,
};
use crate::validation::{
    validate_color, validate_folder_name, validate_language_code, validate_note_title,
    validate_original_content, validate_tags,
};
use crate::UUID_SHORT_LEN;

const NOTE_COLUMNS: &str = "id, title, original_content, ai_generated_content, source_type, \
     created_at, last_modified, is_favorite, processing_status, folder_id, user_id, \
     sync_status, deleted_at, transcript, tags, language_code, sections, \
     supplementary_materials, mind_map, video_id";

const FOLDER_COLUMNS: &str =
    "id, name, color, created_at, updated_at, sort_order, user_id, sync_status, deleted_at";

/// Field changes for `Database::update_note`. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub original_content: Option<Vec<u8>>,
    pub ai_generated_content: Option<Vec<u8>>,
    pub processing_status: Option<ProcessingStatus>,
    pub transcript: Option<String>,
    pub tags: Option<Vec<String>>,
    pub language_code: Option<String>,
    pub sections: Option<Vec<u8>>,
    pub supplementary_materials: Option<Vec<u8>>,
    pub mind_map: Option<Vec<u8>>,
    pub video_id: Option<String>,
}

impl NoteUpdate {
    fn validate(&self) -> NotesResult<()> {
        if let Some(title) = &self.title {
            validate_note_title(title)?;
        }
        if let Some(content) = &self.original_content {
            validate_original_content(content)?;
        }
        if let Some(tags) = &self.tags {
            validate_tags(tags)?;
        }
        if let Some(code) = &self.language_code {
            validate_language_code(code)?;
        }
        Ok(())
    }

    fn apply_to(self, note: &mut Note) {
        if let Some(v) = self.title {
            note.title = v;
        }
        if let Some(v) = self.original_content {
            note.original_content = v;
        }
        if let Some(v) = self.ai_generated_content {
            note.ai_generated_content = Some(v);
        }
        if let Some(v) = self.processing_status {
            note.processing_status = v;
        }
        if let Some(v) = self.transcript {
            note.transcript = Some(v);
        }
        if let Some(v) = self.tags {
            note.tags = v;
        }
        if let Some(v) = self.language_code {
            note.language_code = Some(v);
        }
        if let Some(v) = self.sections {
            note.sections = Some(v);
        }
        if let Some(v) = self.supplementary_materials {
            note.supplementary_materials = Some(v);
        }
        if let Some(v) = self.mind_map {
            note.mind_map = Some(v);
        }
        if let Some(v) = self.video_id {
            note.video_id = Some(v);
        }
    }
}

/// A record type persisted in the local store.
///
/// Implementations work on a plain `Connection` so they can run either
/// directly or inside a scoped transaction.
pub trait LocalRecord: SyncRecord + Clone + Sized {
    /// Load by id, tombstones included
    fn load(conn: &Connection, id: Uuid) -> NotesResult<Option<Self>>;

    /// All records of `user_id` whose status is not `synced`, tombstones included
    fn load_dirty(conn: &Connection, user_id: Uuid) -> NotesResult<Vec<Self>>;

    /// Upsert by id
    fn store(conn: &Connection, record: &Self) -> NotesResult<()>;

    /// Local follow-up once a winning remote version has been stored, in the
    /// same transaction
    fn after_remote_applied(_conn: &Connection, _record: &Self) -> NotesResult<()> {
        Ok(())
    }
}

fn conversion_error(idx: usize, ty: Type, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let bytes: Vec<u8> = row.get(idx)?;
    Uuid::from_slice(&bytes).map_err(|e| conversion_error(idx, Type::Blob, e))
}

fn opt_uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| Uuid::from_slice(&b).map_err(|e| conversion_error(idx, Type::Blob, e)))
        .transpose()
}

fn ts_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn opt_ts_at(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|m| {
            DateTime::from_timestamp_millis(m).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, m))
        })
        .transpose()
}

fn row_to_note(row: &Row) -> rusqlite::Result<Note> {
    let source_type: String = row.get(4)?;
    let processing_status: String = row.get(8)?;
    let sync_status: Option<String> = row.get(11)?;
    let tags: String = row.get(14)?;

    Ok(Note {
        id: uuid_at(row, 0)?,
        title: row.get(1)?,
        original_content: row.get(2)?,
        ai_generated_content: row.get(3)?,
        source_type: SourceType::from_str(&source_type).unwrap_or(SourceType::Text),
        created_at: ts_at(row, 5)?,
        last_modified: ts_at(row, 6)?,
        is_favorite: row.get(7)?,
        processing_status: ProcessingStatus::from_str(&processing_status)
            .unwrap_or(ProcessingStatus::Completed),
        folder_id: opt_uuid_at(row, 9)?,
        user_id: uuid_at(row, 10)?,
        sync_status: sync_status.as_deref().and_then(SyncStatus::from_str),
        deleted_at: opt_ts_at(row, 12)?,
        transcript: row.get(13)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        language_code: row.get(15)?,
        sections: row.get(16)?,
        supplementary_materials: row.get(17)?,
        mind_map: row.get(18)?,
        video_id: row.get(19)?,
    })
}

fn row_to_folder(row: &Row) -> rusqlite::Result<Folder> {
    let sync_status: Option<String> = row.get(7)?;

    Ok(Folder {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        created_at: ts_at(row, 3)?,
        updated_at: ts_at(row, 4)?,
        sort_order: row.get(5)?,
        user_id: uuid_at(row, 6)?,
        sync_status: sync_status.as_deref().and_then(SyncStatus::from_str),
        deleted_at: opt_ts_at(row, 8)?,
    })
}

/// Display order for notes: most recently modified first
const NOTES_NEWEST_FIRST: &str = "last_modified DESC, id DESC";

/// Push order: oldest change first
const NOTES_OLDEST_FIRST: &str = "last_modified ASC, id ASC";

fn query_notes(
    conn: &Connection,
    where_clause: &str,
    order: &str,
    args: &[&dyn rusqlite::ToSql],
) -> NotesResult<Vec<Note>> {
    let sql = format!(
        "SELECT {} FROM notes WHERE {} ORDER BY {}",
        NOTE_COLUMNS, where_clause, order
    );
    let mut stmt = conn.prepare(&sql)?;
    let notes = stmt
        .query_map(args, row_to_note)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(notes)
}

fn query_folders(conn: &Connection, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> NotesResult<Vec<Folder>> {
    let sql = format!(
        "SELECT {} FROM folders WHERE {} ORDER BY sort_order, created_at, id",
        FOLDER_COLUMNS, where_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let folders = stmt
        .query_map(args, row_to_folder)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(folders)
}

fn sync_status_param(status: Option<SyncStatus>) -> Option<&'static str> {
    status.map(|s| s.as_str())
}

impl LocalRecord for Note {
    fn load(conn: &Connection, id: Uuid) -> NotesResult<Option<Self>> {
        let sql = format!("SELECT {} FROM notes WHERE id = ?", NOTE_COLUMNS);
        let note = conn
            .query_row(&sql, params![id.as_bytes().to_vec()], row_to_note)
            .optional()?;
        Ok(note)
    }

    fn load_dirty(conn: &Connection, user_id: Uuid) -> NotesResult<Vec<Self>> {
        // NULL status rows are legacy and only surface after `fix_audio_sync`
        query_notes(
            conn,
            "sync_status != 'synced' AND user_id = ?",
            NOTES_OLDEST_FIRST,
            &[&user_id.as_bytes().to_vec()],
        )
    }

    fn store(conn: &Connection, note: &Self) -> NotesResult<()> {
        let tags = serde_json::to_string(&note.tags)?;
        conn.execute(
            r#"
            INSERT INTO notes (
                id, title, original_content, ai_generated_content, source_type,
                created_at, last_modified, is_favorite, processing_status, folder_id, user_id,
                sync_status, deleted_at, transcript, tags, language_code, sections,
                supplementary_materials, mind_map, video_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                original_content = excluded.original_content,
                ai_generated_content = excluded.ai_generated_content,
                source_type = excluded.source_type,
                created_at = excluded.created_at,
                last_modified = excluded.last_modified,
                is_favorite = excluded.is_favorite,
                processing_status = excluded.processing_status,
                folder_id = excluded.folder_id,
                user_id = excluded.user_id,
                sync_status = excluded.sync_status,
                deleted_at = excluded.deleted_at,
                transcript = excluded.transcript,
                tags = excluded.tags,
                language_code = excluded.language_code,
                sections = excluded.sections,
                supplementary_materials = excluded.supplementary_materials,
                mind_map = excluded.mind_map,
                video_id = excluded.video_id
            "#,
            params![
                note.id.as_bytes().to_vec(),
                note.title,
                note.original_content,
                note.ai_generated_content,
                note.source_type.as_str(),
                note.created_at.timestamp_millis(),
                note.last_modified.timestamp_millis(),
                note.is_favorite,
                note.processing_status.as_str(),
                note.folder_id.map(|id| id.as_bytes().to_vec()),
                note.user_id.as_bytes().to_vec(),
                sync_status_param(note.sync_status),
                note.deleted_at.map(|dt| dt.timestamp_millis()),
                note.transcript,
                tags,
                note.language_code,
                note.sections,
                note.supplementary_materials,
                note.mind_map,
                note.video_id,
            ],
        )?;
        Ok(())
    }
}

impl LocalRecord for Folder {
    fn load(conn: &Connection, id: Uuid) -> NotesResult<Option<Self>> {
        let sql = format!("SELECT {} FROM folders WHERE id = ?", FOLDER_COLUMNS);
        let folder = conn
            .query_row(&sql, params![id.as_bytes().to_vec()], row_to_folder)
            .optional()?;
        Ok(folder)
    }

    fn load_dirty(conn: &Connection, user_id: Uuid) -> NotesResult<Vec<Self>> {
        query_folders(
            conn,
            "sync_status != 'synced' AND user_id = ?",
            &[&user_id.as_bytes().to_vec()],
        )
    }

    fn store(conn: &Connection, folder: &Self) -> NotesResult<()> {
        conn.execute(
            r#"
            INSERT INTO folders (
                id, name, color, created_at, updated_at, sort_order, user_id, sync_status, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                color = excluded.color,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                sort_order = excluded.sort_order,
                user_id = excluded.user_id,
                sync_status = excluded.sync_status,
                deleted_at = excluded.deleted_at
            "#,
            params![
                folder.id.as_bytes().to_vec(),
                folder.name,
                folder.color,
                folder.created_at.timestamp_millis(),
                folder.updated_at.timestamp_millis(),
                folder.sort_order,
                folder.user_id.as_bytes().to_vec(),
                sync_status_param(folder.sync_status),
                folder.deleted_at.map(|dt| dt.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// A folder deleted on another device gives up its live notes to the
    /// all-notes folder, same as a local delete.
    fn after_remote_applied(conn: &Connection, folder: &Self) -> NotesResult<()> {
        if !folder.is_deleted() {
            return Ok(());
        }
        let target = ensure_all_notes_folder_in(conn, folder.user_id)?;
        if target.id == folder.id {
            return Ok(());
        }
        let moved = rehome_notes(conn, folder.id, target.id)?;
        if moved > 0 {
            tracing::debug!(
                "Moved {} notes out of remotely deleted folder {}",
                moved,
                &folder.id_hex()[..UUID_SHORT_LEN]
            );
        }
        Ok(())
    }
}

/// Column holding the last-write-wins clock of a table
fn modified_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Note => "last_modified",
        EntityKind::Folder => "updated_at",
    }
}

/// Write a remote version that won conflict resolution.
///
/// The stored record is marked `synced`, and its modification clock is never
/// moved behind the local one (a winning tombstone may carry an older clock).
pub fn apply_remote<T: LocalRecord>(conn: &Connection, local: Option<&T>, remote: &T) -> NotesResult<()> {
    let mut record = remote.clone();
    if let Some(local) = local {
        if local.last_modified() > record.last_modified() {
            record.set_last_modified(local.last_modified());
        }
    }
    record.set_sync_status(SyncStatus::Synced);
    T::store(conn, &record)?;
    T::after_remote_applied(conn, &record)
}

/// Re-flag a record so the next pass pushes it (local side won a conflict).
pub fn mark_pending(conn: &Connection, kind: EntityKind, id: Uuid) -> NotesResult<bool> {
    let sql = format!("UPDATE {} SET sync_status = 'pending' WHERE id = ?", kind.table());
    let updated = conn.execute(&sql, params![id.as_bytes().to_vec()])?;
    Ok(updated > 0)
}

/// Database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (and create if needed) the database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> NotesResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> NotesResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_database(&self) -> NotesResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                color TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                sort_order INTEGER NOT NULL DEFAULT 0,
                user_id BLOB NOT NULL,
                sync_status TEXT,
                deleted_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS notes (
                id BLOB PRIMARY KEY,
                title TEXT NOT NULL,
                original_content BLOB NOT NULL,
                ai_generated_content BLOB,
                source_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                processing_status TEXT NOT NULL DEFAULT 'completed',
                folder_id BLOB,
                user_id BLOB NOT NULL,
                sync_status TEXT,
                deleted_at INTEGER,
                transcript TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                language_code TEXT,
                sections BLOB,
                supplementary_materials BLOB,
                mind_map BLOB,
                video_id TEXT
            );

            -- Key/value sync bookkeeping (download watermarks)
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_notes_sync_status ON notes(sync_status);
            CREATE INDEX IF NOT EXISTS idx_notes_deleted_at ON notes(deleted_at);
            CREATE INDEX IF NOT EXISTS idx_notes_folder_id ON notes(folder_id);
            CREATE INDEX IF NOT EXISTS idx_folders_sync_status ON folders(sync_status);
            CREATE INDEX IF NOT EXISTS idx_folders_user_name ON folders(user_id, name);
            "#,
        )?;
        Ok(())
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside one scoped transaction.
    ///
    /// The transaction commits only if `f` returns Ok; any error rolls back
    /// every write `f` made.
    pub fn with_transaction<R>(
        &self,
        f: impl FnOnce(&Transaction) -> NotesResult<R>,
    ) -> NotesResult<R> {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()
            .map_err(|e| NotesError::persistence(format!("commit failed: {}", e)))?;
        Ok(result)
    }

    // ============================================================================
    // Notes
    // ============================================================================

    /// Insert a new note as `pending`.
    ///
    /// A note without a folder is filed into the owner's all-notes folder,
    /// which is created on first use.
    pub fn create_note(&self, mut note: Note) -> NotesResult<Note> {
        validate_note_title(&note.title)?;
        validate_original_content(&note.original_content)?;
        validate_tags(&note.tags)?;

        self.with_transaction(|tx| {
            if note.folder_id.is_none() {
                note.folder_id = Some(ensure_all_notes_folder_in(tx, note.user_id)?.id);
            }
            note.sync_status = Some(SyncStatus::Pending);
            Note::store(tx, &note)?;
            Ok(())
        })?;

        tracing::debug!("Created note {}", &note.id_hex()[..UUID_SHORT_LEN]);
        Ok(note)
    }

    /// Get a note by id. Tombstones are only returned with `include_deleted`.
    pub fn get_note(&self, note_id: Uuid, include_deleted: bool) -> NotesResult<Option<Note>> {
        let note = Note::load(&self.conn, note_id)?;
        Ok(note.filter(|n| include_deleted || !n.is_deleted()))
    }

    /// All notes, newest first. Tombstones are only returned with `include_deleted`.
    pub fn get_all_notes(&self, include_deleted: bool) -> NotesResult<Vec<Note>> {
        if include_deleted {
            query_notes(&self.conn, "1 = 1", NOTES_NEWEST_FIRST, &[])
        } else {
            query_notes(&self.conn, "deleted_at IS NULL", NOTES_NEWEST_FIRST, &[])
        }
    }

    /// Live notes filed in a folder.
    ///
    /// Notes with no folder reference count as filed in the all-notes folder.
    pub fn get_notes_in_folder(&self, folder_id: Uuid) -> NotesResult<Vec<Note>> {
        let folder = Folder::load(&self.conn, folder_id)?
            .ok_or_else(|| NotesError::NotFound(format!("Folder {}", folder_id)))?;

        let id_bytes = folder_id.as_bytes().to_vec();
        if folder.is_all_notes() {
            query_notes(
                &self.conn,
                "deleted_at IS NULL AND (folder_id = ? OR folder_id IS NULL)",
                NOTES_NEWEST_FIRST,
                &[&id_bytes],
            )
        } else {
            query_notes(
                &self.conn,
                "deleted_at IS NULL AND folder_id = ?",
                NOTES_NEWEST_FIRST,
                &[&id_bytes],
            )
        }
    }

    /// Live favorite notes
    pub fn get_favorite_notes(&self) -> NotesResult<Vec<Note>> {
        query_notes(
            &self.conn,
            "deleted_at IS NULL AND is_favorite = 1",
            NOTES_NEWEST_FIRST,
            &[],
        )
    }

    /// Load a live note, change it, advance its clock and mark it pending.
    fn mutate_note(
        &self,
        note_id: Uuid,
        f: impl FnOnce(&Connection, &mut Note) -> NotesResult<()>,
    ) -> NotesResult<Option<Note>> {
        self.with_transaction(|tx| {
            let mut note = match Note::load(tx, note_id)? {
                Some(n) if !n.is_deleted() => n,
                _ => return Ok(None),
            };
            f(tx, &mut note)?;
            note.last_modified = advance_timestamp(note.last_modified);
            note.sync_status = Some(SyncStatus::Pending);
            Note::store(tx, &note)?;
            Ok(Some(note))
        })
    }

    /// Apply field changes to a live note. Returns false if no such note.
    pub fn update_note(&self, note_id: Uuid, update: NoteUpdate) -> NotesResult<bool> {
        update.validate()?;
        let updated = self.mutate_note(note_id, |_, note| {
            update.apply_to(note);
            Ok(())
        })?;
        Ok(updated.is_some())
    }

    /// Move a live note to another folder (`None` = all-notes folder)
    pub fn move_note_to_folder(&self, note_id: Uuid, folder_id: Option<Uuid>) -> NotesResult<bool> {
        let moved = self.mutate_note(note_id, |conn, note| {
            let target = match folder_id {
                Some(id) => match Folder::load(conn, id)? {
                    Some(folder) if !folder.is_deleted() => folder.id,
                    _ => return Err(NotesError::NotFound(format!("Folder {}", id))),
                },
                None => ensure_all_notes_folder_in(conn, note.user_id)?.id,
            };
            note.folder_id = Some(target);
            Ok(())
        })?;
        Ok(moved.is_some())
    }

    /// Flip the favorite flag. Returns the new value, or None if no such note.
    pub fn toggle_favorite(&self, note_id: Uuid) -> NotesResult<Option<bool>> {
        let note = self.mutate_note(note_id, |_, note| {
            note.is_favorite = !note.is_favorite;
            Ok(())
        })?;
        Ok(note.map(|n| n.is_favorite))
    }

    /// Soft-delete a note. The tombstone stays in the store until synced.
    pub fn delete_note(&self, note_id: Uuid) -> NotesResult<bool> {
        let deleted = self.mutate_note(note_id, |_, note| {
            note.deleted_at = Some(now_millis());
            Ok(())
        })?;
        Ok(deleted.is_some())
    }

    /// Undo a soft delete
    pub fn restore_note(&self, note_id: Uuid) -> NotesResult<bool> {
        self.with_transaction(|tx| {
            let mut note = match Note::load(tx, note_id)? {
                Some(n) if n.is_deleted() => n,
                _ => return Ok(false),
            };
            note.deleted_at = None;
            note.last_modified = advance_timestamp(note.last_modified);
            note.sync_status = Some(SyncStatus::Pending);
            Note::store(tx, &note)?;
            Ok(true)
        })
    }

    /// Physically remove a note. Administrative cleanup only: the removal is
    /// never synced.
    pub fn hard_delete_note(&self, note_id: Uuid) -> NotesResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM notes WHERE id = ?", params![note_id.as_bytes().to_vec()])?;
        if deleted > 0 {
            tracing::info!("Hard-deleted note {}", note_id);
        }
        Ok(deleted > 0)
    }

    // ============================================================================
    // Folders
    // ============================================================================

    /// Create a new pending folder
    pub fn create_folder(&self, user_id: Uuid, name: &str, color: &str) -> NotesResult<Folder> {
        validate_folder_name(name)?;
        validate_color(color)?;

        let mut folder = Folder::new(name.trim(), color, user_id);
        folder.sort_order = self.conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM folders WHERE user_id = ? AND deleted_at IS NULL",
            params![user_id.as_bytes().to_vec()],
            |row| row.get(0),
        )?;
        Folder::store(&self.conn, &folder)?;
        Ok(folder)
    }

    /// Get a folder by id. Tombstones are only returned with `include_deleted`.
    pub fn get_folder(&self, folder_id: Uuid, include_deleted: bool) -> NotesResult<Option<Folder>> {
        let folder = Folder::load(&self.conn, folder_id)?;
        Ok(folder.filter(|f| include_deleted || !f.is_deleted()))
    }

    /// All folders in display order
    pub fn get_all_folders(&self, include_deleted: bool) -> NotesResult<Vec<Folder>> {
        if include_deleted {
            query_folders(&self.conn, "1 = 1", &[])
        } else {
            query_folders(&self.conn, "deleted_at IS NULL", &[])
        }
    }

    fn mutate_folder(
        &self,
        folder_id: Uuid,
        f: impl FnOnce(&Connection, &mut Folder) -> NotesResult<()>,
    ) -> NotesResult<bool> {
        self.with_transaction(|tx| {
            let mut folder = match Folder::load(tx, folder_id)? {
                Some(folder) if !folder.is_deleted() => folder,
                _ => return Ok(false),
            };
            f(tx, &mut folder)?;
            folder.updated_at = advance_timestamp(folder.updated_at);
            folder.sync_status = Some(SyncStatus::Pending);
            Folder::store(tx, &folder)?;
            Ok(true)
        })
    }

    pub fn rename_folder(&self, folder_id: Uuid, name: &str) -> NotesResult<bool> {
        validate_folder_name(name)?;
        self.mutate_folder(folder_id, |_, folder| {
            if folder.is_all_notes() {
                return Err(NotesError::validation("folder", "the all-notes folder cannot be renamed"));
            }
            folder.name = name.trim().to_string();
            Ok(())
        })
    }

    pub fn set_folder_color(&self, folder_id: Uuid, color: &str) -> NotesResult<bool> {
        validate_color(color)?;
        self.mutate_folder(folder_id, |_, folder| {
            folder.color = color.to_string();
            Ok(())
        })
    }

    pub fn set_folder_sort_order(&self, folder_id: Uuid, sort_order: i64) -> NotesResult<bool> {
        self.mutate_folder(folder_id, |_, folder| {
            folder.sort_order = sort_order;
            Ok(())
        })
    }

    /// Soft-delete a folder. Its live notes move to the all-notes folder.
    pub fn delete_folder(&self, folder_id: Uuid) -> NotesResult<bool> {
        self.mutate_folder(folder_id, |conn, folder| {
            if folder.is_all_notes() {
                return Err(NotesError::validation("folder", "the all-notes folder cannot be deleted"));
            }
            let target = ensure_all_notes_folder_in(conn, folder.user_id)?;
            let moved = rehome_notes(conn, folder.id, target.id)?;
            if moved > 0 {
                tracing::debug!("Moved {} notes out of deleted folder {}", moved, folder.id);
            }
            folder.deleted_at = Some(now_millis());
            Ok(())
        })
    }

    /// Get (creating if needed) the user's all-notes folder
    pub fn ensure_all_notes_folder(&self, user_id: Uuid) -> NotesResult<Folder> {
        self.with_transaction(|tx| ensure_all_notes_folder_in(tx, user_id))
    }

    /// Collapse duplicate all-notes folders into one.
    ///
    /// The deterministic-id folder survives if present, otherwise the oldest.
    /// Notes of the duplicates are re-homed and the duplicates tombstoned.
    /// Returns the number of duplicates removed.
    pub fn deduplicate_all_notes_folders(&self, user_id: Uuid) -> NotesResult<usize> {
        self.with_transaction(|tx| {
            let mut folders = query_folders(
                tx,
                "user_id = ? AND name = ? AND deleted_at IS NULL",
                &[&user_id.as_bytes().to_vec(), &ALL_NOTES_FOLDER_NAME],
            )?;
            if folders.len() <= 1 {
                return Ok(0);
            }

            let canonical_id = all_notes_folder_id(user_id);
            folders.sort_by_key(|f| (f.id != canonical_id, f.created_at, f.id));
            let survivor = folders.remove(0);
            let removed = folders.len();

            for mut duplicate in folders {
                rehome_notes(tx, duplicate.id, survivor.id)?;
                duplicate.deleted_at = Some(now_millis());
                duplicate.updated_at = advance_timestamp(duplicate.updated_at);
                duplicate.sync_status = Some(SyncStatus::Pending);
                Folder::store(tx, &duplicate)?;
                tracing::info!(
                    "Merged duplicate all-notes folder {} into {}",
                    &duplicate.id_hex()[..UUID_SHORT_LEN],
                    &survivor.id_hex()[..UUID_SHORT_LEN]
                );
            }
            Ok(removed)
        })
    }

    /// Physically remove a folder. Administrative cleanup only.
    pub fn hard_delete_folder(&self, folder_id: Uuid) -> NotesResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM folders WHERE id = ?", params![folder_id.as_bytes().to_vec()])?;
        Ok(deleted > 0)
    }

    // ============================================================================
    // Sync bookkeeping
    // ============================================================================

    /// All not-yet-synced records of a kind for `user_id`, tombstones included
    pub fn fetch_dirty<T: LocalRecord>(&self, user_id: Uuid) -> NotesResult<Vec<T>> {
        T::load_dirty(&self.conn, user_id)
    }

    /// Count records still waiting to be pushed
    pub fn count_pending(&self, kind: EntityKind) -> NotesResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE sync_status != 'synced'",
            kind.table()
        );
        let count = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    /// Mark pushed versions `synced`.
    ///
    /// Each entry is (id, modification clock that was pushed). A record edited
    /// again after it was pushed keeps its `pending` status. All entries are
    /// written in one transaction. Returns how many rows were cleared.
    pub fn mark_synced(&self, kind: EntityKind, pushed: &[(Uuid, DateTime<Utc>)]) -> NotesResult<usize> {
        let sql = format!(
            "UPDATE {} SET sync_status = 'synced' WHERE id = ? AND {} = ?",
            kind.table(),
            modified_column(kind)
        );
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let mut cleared = 0;
            for (id, modified) in pushed {
                cleared += stmt.execute(params![id.as_bytes().to_vec(), modified.timestamp_millis()])?;
            }
            Ok(cleared)
        })
    }

    /// Clock and deletion state of every local record of a kind owned by
    /// `user_id`, tombstones included
    pub fn local_versions(&self, kind: EntityKind, user_id: Uuid) -> NotesResult<HashMap<Uuid, RecordVersion>> {
        let sql = format!(
            "SELECT id, {}, deleted_at FROM {} WHERE user_id = ?",
            modified_column(kind),
            kind.table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params![user_id.as_bytes().to_vec()], |row| {
                Ok(RecordVersion {
                    id: uuid_at(row, 0)?,
                    last_modified: ts_at(row, 1)?,
                    deleted_at: opt_ts_at(row, 2)?,
                })
            })?
            .map(|v| v.map(|v| (v.id, v)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(versions)
    }

    /// Last successful download watermark for `user_id`
    pub fn get_watermark(&self, user_id: Uuid) -> NotesResult<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?",
                params![watermark_key(user_id)],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis))
    }

    /// Persist the download watermark for `user_id`
    pub fn set_watermark(&self, user_id: Uuid, watermark: DateTime<Utc>) -> NotesResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![watermark_key(user_id), watermark.timestamp_millis().to_string()],
        )?;
        Ok(())
    }

    /// Forget the watermark so the next pass pulls everything
    pub fn reset_watermark(&self, user_id: Uuid) -> NotesResult<()> {
        self.conn.execute(
            "DELETE FROM sync_state WHERE key = ?",
            params![watermark_key(user_id)],
        )?;
        Ok(())
    }

    pub fn close(self) -> NotesResult<()> {
        self.conn
            .close()
            .map_err(|(_, e)| NotesError::Database(e))
    }
}

fn watermark_key(user_id: Uuid) -> String {
    format!("download_watermark:{}", user_id.simple())
}

fn ensure_all_notes_folder_in(conn: &Connection, user_id: Uuid) -> NotesResult<Folder> {
    let existing = query_folders(
        conn,
        "user_id = ? AND name = ? AND deleted_at IS NULL",
        &[&user_id.as_bytes().to_vec(), &ALL_NOTES_FOLDER_NAME],
    )?;
    let canonical_id = all_notes_folder_id(user_id);
    if let Some(folder) = existing
        .iter()
        .find(|f| f.id == canonical_id)
        .or_else(|| existing.iter().min_by_key(|f| (f.created_at, f.id)))
    {
        return Ok(folder.clone());
    }

    // A tombstoned canonical folder comes back instead of being duplicated
    if let Some(mut folder) = Folder::load(conn, canonical_id)? {
        folder.deleted_at = None;
        folder.name = ALL_NOTES_FOLDER_NAME.to_string();
        folder.updated_at = advance_timestamp(folder.updated_at);
        folder.sync_status = Some(SyncStatus::Pending);
        Folder::store(conn, &folder)?;
        return Ok(folder);
    }

    let folder = Folder::all_notes(user_id);
    Folder::store(conn, &folder)?;
    tracing::debug!("Created all-notes folder for user {}", user_id);
    Ok(folder)
}

/// Move every live note of `from` into `to`, marking each pending
fn rehome_notes(conn: &Connection, from: Uuid, to: Uuid) -> NotesResult<usize> {
    let moved = conn.execute(
        r#"
        UPDATE notes
        SET folder_id = ?1,
            last_modified = MAX(?2, last_modified + 1),
            sync_status = 'pending'
        WHERE folder_id = ?3 AND deleted_at IS NULL
        "#,
        params![
            to.as_bytes().to_vec(),
            now_millis().timestamp_millis(),
            from.as_bytes().to_vec()
        ],
    )?;
    Ok(moved)
}
