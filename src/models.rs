//! Data models for notesync.
//!
//! This module defines the synced entities: Note and Folder, their enum
//! columns, and the `SyncRecord` trait the conflict resolver works against.
//! All timestamps are UTC with millisecond precision, which is what both the
//! local store and the wire format can represent losslessly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the distinguished folder every note defaults to.
pub const ALL_NOTES_FOLDER_NAME: &str = "All Notes";

/// Namespace for deterministic all-notes folder IDs (UUID v5 over the user id).
const ALL_NOTES_NAMESPACE: Uuid = Uuid::from_u128(0x6e6f7465_7379_5000_8000_616c6c6e6f74);

/// Whether a record has been confirmed by the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
        }
    }
}

/// Where a note's original content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Text,
    Audio,
    Video,
    Web,
    Pdf,
    Recording,
}

impl SourceType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(SourceType::Text),
            "audio" => Some(SourceType::Audio),
            "video" => Some(SourceType::Video),
            "web" => Some(SourceType::Web),
            "pdf" => Some(SourceType::Pdf),
            "recording" => Some(SourceType::Recording),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Text => "text",
            SourceType::Audio => "audio",
            SourceType::Video => "video",
            SourceType::Web => "web",
            SourceType::Pdf => "pdf",
            SourceType::Recording => "recording",
        }
    }

    /// Audio-backed notes (imported audio or in-app recordings)
    pub fn is_audio(&self) -> bool {
        matches!(self, SourceType::Audio | SourceType::Recording)
    }
}

/// Content-generation state of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

/// The two kinds of entities the sync pipeline moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Note,
    Folder,
}

impl EntityKind {
    /// Local and remote table name
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Note => "notes",
            EntityKind::Folder => "folders",
        }
    }
}

/// Represents a note in the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub title: String,
    /// Opaque original payload (text, transcript source, scraped page, ...)
    pub original_content: Vec<u8>,
    pub ai_generated_content: Option<Vec<u8>>,
    pub source_type: SourceType,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub is_favorite: bool,
    pub processing_status: ProcessingStatus,
    pub folder_id: Option<Uuid>,
    pub user_id: Uuid,
    /// `None` only for legacy rows that were never stamped (see `repair`).
    pub sync_status: Option<SyncStatus>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub transcript: Option<String>,
    pub tags: Vec<String>,
    pub language_code: Option<String>,
    pub sections: Option<Vec<u8>>,
    pub supplementary_materials: Option<Vec<u8>>,
    pub mind_map: Option<Vec<u8>>,
    pub video_id: Option<String>,
}

impl Note {
    /// Create a new pending note owned by `user_id`
    pub fn new(
        title: impl Into<String>,
        original_content: Vec<u8>,
        source_type: SourceType,
        user_id: Uuid,
        folder_id: Option<Uuid>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            original_content,
            ai_generated_content: None,
            source_type,
            created_at: now,
            last_modified: now,
            is_favorite: false,
            processing_status: ProcessingStatus::Completed,
            folder_id,
            user_id,
            sync_status: Some(SyncStatus::Pending),
            deleted_at: None,
            transcript: None,
            tags: Vec::new(),
            language_code: None,
            sections: None,
            supplementary_materials: None,
            mind_map: None,
            video_id: None,
        }
    }

    /// Get the note ID as a hex string
    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }

    /// Check if the note is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Check if the note still has to be pushed
    pub fn is_pending(&self) -> bool {
        self.sync_status != Some(SyncStatus::Synced)
    }
}

/// Represents a folder notes are filed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    /// Hex colour, e.g. "#4A90E2"
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sort_order: i64,
    pub user_id: Uuid,
    pub sync_status: Option<SyncStatus>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Folder {
    /// Create a new pending folder
    pub fn new(name: impl Into<String>, color: impl Into<String>, user_id: Uuid) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            color: color.into(),
            created_at: now,
            updated_at: now,
            sort_order: 0,
            user_id,
            sync_status: Some(SyncStatus::Pending),
            deleted_at: None,
        }
    }

    /// The distinguished folder notes land in when no folder is chosen.
    ///
    /// The ID is derived from the user id, so two devices creating it
    /// independently produce the same record instead of a duplicate.
    pub fn all_notes(user_id: Uuid) -> Self {
        let mut folder = Folder::new(ALL_NOTES_FOLDER_NAME, "#8E8E93", user_id);
        folder.id = all_notes_folder_id(user_id);
        folder.sort_order = -1;
        folder
    }

    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_all_notes(&self) -> bool {
        self.name == ALL_NOTES_FOLDER_NAME
    }
}

/// Deterministic ID of a user's all-notes folder
pub fn all_notes_folder_id(user_id: Uuid) -> Uuid {
    Uuid::new_v5(&ALL_NOTES_NAMESPACE, user_id.as_bytes())
}

/// A record that can be synchronized and compared by the conflict resolver.
pub trait SyncRecord {
    const KIND: EntityKind;

    fn id(&self) -> Uuid;

    /// Last-write-wins clock of the record
    fn last_modified(&self) -> DateTime<Utc>;

    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    fn set_last_modified(&mut self, at: DateTime<Utc>);

    fn set_sync_status(&mut self, status: SyncStatus);

    /// True when both versions carry the same user-visible data.
    /// `sync_status` is bookkeeping and never part of the comparison.
    fn same_content(&self, other: &Self) -> bool;
}

impl SyncRecord for Note {
    const KIND: EntityKind = EntityKind::Note;

    fn id(&self) -> Uuid {
        self.id
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_last_modified(&mut self, at: DateTime<Utc>) {
        self.last_modified = at;
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = Some(status);
    }

    fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.original_content == other.original_content
            && self.ai_generated_content == other.ai_generated_content
            && self.source_type == other.source_type
            && self.created_at == other.created_at
            && self.last_modified == other.last_modified
            && self.is_favorite == other.is_favorite
            && self.processing_status == other.processing_status
            && self.folder_id == other.folder_id
            && self.user_id == other.user_id
            && self.deleted_at == other.deleted_at
            && self.transcript == other.transcript
            && self.tags == other.tags
            && self.language_code == other.language_code
            && self.sections == other.sections
            && self.supplementary_materials == other.supplementary_materials
            && self.mind_map == other.mind_map
            && self.video_id == other.video_id
    }
}

impl SyncRecord for Folder {
    const KIND: EntityKind = EntityKind::Folder;

    fn id(&self) -> Uuid {
        self.id
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_last_modified(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = Some(status);
    }

    fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.color == other.color
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
            && self.sort_order == other.sort_order
            && self.user_id == other.user_id
            && self.deleted_at == other.deleted_at
    }
}

/// Clock and deletion state of one record, without its content.
///
/// Compared across stores to find records one side has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordVersion {
    pub id: Uuid,
    pub last_modified: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Current time truncated to milliseconds
pub fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

/// Drop sub-millisecond precision so local and wire timestamps compare equal
pub fn truncate_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

/// Next modification timestamp after `previous`.
///
/// Never returns a value at or before `previous`, even when the wall clock
/// has been set back.
pub fn advance_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_millis();
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_creation() {
        let user_id = Uuid::now_v7();
        let note = Note::new("Title", b"body".to_vec(), SourceType::Text, user_id, None);

        assert!(!note.id.is_nil());
        assert_eq!(note.title, "Title");
        assert_eq!(note.created_at, note.last_modified);
        assert_eq!(note.sync_status, Some(SyncStatus::Pending));
        assert!(note.is_pending());
        assert!(!note.is_deleted());
    }

    #[test]
    fn test_all_notes_folder_id_is_deterministic() {
        let user_id = Uuid::now_v7();
        let a = Folder::all_notes(user_id);
        let b = Folder::all_notes(user_id);

        assert_eq!(a.id, b.id);
        assert!(a.is_all_notes());
        assert_ne!(a.id, all_notes_folder_id(Uuid::now_v7()));
    }

    #[test]
    fn test_enum_round_trip_strings() {
        for st in [
            SourceType::Text,
            SourceType::Audio,
            SourceType::Video,
            SourceType::Web,
            SourceType::Pdf,
            SourceType::Recording,
        ] {
            assert_eq!(SourceType::from_str(st.as_str()), Some(st));
        }
        assert_eq!(SyncStatus::from_str("synced"), Some(SyncStatus::Synced));
        assert_eq!(SyncStatus::from_str("bogus"), None);
        assert!(SourceType::Recording.is_audio());
        assert!(!SourceType::Pdf.is_audio());
    }

    #[test]
    fn test_advance_timestamp_is_monotonic() {
        let future = now_millis() + Duration::hours(1);
        let next = advance_timestamp(future);
        assert_eq!(next, future + Duration::milliseconds(1));

        let past = now_millis() - Duration::hours(1);
        assert!(advance_timestamp(past) > past);
    }

    #[test]
    fn test_same_content_ignores_sync_status() {
        let user_id = Uuid::now_v7();
        let a = Note::new("T", vec![1, 2], SourceType::Text, user_id, None);
        let mut b = a.clone();
        b.sync_status = Some(SyncStatus::Synced);
        assert!(a.same_content(&b));

        b.title = "Other".to_string();
        assert!(!a.same_content(&b));
    }
}
