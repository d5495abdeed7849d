//! notesync - offline-first synchronization core for a note-taking application.
//!
//! This library provides:
//! - Data models (Note, Folder) and the local SQLite store
//! - Binary column codec for the remote wire format
//! - Remote REST client and the backend trait it implements
//! - Conflict resolution (tombstone wins, then last write wins)
//! - Sync orchestration with single-flight locking and progress reporting
//! - One-off data repairs
//! - Configuration management
//!
//! # Feature Flags
//!
//! - `desktop`: Include desktop-specific features (config dir detection).

pub mod codec;
pub mod config;
pub mod conflicts;
pub mod database;
pub mod error;
pub mod models;
pub mod progress;
pub mod remote;
pub mod repair;
pub mod sync_client;
pub mod sync_lock;
pub mod validation;

/// Number of hex characters of a UUID shown in log lines
pub const UUID_SHORT_LEN: usize = 8;

// Re-export commonly used types
pub use config::{Config, SyncOptions};
pub use database::{Database, NoteUpdate};
pub use error::{NotesError, NotesResult};
pub use models::{EntityKind, Folder, Note, SourceType, SyncStatus};
pub use progress::{SyncEvent, SyncProgress};
pub use remote::{RemoteBackend, RestClient, TokenSource};
pub use sync_client::{SyncClient, SyncReport};
