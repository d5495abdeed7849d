//! Error types for notesync.
//!
//! This module defines the error taxonomy shared by the local store, the
//! remote client and the sync orchestrator.

use thiserror::Error;

/// Result type alias for notesync operations
pub type NotesResult<T> = Result<T, NotesError>;

/// Main error type for notesync operations
#[derive(Error, Debug)]
pub enum NotesError {
    /// Another sync pass already holds the sync slot.
    #[error("Another sync is already in progress")]
    Locked,

    /// Bearer token missing or rejected (HTTP 401).
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Local persistence failure: {0}")]
    LocalPersistence(String),

    #[error("Remote rejected request (HTTP {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Some batches of a phase failed. Records of committed batches are
    /// synced; records of the failing batches stay pending.
    #[error("{failed_batches} of {total_batches} sync batches failed: {message}")]
    PartialBatchFailure {
        failed_batches: usize,
        total_batches: usize,
        message: String,
    },

    /// Rows the backend returned that could not be decoded. The pass keeps
    /// its watermark so they are pulled again.
    #[error("{count} {table} rows from the backend could not be read")]
    MalformedRows { table: &'static str, count: usize },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl NotesError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        NotesError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new local persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        NotesError::LocalPersistence(message.into())
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        NotesError::Network(message.into())
    }

    /// True for failures of the local store (SQLite or the lock around it).
    pub fn is_local_persistence(&self) -> bool {
        matches!(self, NotesError::Database(_) | NotesError::LocalPersistence(_))
    }

    /// True when the pass should stop immediately instead of moving on to
    /// the next independent batch.
    pub fn aborts_pass(&self) -> bool {
        matches!(
            self,
            NotesError::AuthenticationRequired | NotesError::Locked | NotesError::Cancelled
        )
    }

    /// Short actionable message for the UI layer.
    pub fn user_message(&self) -> String {
        match self {
            NotesError::Locked => "Another sync is already in progress.".to_string(),
            NotesError::AuthenticationRequired => "Please sign in again.".to_string(),
            NotesError::Network(_) => "Check your internet connection.".to_string(),
            NotesError::Database(_) | NotesError::LocalPersistence(_) => {
                "Could not save changes on this device.".to_string()
            }
            NotesError::RemoteRejected { status, .. } => {
                format!("The server rejected the sync (error {}).", status)
            }
            NotesError::PartialBatchFailure { .. } => {
                "Some changes could not be synced. They will be retried next time.".to_string()
            }
            NotesError::MalformedRows { .. } => {
                "Some changes on the server could not be read.".to_string()
            }
            NotesError::Cancelled => "Sync was cancelled.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for NotesError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return NotesError::AuthenticationRequired;
            }
            return NotesError::RemoteRejected {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        NotesError::Network(err.to_string())
    }
}
