//! Input validation for notesync.
//!
//! This module provides validation functions for user-supplied values.
//! All validators return NotesError::Validation on failure.

use uuid::Uuid;

use crate::error::{NotesError, NotesResult};
use crate::models::ALL_NOTES_FOLDER_NAME;

pub const MAX_NOTE_TITLE_LENGTH: usize = 500;
pub const MAX_FOLDER_NAME_LENGTH: usize = 100;
pub const MAX_TAG_LENGTH: usize = 100;
pub const MAX_TAGS_PER_NOTE: usize = 50;
/// Original content may be a whole transcript or PDF text
pub const MAX_ORIGINAL_CONTENT_BYTES: usize = 50 * 1024 * 1024;
pub const UUID_BYTES_LENGTH: usize = 16;

/// Validate a UUID value (must be 16 bytes).
pub fn validate_uuid(value: &[u8], field_name: &str) -> NotesResult<()> {
    if value.len() != UUID_BYTES_LENGTH {
        return Err(NotesError::validation(
            field_name,
            format!("must be {} bytes, got {}", UUID_BYTES_LENGTH, value.len()),
        ));
    }
    Ok(())
}

/// Validate and convert a UUID string (hyphenated or not) to Uuid.
pub fn validate_uuid_hex(value: &str, field_name: &str) -> NotesResult<Uuid> {
    let cleaned = value.replace('-', "");
    Uuid::parse_str(&cleaned)
        .map_err(|e| NotesError::validation(field_name, format!("invalid UUID format: {}", e)))
}

/// Convert UUID bytes from the local store back to a Uuid.
pub fn uuid_from_bytes(bytes: &[u8], field_name: &str) -> NotesResult<Uuid> {
    validate_uuid(bytes, field_name)?;
    Uuid::from_slice(bytes)
        .map_err(|e| NotesError::validation(field_name, format!("invalid UUID bytes: {}", e)))
}

/// Validate a note title.
///
/// Titles may be empty (untitled notes are allowed) but not oversized.
pub fn validate_note_title(title: &str) -> NotesResult<()> {
    if title.chars().count() > MAX_NOTE_TITLE_LENGTH {
        return Err(NotesError::validation(
            "title",
            format!("cannot exceed {} characters", MAX_NOTE_TITLE_LENGTH),
        ));
    }
    Ok(())
}

/// Validate a note's original content payload.
pub fn validate_original_content(content: &[u8]) -> NotesResult<()> {
    if content.len() > MAX_ORIGINAL_CONTENT_BYTES {
        return Err(NotesError::validation(
            "original_content",
            format!(
                "cannot exceed {} bytes (got {})",
                MAX_ORIGINAL_CONTENT_BYTES,
                content.len()
            ),
        ));
    }
    Ok(())
}

/// Validate a folder name.
///
/// A folder name must be non-empty after trimming and no longer than
/// MAX_FOLDER_NAME_LENGTH characters. The all-notes folder's name is
/// reserved in any letter case.
pub fn validate_folder_name(name: &str) -> NotesResult<()> {
    let stripped = name.trim();

    if stripped.is_empty() {
        return Err(NotesError::validation(
            "folder_name",
            "cannot be empty or whitespace only",
        ));
    }

    if stripped.chars().count() > MAX_FOLDER_NAME_LENGTH {
        return Err(NotesError::validation(
            "folder_name",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_FOLDER_NAME_LENGTH,
                stripped.chars().count()
            ),
        ));
    }

    if stripped.eq_ignore_ascii_case(ALL_NOTES_FOLDER_NAME) {
        return Err(NotesError::validation(
            "folder_name",
            format!("\"{}\" is reserved", ALL_NOTES_FOLDER_NAME),
        ));
    }

    Ok(())
}

/// Validate a folder colour: "#RRGGBB" or "#RRGGBBAA".
pub fn validate_color(color: &str) -> NotesResult<()> {
    let digits = color.strip_prefix('#').ok_or_else(|| {
        NotesError::validation("color", "must start with '#'")
    })?;

    if !(digits.len() == 6 || digits.len() == 8) || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(NotesError::validation(
            "color",
            format!("must be #RRGGBB or #RRGGBBAA, got '{}'", color),
        ));
    }
    Ok(())
}

/// Validate a note's tag list.
pub fn validate_tags(tags: &[String]) -> NotesResult<()> {
    if tags.len() > MAX_TAGS_PER_NOTE {
        return Err(NotesError::validation(
            "tags",
            format!("cannot have more than {} tags", MAX_TAGS_PER_NOTE),
        ));
    }
    for tag in tags {
        let stripped = tag.trim();
        if stripped.is_empty() {
            return Err(NotesError::validation("tags", "tag cannot be empty"));
        }
        if stripped.chars().count() > MAX_TAG_LENGTH {
            return Err(NotesError::validation(
                "tags",
                format!("tag cannot exceed {} characters", MAX_TAG_LENGTH),
            ));
        }
    }
    Ok(())
}

/// Validate a BCP-47-ish language code ("en", "he", "pt-BR").
pub fn validate_language_code(code: &str) -> NotesResult<()> {
    let valid = !code.is_empty()
        && code.len() <= 16
        && code.split('-').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric())
        });
    if !valid {
        return Err(NotesError::validation(
            "language_code",
            format!("invalid language code '{}'", code),
        ));
    }
    Ok(())
}
