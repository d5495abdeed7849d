//! Remote backend client for notesync.
//!
//! The backend is a PostgREST-style table API (`{remote_url}/rest/v1/{table}`)
//! authenticated with a project API key plus a user bearer token. This module
//! provides:
//! - `RemoteBackend`, the seam the sync orchestrator drives (and tests fake)
//! - `RestClient`, the HTTP implementation
//! - wire row types for notes and folders, with binary columns going through
//!   the codec
//! - generic row access for the auxiliary tables (quiz data, settings,
//!   profile)
//!
//! Every HTTP outcome is mapped onto `NotesError`; a 401 always becomes
//! `AuthenticationRequired` and asks the token source to reauthenticate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec;
use crate::config::SyncConfig;
use crate::error::{NotesError, NotesResult};
use crate::models::{
    truncate_to_millis, EntityKind, Folder, Note, ProcessingStatus, RecordVersion, SourceType,
    SyncStatus,
};
use crate::validation::validate_uuid_hex;

/// Max ids per `id=in.(...)` filter, keeps URLs well under server limits
const ID_FILTER_CHUNK: usize = 100;

/// Truncate long error bodies before they go into error messages and logs
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Result of pushing one batch.
///
/// Records are written in order and the batch stops at the first failure, so
/// `acknowledged` is always a prefix of the batch. Each entry carries the
/// modification clock that was written.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub acknowledged: Vec<(Uuid, DateTime<Utc>)>,
    pub failure: Option<NotesError>,
}

impl PushOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Records decoded from a read. Rows that could not be decoded are counted
/// in `malformed` instead of failing the whole read.
#[derive(Debug)]
pub struct Pulled<T> {
    pub records: Vec<T>,
    pub malformed: usize,
}

impl<T> Pulled<T> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            malformed: 0,
        }
    }

    pub fn append(&mut self, other: Pulled<T>) {
        self.records.extend(other.records);
        self.malformed += other.malformed;
    }
}

/// Remote side of a sync pass.
pub trait RemoteBackend: Send + Sync {
    /// Upsert notes. Binary columns are left out of the request entirely when
    /// `include_binary` is false, so the remote keeps its stored values.
    fn push_notes(
        &self,
        notes: &[Note],
        include_binary: bool,
    ) -> impl Future<Output = PushOutcome> + Send;

    fn push_folders(&self, folders: &[Folder]) -> impl Future<Output = PushOutcome> + Send;

    /// All notes of `user_id` modified at or after `since`, tombstones included,
    /// oldest first. `None` pulls everything.
    fn pull_notes(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = NotesResult<Pulled<Note>>> + Send;

    fn pull_folders(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = NotesResult<Pulled<Folder>>> + Send;

    /// Full notes by id, tombstones included
    fn fetch_notes(&self, ids: &[Uuid]) -> impl Future<Output = NotesResult<Pulled<Note>>> + Send;

    fn fetch_folders(&self, ids: &[Uuid]) -> impl Future<Output = NotesResult<Pulled<Folder>>> + Send;

    /// Stored clock and deletion state of the given rows. Ids unknown to the
    /// remote are absent from the result.
    fn fetch_versions(
        &self,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> impl Future<Output = NotesResult<Vec<RecordVersion>>> + Send;

    /// Clock and deletion state of every row of `user_id`, tombstones included
    fn list_versions(
        &self,
        kind: EntityKind,
        user_id: Uuid,
    ) -> impl Future<Output = NotesResult<Vec<RecordVersion>>> + Send;

    /// Ids of remote rows of `user_id` whose stored status is still `pending`
    fn fetch_remote_pending_ids(
        &self,
        kind: EntityKind,
        user_id: Uuid,
    ) -> impl Future<Output = NotesResult<Vec<Uuid>>> + Send;

    /// Set the stored status of the given remote rows to `synced`
    fn mark_remote_synced(
        &self,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> impl Future<Output = NotesResult<usize>> + Send;
}

/// Supplies bearer tokens. Token lifecycle belongs to the auth layer; the
/// sync engine only asks for a token and reports when it was rejected.
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;

    /// Called after the backend answered 401
    fn request_reauthentication(&self);
}

/// Fixed token, for service keys and tests
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }

    fn request_reauthentication(&self) {
        tracing::warn!("Static bearer token was rejected by the backend");
    }
}

/// Map an HTTP status to the error taxonomy. 2xx is Ok.
pub fn classify_status(status: StatusCode, body: &str) -> NotesResult<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(NotesError::AuthenticationRequired);
    }
    let message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    Err(NotesError::RemoteRejected {
        status: status.as_u16(),
        message,
    })
}

/// Remote tables the client can address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTable {
    Notes,
    Folders,
    QuizAnalytics,
    QuizProgress,
    UserSettings,
    UserProfile,
}

impl RemoteTable {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteTable::Notes => "notes",
            RemoteTable::Folders => "folders",
            RemoteTable::QuizAnalytics => "quiz_analytics",
            RemoteTable::QuizProgress => "quiz_progress",
            RemoteTable::UserSettings => "user_settings",
            RemoteTable::UserProfile => "user_profile",
        }
    }

    /// `bytea` columns of the table
    pub fn binary_columns(&self) -> &'static [&'static str] {
        match self {
            RemoteTable::Notes => &[
                "original_content",
                "ai_generated_content",
                "sections",
                "supplementary_materials",
                "mind_map",
            ],
            RemoteTable::QuizAnalytics => &["topic_performance"],
            RemoteTable::QuizProgress => &["answers"],
            RemoteTable::Folders | RemoteTable::UserSettings | RemoteTable::UserProfile => &[],
        }
    }
}

impl From<EntityKind> for RemoteTable {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Note => RemoteTable::Notes,
            EntityKind::Folder => RemoteTable::Folders,
        }
    }
}

/// Rewrite the binary columns of a row into canonical base64, whatever wire
/// shape they arrived in. Null and absent columns are left alone.
pub fn normalize_binary_columns(table: RemoteTable, row: &mut Map<String, Value>) {
    for column in table.binary_columns() {
        if let Some(bytes) = codec::decode(row.get(*column)) {
            row.insert((*column).to_string(), Value::String(codec::encode(&bytes)));
        }
    }
}

/// Timestamp in the form written to the backend
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a backend timestamp (RFC 3339, or Postgres text output)
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(truncate_to_millis(dt.with_timezone(&Utc)));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(truncate_to_millis(dt.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| truncate_to_millis(naive.and_utc()))
}

fn required_timestamp(value: Option<&str>, field: &str) -> NotesResult<DateTime<Utc>> {
    let raw = value.ok_or_else(|| NotesError::validation(field, "missing"))?;
    parse_timestamp(raw)
        .ok_or_else(|| NotesError::validation(field, format!("unparseable timestamp '{}'", raw)))
}

fn optional_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value.and_then(parse_timestamp)
}

fn optional_uuid(value: Option<&str>, field: &str) -> NotesResult<Option<Uuid>> {
    value.map(|v| validate_uuid_hex(v, field)).transpose()
}

// ============================================================================
// Wire rows
// ============================================================================

#[derive(Debug, Serialize)]
struct NoteWrite<'a> {
    id: Uuid,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ai_generated_content: Option<String>,
    source_type: &'static str,
    created_at: String,
    last_modified: String,
    is_favorite: bool,
    processing_status: &'static str,
    folder_id: Option<Uuid>,
    user_id: Uuid,
    sync_status: &'static str,
    deleted_at: Option<String>,
    transcript: Option<&'a str>,
    tags: &'a [String],
    language_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sections: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    supplementary_materials: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mind_map: Option<String>,
    video_id: Option<&'a str>,
}

impl<'a> NoteWrite<'a> {
    fn new(note: &'a Note, include_binary: bool) -> Self {
        let binary = |bytes: Option<&[u8]>| {
            if include_binary {
                codec::encode_opt(bytes)
            } else {
                None
            }
        };

        Self {
            id: note.id,
            title: &note.title,
            original_content: binary(Some(&note.original_content)),
            ai_generated_content: binary(note.ai_generated_content.as_deref()),
            source_type: note.source_type.as_str(),
            created_at: format_timestamp(note.created_at),
            last_modified: format_timestamp(note.last_modified),
            is_favorite: note.is_favorite,
            processing_status: note.processing_status.as_str(),
            folder_id: note.folder_id,
            user_id: note.user_id,
            sync_status: SyncStatus::Synced.as_str(),
            deleted_at: note.deleted_at.map(format_timestamp),
            transcript: note.transcript.as_deref(),
            tags: &note.tags,
            language_code: note.language_code.as_deref(),
            sections: binary(note.sections.as_deref()),
            supplementary_materials: binary(note.supplementary_materials.as_deref()),
            mind_map: binary(note.mind_map.as_deref()),
            video_id: note.video_id.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NoteRow {
    id: String,
    user_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    original_content: Option<Value>,
    #[serde(default)]
    ai_generated_content: Option<Value>,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    is_favorite: Option<bool>,
    #[serde(default)]
    processing_status: Option<String>,
    #[serde(default)]
    folder_id: Option<String>,
    #[serde(default)]
    deleted_at: Option<String>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    language_code: Option<String>,
    #[serde(default)]
    sections: Option<Value>,
    #[serde(default)]
    supplementary_materials: Option<Value>,
    #[serde(default)]
    mind_map: Option<Value>,
    #[serde(default)]
    video_id: Option<String>,
}

impl NoteRow {
    fn into_note(self) -> NotesResult<Note> {
        let last_modified = required_timestamp(self.last_modified.as_deref(), "last_modified")?;
        let created_at = optional_timestamp(self.created_at.as_deref()).unwrap_or(last_modified);

        Ok(Note {
            id: validate_uuid_hex(&self.id, "id")?,
            title: self.title.unwrap_or_default(),
            original_content: codec::decode(self.original_content.as_ref()).unwrap_or_default(),
            ai_generated_content: codec::decode(self.ai_generated_content.as_ref()),
            source_type: self
                .source_type
                .as_deref()
                .and_then(SourceType::from_str)
                .unwrap_or(SourceType::Text),
            created_at,
            last_modified,
            is_favorite: self.is_favorite.unwrap_or(false),
            processing_status: self
                .processing_status
                .as_deref()
                .and_then(ProcessingStatus::from_str)
                .unwrap_or(ProcessingStatus::Completed),
            folder_id: optional_uuid(self.folder_id.as_deref(), "folder_id")?,
            user_id: validate_uuid_hex(&self.user_id, "user_id")?,
            sync_status: Some(SyncStatus::Synced),
            deleted_at: optional_timestamp(self.deleted_at.as_deref()),
            transcript: self.transcript,
            tags: self.tags.unwrap_or_default(),
            language_code: self.language_code,
            sections: codec::decode(self.sections.as_ref()),
            supplementary_materials: codec::decode(self.supplementary_materials.as_ref()),
            mind_map: codec::decode(self.mind_map.as_ref()),
            video_id: self.video_id,
        })
    }
}

#[derive(Debug, Serialize)]
struct FolderWrite<'a> {
    id: Uuid,
    name: &'a str,
    color: &'a str,
    created_at: String,
    updated_at: String,
    sort_order: i64,
    user_id: Uuid,
    sync_status: &'static str,
    deleted_at: Option<String>,
}

impl<'a> From<&'a Folder> for FolderWrite<'a> {
    fn from(folder: &'a Folder) -> Self {
        Self {
            id: folder.id,
            name: &folder.name,
            color: &folder.color,
            created_at: format_timestamp(folder.created_at),
            updated_at: format_timestamp(folder.updated_at),
            sort_order: folder.sort_order,
            user_id: folder.user_id,
            sync_status: SyncStatus::Synced.as_str(),
            deleted_at: folder.deleted_at.map(format_timestamp),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FolderRow {
    id: String,
    user_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    sort_order: Option<i64>,
    #[serde(default)]
    deleted_at: Option<String>,
}

impl FolderRow {
    fn into_folder(self) -> NotesResult<Folder> {
        let updated_at = required_timestamp(self.updated_at.as_deref(), "updated_at")?;
        Ok(Folder {
            id: validate_uuid_hex(&self.id, "id")?,
            name: self.name.unwrap_or_default(),
            color: self.color.unwrap_or_else(|| "#8E8E93".to_string()),
            created_at: optional_timestamp(self.created_at.as_deref()).unwrap_or(updated_at),
            updated_at,
            sort_order: self.sort_order.unwrap_or(0),
            user_id: validate_uuid_hex(&self.user_id, "user_id")?,
            sync_status: Some(SyncStatus::Synced),
            deleted_at: optional_timestamp(self.deleted_at.as_deref()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

/// Row of a version lookup; the clock column is aliased to `clock` in the select
#[derive(Debug, Deserialize)]
struct VersionRow {
    id: String,
    clock: String,
    #[serde(default)]
    deleted_at: Option<String>,
}

impl VersionRow {
    fn into_version(self) -> NotesResult<RecordVersion> {
        Ok(RecordVersion {
            id: validate_uuid_hex(&self.id, "id")?,
            last_modified: required_timestamp(Some(&self.clock), "clock")?,
            deleted_at: optional_timestamp(self.deleted_at.as_deref()),
        })
    }
}

/// Column holding the last-write-wins clock of a remote table
fn clock_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Note => "last_modified",
        EntityKind::Folder => "updated_at",
    }
}

fn id_list(ids: &[Uuid]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode pulled rows one by one. A malformed row is logged and counted so
/// it cannot block the rest of the download.
fn decode_rows<R, T>(rows: Vec<Value>, convert: impl Fn(R) -> NotesResult<T>) -> Pulled<T>
where
    R: for<'de> Deserialize<'de>,
{
    let mut pulled = Pulled::empty();
    for row in rows {
        let parsed = serde_json::from_value::<R>(row)
            .map_err(NotesError::from)
            .and_then(&convert);
        match parsed {
            Ok(record) => pulled.records.push(record),
            Err(e) => {
                tracing::warn!("Skipping malformed remote row: {}", e);
                pulled.malformed += 1;
            }
        }
    }
    pulled
}

/// Version rows feed the decision whether to push, so they must all decode
fn decode_versions(table: RemoteTable, rows: Vec<Value>) -> NotesResult<Vec<RecordVersion>> {
    let versions = decode_rows(rows, VersionRow::into_version);
    if versions.malformed > 0 {
        return Err(NotesError::MalformedRows {
            table: table.name(),
            count: versions.malformed,
        });
    }
    Ok(versions.records)
}

// ============================================================================
// REST client
// ============================================================================

/// HTTP implementation of `RemoteBackend`
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    rest_base: String,
    api_key: String,
    token: Arc<dyn TokenSource>,
    page_size: usize,
}

impl RestClient {
    pub fn new(
        remote_url: &str,
        api_key: &str,
        token: Arc<dyn TokenSource>,
        timeout: Duration,
        page_size: usize,
    ) -> NotesResult<Self> {
        if remote_url.trim().is_empty() {
            return Err(NotesError::Config("remote_url is not set".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotesError::Network(e.to_string()))?;

        Ok(Self {
            client,
            rest_base: format!("{}/rest/v1", remote_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            token,
            page_size: page_size.max(1),
        })
    }

    /// Build a client from the `sync` section of the config
    pub fn from_config(config: &SyncConfig, token: Arc<dyn TokenSource>) -> NotesResult<Self> {
        Self::new(
            &config.remote_url,
            &config.api_key,
            token,
            Duration::from_secs(config.request_timeout_secs),
            config.page_size,
        )
    }

    fn table_url(&self, table: RemoteTable) -> String {
        format!("{}/{}", self.rest_base, table.name())
    }

    fn headers(&self) -> NotesResult<HeaderMap> {
        let token = match self.token.bearer_token() {
            Some(token) => token,
            None => {
                self.token.request_reauthentication();
                return Err(NotesError::AuthenticationRequired);
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| NotesError::Config(format!("Invalid api_key: {}", e)))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| NotesError::AuthenticationRequired)?,
        );
        Ok(headers)
    }

    fn request(&self, method: Method, url: &str) -> NotesResult<RequestBuilder> {
        Ok(self.client.request(method, url).headers(self.headers()?))
    }

    /// Send and map the status; the response is returned only on 2xx
    async fn send(&self, request: RequestBuilder) -> NotesResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = match classify_status(status, &body) {
            Err(e) => e,
            Ok(()) => NotesError::RemoteRejected {
                status: status.as_u16(),
                message: body,
            },
        };
        if matches!(err, NotesError::AuthenticationRequired) {
            self.token.request_reauthentication();
        }
        Err(err)
    }

    async fn upsert_one<T: Serialize + ?Sized>(&self, table: RemoteTable, row: &T) -> NotesResult<()> {
        let url = format!("{}?on_conflict=id", self.table_url(table));
        let request = self
            .request(Method::POST, &url)?
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row);
        self.send(request).await?;
        Ok(())
    }

    /// GET all pages of a filtered select
    async fn select_paged(
        &self,
        table: RemoteTable,
        select: &str,
        filters: &str,
        order: &str,
    ) -> NotesResult<Vec<Value>> {
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let url = format!(
                "{}?select={}{}&order={}&limit={}&offset={}",
                self.table_url(table),
                select,
                filters,
                order,
                self.page_size,
                offset
            );
            let page: Vec<Value> = self.send(self.request(Method::GET, &url)?).await?.json().await?;
            let fetched = page.len();
            rows.extend(page);
            tracing::trace!("Pulled {} rows from {} (offset {})", fetched, table.name(), offset);
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }

    /// GET the rows with the given ids, in chunks that keep URLs short
    async fn select_by_ids(&self, table: RemoteTable, select: &str, ids: &[Uuid]) -> NotesResult<Vec<Value>> {
        let mut rows = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_FILTER_CHUNK) {
            let url = format!(
                "{}?select={}&id=in.({})",
                self.table_url(table),
                select,
                id_list(chunk)
            );
            let page: Vec<Value> = self.send(self.request(Method::GET, &url)?).await?.json().await?;
            rows.extend(page);
        }
        Ok(rows)
    }

    fn version_select(kind: EntityKind) -> String {
        format!("id,clock:{},deleted_at", clock_column(kind))
    }

    fn since_filter(column: &str, since: Option<DateTime<Utc>>) -> String {
        match since {
            Some(ts) => format!(
                "&{}=gte.{}",
                column,
                urlencoding::encode(&format_timestamp(ts))
            ),
            None => String::new(),
        }
    }

    async fn push_each<T>(
        &self,
        table: RemoteTable,
        records: impl Iterator<Item = (Uuid, DateTime<Utc>, T)>,
    ) -> PushOutcome
    where
        T: Serialize,
    {
        let mut outcome = PushOutcome::default();
        for (id, modified, row) in records {
            match self.upsert_one(table, &row).await {
                Ok(()) => outcome.acknowledged.push((id, modified)),
                Err(e) => {
                    tracing::warn!("Push to {} failed at {}: {}", table.name(), id, e);
                    outcome.failure = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    // ------------------------------------------------------------------------
    // Auxiliary tables
    // ------------------------------------------------------------------------

    /// Upsert raw rows into an auxiliary table.
    ///
    /// Binary columns given as byte arrays or tagged buffers are rewritten to
    /// base64 first.
    pub async fn upsert_rows(&self, table: RemoteTable, rows: Vec<Map<String, Value>>) -> NotesResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows: Vec<Map<String, Value>> = rows
            .into_iter()
            .map(|mut row| {
                normalize_binary_columns(table, &mut row);
                row
            })
            .collect();

        let count = rows.len();
        let url = format!("{}?on_conflict=id", self.table_url(table));
        let request = self
            .request(Method::POST, &url)?
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        self.send(request).await?;
        Ok(count)
    }

    /// All rows of `user_id` in an auxiliary table, binary columns normalized
    /// to base64
    pub async fn select_rows(&self, table: RemoteTable, user_id: Uuid) -> NotesResult<Vec<Map<String, Value>>> {
        let filters = format!("&user_id=eq.{}", user_id);
        let rows = self.select_paged(table, "*", &filters, "id.asc").await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(mut map) => {
                    normalize_binary_columns(table, &mut map);
                    Some(map)
                }
                _ => None,
            })
            .collect())
    }
}

impl RemoteBackend for RestClient {
    async fn push_notes(&self, notes: &[Note], include_binary: bool) -> PushOutcome {
        let rows = notes
            .iter()
            .map(|note| (note.id, note.last_modified, NoteWrite::new(note, include_binary)));
        self.push_each(RemoteTable::Notes, rows).await
    }

    async fn push_folders(&self, folders: &[Folder]) -> PushOutcome {
        let rows = folders
            .iter()
            .map(|folder| (folder.id, folder.updated_at, FolderWrite::from(folder)));
        self.push_each(RemoteTable::Folders, rows).await
    }

    async fn pull_notes(&self, user_id: Uuid, since: Option<DateTime<Utc>>) -> NotesResult<Pulled<Note>> {
        let filters = format!(
            "&user_id=eq.{}{}",
            user_id,
            Self::since_filter("last_modified", since)
        );
        let rows = self
            .select_paged(RemoteTable::Notes, "*", &filters, "last_modified.asc,id.asc")
            .await?;
        Ok(decode_rows(rows, NoteRow::into_note))
    }

    async fn pull_folders(&self, user_id: Uuid, since: Option<DateTime<Utc>>) -> NotesResult<Pulled<Folder>> {
        let filters = format!(
            "&user_id=eq.{}{}",
            user_id,
            Self::since_filter("updated_at", since)
        );
        let rows = self
            .select_paged(RemoteTable::Folders, "*", &filters, "updated_at.asc,id.asc")
            .await?;
        Ok(decode_rows(rows, FolderRow::into_folder))
    }

    async fn fetch_notes(&self, ids: &[Uuid]) -> NotesResult<Pulled<Note>> {
        let rows = self.select_by_ids(RemoteTable::Notes, "*", ids).await?;
        Ok(decode_rows(rows, NoteRow::into_note))
    }

    async fn fetch_folders(&self, ids: &[Uuid]) -> NotesResult<Pulled<Folder>> {
        let rows = self.select_by_ids(RemoteTable::Folders, "*", ids).await?;
        Ok(decode_rows(rows, FolderRow::into_folder))
    }

    async fn fetch_versions(&self, kind: EntityKind, ids: &[Uuid]) -> NotesResult<Vec<RecordVersion>> {
        let table = RemoteTable::from(kind);
        let rows = self.select_by_ids(table, &Self::version_select(kind), ids).await?;
        decode_versions(table, rows)
    }

    async fn list_versions(&self, kind: EntityKind, user_id: Uuid) -> NotesResult<Vec<RecordVersion>> {
        let table = RemoteTable::from(kind);
        let filters = format!("&user_id=eq.{}", user_id);
        let rows = self
            .select_paged(table, &Self::version_select(kind), &filters, "id.asc")
            .await?;
        decode_versions(table, rows)
    }

    async fn fetch_remote_pending_ids(&self, kind: EntityKind, user_id: Uuid) -> NotesResult<Vec<Uuid>> {
        let table = RemoteTable::from(kind);
        let url = format!(
            "{}?select=id&user_id=eq.{}&sync_status=eq.pending",
            self.table_url(table),
            user_id
        );
        let rows: Vec<IdRow> = self.send(self.request(Method::GET, &url)?).await?.json().await?;
        rows.iter()
            .map(|row| validate_uuid_hex(&row.id, "id"))
            .collect()
    }

    async fn mark_remote_synced(&self, kind: EntityKind, ids: &[Uuid]) -> NotesResult<usize> {
        let table = RemoteTable::from(kind);
        let body = serde_json::json!({ "sync_status": SyncStatus::Synced.as_str() });
        let mut updated = 0;
        for chunk in ids.chunks(ID_FILTER_CHUNK) {
            let url = format!("{}?id=in.({})", self.table_url(table), id_list(chunk));
            let request = self
                .request(Method::PATCH, &url)?
                .header("Prefer", "return=minimal")
                .json(&body);
            self.send(request).await?;
            updated += chunk.len();
        }
        Ok(updated)
    }
}

/// In-memory backend for orchestrator and repair tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeRemote {
        pub notes: Mutex<HashMap<Uuid, Note>>,
        pub folders: Mutex<HashMap<Uuid, Folder>>,
        /// Remote-side stored status per row; rows absent here count as synced
        pub pending_rows: Mutex<Vec<(EntityKind, Uuid)>>,
        /// 1-based index of the note write that fails with a network error
        pub fail_note_write: Mutex<Option<usize>>,
        pub reject_auth: AtomicBool,
        pub fail_pull: AtomicBool,
        pub pull_delay: Mutex<Option<Duration>>,
        /// Undecodable rows reported alongside every note pull
        pub malformed_note_rows: AtomicUsize,
        pub note_writes: AtomicUsize,
        pub pulls: AtomicUsize,
        pub version_listings: AtomicUsize,
        /// Records returned by fetch-by-id calls
        pub fetched_by_id: AtomicUsize,
    }

    impl FakeRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_note(&self, note: Note) {
            self.notes.lock().unwrap().insert(note.id, note);
        }

        pub fn insert_folder(&self, folder: Folder) {
            self.folders.lock().unwrap().insert(folder.id, folder);
        }

        pub fn note(&self, id: Uuid) -> Option<Note> {
            self.notes.lock().unwrap().get(&id).cloned()
        }

        pub fn folder(&self, id: Uuid) -> Option<Folder> {
            self.folders.lock().unwrap().get(&id).cloned()
        }

        fn auth(&self) -> NotesResult<()> {
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(NotesError::AuthenticationRequired);
            }
            Ok(())
        }

        async fn before_pull(&self) -> NotesResult<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.pull_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.auth()?;
            if self.fail_pull.load(Ordering::SeqCst) {
                return Err(NotesError::network("pull timed out"));
            }
            Ok(())
        }

        fn note_version(n: &Note) -> RecordVersion {
            RecordVersion {
                id: n.id,
                last_modified: n.last_modified,
                deleted_at: n.deleted_at,
            }
        }

        fn folder_version(f: &Folder) -> RecordVersion {
            RecordVersion {
                id: f.id,
                last_modified: f.updated_at,
                deleted_at: f.deleted_at,
            }
        }
    }

    impl RemoteBackend for FakeRemote {
        async fn push_notes(&self, notes: &[Note], include_binary: bool) -> PushOutcome {
            let mut outcome = PushOutcome::default();
            for note in notes {
                if let Err(e) = self.auth() {
                    outcome.failure = Some(e);
                    break;
                }
                let write = self.note_writes.fetch_add(1, Ordering::SeqCst) + 1;
                if *self.fail_note_write.lock().unwrap() == Some(write) {
                    outcome.failure = Some(NotesError::network("connection reset"));
                    break;
                }

                let mut stored = note.clone();
                stored.sync_status = Some(SyncStatus::Synced);
                let mut notes = self.notes.lock().unwrap();
                if !include_binary {
                    // Omitted columns keep their remote values
                    let existing = notes.get(&note.id);
                    stored.original_content =
                        existing.map(|n| n.original_content.clone()).unwrap_or_default();
                    stored.ai_generated_content = existing.and_then(|n| n.ai_generated_content.clone());
                    stored.sections = existing.and_then(|n| n.sections.clone());
                    stored.supplementary_materials =
                        existing.and_then(|n| n.supplementary_materials.clone());
                    stored.mind_map = existing.and_then(|n| n.mind_map.clone());
                }
                notes.insert(note.id, stored);
                outcome.acknowledged.push((note.id, note.last_modified));
            }
            outcome
        }

        async fn push_folders(&self, folders: &[Folder]) -> PushOutcome {
            let mut outcome = PushOutcome::default();
            for folder in folders {
                if let Err(e) = self.auth() {
                    outcome.failure = Some(e);
                    break;
                }
                let mut stored = folder.clone();
                stored.sync_status = Some(SyncStatus::Synced);
                self.folders.lock().unwrap().insert(folder.id, stored);
                outcome.acknowledged.push((folder.id, folder.updated_at));
            }
            outcome
        }

        async fn pull_notes(&self, user_id: Uuid, since: Option<DateTime<Utc>>) -> NotesResult<Pulled<Note>> {
            self.before_pull().await?;
            let mut notes: Vec<Note> = self
                .notes
                .lock()
                .unwrap()
                .values()
                .filter(|n| n.user_id == user_id)
                .filter(|n| since.map_or(true, |ts| n.last_modified >= ts))
                .cloned()
                .collect();
            notes.sort_by_key(|n| (n.last_modified, n.id));
            Ok(Pulled {
                records: notes,
                malformed: self.malformed_note_rows.load(Ordering::SeqCst),
            })
        }

        async fn pull_folders(&self, user_id: Uuid, since: Option<DateTime<Utc>>) -> NotesResult<Pulled<Folder>> {
            self.before_pull().await?;
            let mut folders: Vec<Folder> = self
                .folders
                .lock()
                .unwrap()
                .values()
                .filter(|f| f.user_id == user_id)
                .filter(|f| since.map_or(true, |ts| f.updated_at >= ts))
                .cloned()
                .collect();
            folders.sort_by_key(|f| (f.updated_at, f.id));
            Ok(Pulled {
                records: folders,
                malformed: 0,
            })
        }

        async fn fetch_notes(&self, ids: &[Uuid]) -> NotesResult<Pulled<Note>> {
            self.auth()?;
            let notes = self.notes.lock().unwrap();
            let records: Vec<Note> = ids.iter().filter_map(|id| notes.get(id)).cloned().collect();
            self.fetched_by_id.fetch_add(records.len(), Ordering::SeqCst);
            Ok(Pulled {
                records,
                malformed: 0,
            })
        }

        async fn fetch_folders(&self, ids: &[Uuid]) -> NotesResult<Pulled<Folder>> {
            self.auth()?;
            let folders = self.folders.lock().unwrap();
            let records: Vec<Folder> = ids.iter().filter_map(|id| folders.get(id)).cloned().collect();
            self.fetched_by_id.fetch_add(records.len(), Ordering::SeqCst);
            Ok(Pulled {
                records,
                malformed: 0,
            })
        }

        async fn list_versions(&self, kind: EntityKind, user_id: Uuid) -> NotesResult<Vec<RecordVersion>> {
            self.auth()?;
            self.version_listings.fetch_add(1, Ordering::SeqCst);
            let versions = match kind {
                EntityKind::Note => self
                    .notes
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|n| n.user_id == user_id)
                    .map(Self::note_version)
                    .collect(),
                EntityKind::Folder => self
                    .folders
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|f| f.user_id == user_id)
                    .map(Self::folder_version)
                    .collect(),
            };
            Ok(versions)
        }

        async fn fetch_versions(&self, kind: EntityKind, ids: &[Uuid]) -> NotesResult<Vec<RecordVersion>> {
            self.auth()?;
            let versions = match kind {
                EntityKind::Note => {
                    let notes = self.notes.lock().unwrap();
                    ids.iter()
                        .filter_map(|id| notes.get(id))
                        .map(Self::note_version)
                        .collect()
                }
                EntityKind::Folder => {
                    let folders = self.folders.lock().unwrap();
                    ids.iter()
                        .filter_map(|id| folders.get(id))
                        .map(Self::folder_version)
                        .collect()
                }
            };
            Ok(versions)
        }

        async fn fetch_remote_pending_ids(&self, kind: EntityKind, _user_id: Uuid) -> NotesResult<Vec<Uuid>> {
            self.auth()?;
            Ok(self
                .pending_rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, id)| *id)
                .collect())
        }

        async fn mark_remote_synced(&self, kind: EntityKind, ids: &[Uuid]) -> NotesResult<usize> {
            self.auth()?;
            let mut pending = self.pending_rows.lock().unwrap();
            let before = pending.len();
            pending.retain(|(k, id)| !(*k == kind && ids.contains(id)));
            Ok(before - pending.len())
        }
    }
}
