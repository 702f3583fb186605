//! # Files Module
//!
//! Ephemeral file uploads: blobs on the local filesystem, metadata in the
//! room store. Each record wraps an opaque storage id naming the blob on
//! disk; deleting a record removes both, and a blob already missing on disk
//! never fails the delete.

use crate::api::AppState;
use crate::db::{field_i64, field_str, now_ms, RoomStore, SqlValue};
use crate::error::{RoomError, RoomResult};
use crate::identity::Caller;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default blob directory (relative to current working directory)
const DEFAULT_STORAGE_PATH: &str = "./roomsync_files";

/// Maximum file size (50 MB)
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// File names are trimmed and capped at this length
pub const MAX_FILENAME_LENGTH: usize = 255;

/// File records older than this are swept (60 seconds)
pub const FILE_RETENTION_MS: i64 = 60_000;

/// Request body limit for uploads: the file cap plus headroom for multipart
/// framing, so an oversized file still reaches the size check and gets the
/// structured error instead of a generic body-limit rejection
const UPLOAD_BODY_LIMIT: usize = MAX_FILE_SIZE + 1024 * 1024;

/// File metadata record
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub storage_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub created_at: i64,
}

/// A record with its download URL, as returned by listings
#[derive(Debug, Serialize)]
pub struct FileWithUrl {
    #[serde(flatten)]
    pub record: FileRecord,
    pub url: String,
}

/// File service: filesystem blobs plus metadata rows
#[derive(Clone)]
pub struct FileService {
    store: Arc<RoomStore>,
    root: PathBuf,
}

impl FileService {
    pub fn new(store: Arc<RoomStore>, root: Option<PathBuf>) -> Self {
        let root = root.unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH));
        Self { store, root }
    }

    fn blob_path(&self, storage_id: &str) -> PathBuf {
        self.root.join(storage_id)
    }

    /// Store a blob and its metadata record, owned by the caller
    pub async fn save(
        &self,
        caller: &Caller,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> RoomResult<FileRecord> {
        if data.len() > MAX_FILE_SIZE {
            return Err(RoomError::FileTooLarge { max: MAX_FILE_SIZE });
        }
        let name: String = name.trim().chars().take(MAX_FILENAME_LENGTH).collect();
        if name.is_empty() {
            return Err(RoomError::InvalidPayload(
                "file name cannot be empty".to_string(),
            ));
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RoomError::Storage(format!("Failed to create storage directory: {}", e)))?;

        let storage_id = Uuid::new_v4().to_string();
        fs::write(self.blob_path(&storage_id), &data)
            .await
            .map_err(|e| RoomError::Storage(format!("Failed to write blob: {}", e)))?;

        let id = Uuid::new_v4().to_string();
        let size = data.len() as i64;
        self.store
            .execute(
                "INSERT INTO files (id, storage_id, user_id, session_id, name, mime_type, size, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
                    .to_string(),
                vec![
                    SqlValue::Text(id.clone()),
                    SqlValue::Text(storage_id.clone()),
                    SqlValue::opt_text(caller.user_id.clone()),
                    SqlValue::opt_text(caller.session_id.clone()),
                    SqlValue::Text(name),
                    SqlValue::Text(mime_type.to_string()),
                    SqlValue::Integer(size),
                    SqlValue::Integer(now_ms()),
                ],
            )
            .await?;

        info!("Stored file {} ({} bytes)", storage_id, size);
        self.get(&id).await
    }

    /// Get a record by id
    pub async fn get(&self, id: &str) -> RoomResult<FileRecord> {
        let rows = self
            .store
            .query(
                "SELECT id, storage_id, user_id, session_id, name, mime_type, size, created_at
                 FROM files WHERE id = ?"
                    .to_string(),
                vec![SqlValue::Text(id.to_string())],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| RoomError::not_found("File not found"))?;
        row_to_record(row)
    }

    /// The caller's files: by user when authenticated, else by session.
    /// A caller with no identity sees an empty list.
    pub async fn list(&self, caller: &Caller) -> RoomResult<Vec<FileWithUrl>> {
        let rows = if let Some(user_id) = &caller.user_id {
            self.store
                .query(
                    "SELECT id, storage_id, user_id, session_id, name, mime_type, size, created_at
                     FROM files WHERE user_id = ? ORDER BY created_at ASC"
                        .to_string(),
                    vec![SqlValue::Text(user_id.clone())],
                )
                .await?
        } else if let Some(session_id) = &caller.session_id {
            self.store
                .query(
                    "SELECT id, storage_id, user_id, session_id, name, mime_type, size, created_at
                     FROM files WHERE session_id = ? ORDER BY created_at ASC"
                        .to_string(),
                    vec![SqlValue::Text(session_id.clone())],
                )
                .await?
        } else {
            return Ok(vec![]);
        };

        rows.iter()
            .map(|row| {
                let record = row_to_record(row)?;
                let url = download_url(&record.storage_id);
                Ok(FileWithUrl { record, url })
            })
            .collect()
    }

    /// Read a blob by storage id, returning its bytes, mime type, and name
    pub async fn read(&self, storage_id: &str) -> RoomResult<(Vec<u8>, String, String)> {
        let rows = self
            .store
            .query(
                "SELECT name, mime_type FROM files WHERE storage_id = ?".to_string(),
                vec![SqlValue::Text(storage_id.to_string())],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| RoomError::not_found("File not found"))?;

        let data = fs::read(self.blob_path(storage_id))
            .await
            .map_err(|e| RoomError::Storage(format!("Failed to read blob: {}", e)))?;

        Ok((
            data,
            field_str(row, "mime_type").unwrap_or_else(|| "application/octet-stream".to_string()),
            field_str(row, "name").unwrap_or_default(),
        ))
    }

    /// Delete a record and its blob. Absent record or unowned record is a
    /// quiet success, matching message deletion semantics.
    pub async fn remove(&self, file_id: &str, caller: &Caller) -> RoomResult<bool> {
        let rows = self
            .store
            .query(
                "SELECT storage_id, user_id, session_id FROM files WHERE id = ?".to_string(),
                vec![SqlValue::Text(file_id.to_string())],
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(false); // already deleted
        };

        let owner_user = field_str(row, "user_id");
        let owner_session = field_str(row, "session_id");
        if !caller.may_delete(owner_user.as_deref(), owner_session.as_deref()) {
            debug!(file_id, "delete skipped: caller does not own file");
            return Ok(false);
        }

        if let Some(storage_id) = field_str(row, "storage_id") {
            self.remove_blob(&storage_id).await?;
        }
        self.store
            .execute(
                "DELETE FROM files WHERE id = ?".to_string(),
                vec![SqlValue::Text(file_id.to_string())],
            )
            .await?;
        Ok(true)
    }

    /// Remove a blob from disk; a blob already gone is not an error
    pub async fn remove_blob(&self, storage_id: &str) -> RoomResult<()> {
        match fs::remove_file(self.blob_path(storage_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob {} already missing on delete", storage_id);
                Ok(())
            }
            Err(e) => Err(RoomError::Storage(format!("Failed to delete blob: {}", e))),
        }
    }

    /// Delete up to `limit` records created before `cutoff`, blobs first,
    /// sequentially
    pub async fn sweep_expired(&self, cutoff: i64, limit: i64) -> RoomResult<u64> {
        let rows = self
            .store
            .query(
                "SELECT id, storage_id FROM files WHERE created_at < ? LIMIT ?".to_string(),
                vec![SqlValue::Integer(cutoff), SqlValue::Integer(limit)],
            )
            .await?;

        let mut deleted = 0u64;
        for row in &rows {
            if let Some(storage_id) = field_str(row, "storage_id") {
                self.remove_blob(&storage_id).await?;
            }
            if let Some(id) = field_str(row, "id") {
                deleted += self
                    .store
                    .execute(
                        "DELETE FROM files WHERE id = ?".to_string(),
                        vec![SqlValue::Text(id)],
                    )
                    .await?;
            }
        }
        Ok(deleted)
    }
}

fn download_url(storage_id: &str) -> String {
    format!("/v1/files/{}/content", storage_id)
}

fn row_to_record(row: &[(String, Value)]) -> RoomResult<FileRecord> {
    Ok(FileRecord {
        id: field_str(row, "id")
            .ok_or_else(|| RoomError::Internal(anyhow::anyhow!("Missing field: id")))?,
        storage_id: field_str(row, "storage_id").unwrap_or_default(),
        user_id: field_str(row, "user_id"),
        session_id: field_str(row, "session_id"),
        name: field_str(row, "name").unwrap_or_default(),
        mime_type: field_str(row, "mime_type").unwrap_or_default(),
        size: field_i64(row, "size").unwrap_or(0),
        created_at: field_i64(row, "created_at").unwrap_or(0),
    })
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct FileSessionQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /v1/files - multipart upload, field name "file"
async fn upload_handler(
    State(state): State<AppState>,
    Query(query): Query<FileSessionQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, RoomError> {
    let caller = state.identity.resolve_caller(&headers, query.session_id);

    let mut upload: Option<(Vec<u8>, String, String)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RoomError::InvalidPayload(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            let name = field
                .file_name()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "upload".to_string());
            let mime_type = field
                .content_type()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let data = field
                .bytes()
                .await
                .map_err(|e| RoomError::InvalidPayload(format!("Failed to read file: {}", e)))?;
            upload = Some((data.to_vec(), name, mime_type));
            break;
        }
    }

    let (data, name, mime_type) =
        upload.ok_or_else(|| RoomError::InvalidPayload("No file provided".to_string()))?;

    let record = state.files.save(&caller, &name, &mime_type, data).await?;
    let url = download_url(&record.storage_id);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": FileWithUrl { record, url } })),
    ))
}

/// GET /v1/files - the caller's files
async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<FileSessionQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RoomError> {
    let caller = state.identity.resolve_caller(&headers, query.session_id);
    let files = state.files.list(&caller).await?;
    Ok(Json(json!({
        "success": true,
        "data": files,
        "count": files.len(),
    })))
}

/// GET /v1/files/:storage_id/content - download
async fn download_handler(
    State(state): State<AppState>,
    Path(storage_id): Path<String>,
) -> Result<impl IntoResponse, RoomError> {
    let (data, mime_type, name) = state.files.read(&storage_id).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", name),
            ),
        ],
        data,
    ))
}

/// DELETE /v1/files/:id
async fn remove_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FileSessionQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RoomError> {
    let caller = state.identity.resolve_caller(&headers, query.session_id);
    state.files.remove(&id, &caller).await?;
    Ok(Json(json!({ "success": true })))
}

/// File routes, nested under /v1 by the main router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/files", post(upload_handler))
        .route("/files", get(list_handler))
        .route("/files/:storage_id/content", get(download_handler))
        .route("/files/:id", delete(remove_handler))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
}

// ============================================================================
// Tests
// ============================================================================
