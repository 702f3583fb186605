//! # Messages Module
//!
//! Room-scoped chat messages. Messages are ephemeral demo data: a periodic
//! sweep deletes anything older than the retention window, and owners can
//! delete their own messages early. Deletes are idempotent and ownership is
//! checked per record.

use crate::api::AppState;
use crate::db::{field_i64, field_str, now_ms, validate_room_id, RoomStore, SqlValue};
use crate::error::{RoomError, RoomResult};
use crate::identity::{Caller, MAX_USER_NAME_LENGTH};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Maximum message content length
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Messages older than this are swept (60 seconds)
pub const MESSAGE_RETENTION_MS: i64 = 60_000;

/// Room listing cap; retention keeps rooms far below this in practice
const LIST_LIMIT: i64 = 200;

/// A chat message
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub user_name: String,
    pub content: String,
    pub created_at: i64,
}

/// Message service over the room store
#[derive(Clone)]
pub struct MessageService {
    store: Arc<RoomStore>,
}

impl MessageService {
    pub fn new(store: Arc<RoomStore>) -> Self {
        Self { store }
    }

    /// Send a message to a room. Content must be non-blank after trimming
    /// and within the length limit; the display name is truncated.
    pub async fn send(
        &self,
        room_id: &str,
        caller: &Caller,
        content: &str,
        user_name: &str,
    ) -> RoomResult<String> {
        validate_room_id(room_id)?;

        let content = content.trim();
        if content.is_empty() {
            return Err(RoomError::EmptyMessage);
        }
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(RoomError::MessageTooLong {
                max: MAX_MESSAGE_LENGTH,
            });
        }

        let user_name: String = user_name.trim().chars().take(MAX_USER_NAME_LENGTH).collect();
        if user_name.is_empty() {
            return Err(RoomError::InvalidPayload(
                "user name cannot be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        self.store
            .execute(
                "INSERT INTO messages (id, room_id, user_id, session_id, user_name, content, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)"
                    .to_string(),
                vec![
                    SqlValue::Text(id.clone()),
                    SqlValue::Text(room_id.to_string()),
                    SqlValue::opt_text(caller.user_id.clone()),
                    SqlValue::opt_text(caller.session_id.clone()),
                    SqlValue::Text(user_name),
                    SqlValue::Text(content.to_string()),
                    SqlValue::Integer(now_ms()),
                ],
            )
            .await?;

        Ok(id)
    }

    /// Messages for a room in insertion order
    pub async fn list(&self, room_id: &str) -> RoomResult<Vec<Message>> {
        validate_room_id(room_id)?;

        let rows = self
            .store
            .query(
                "SELECT id, room_id, user_id, session_id, user_name, content, created_at
                 FROM messages WHERE room_id = ? ORDER BY created_at ASC, rowid ASC LIMIT ?"
                    .to_string(),
                vec![
                    SqlValue::Text(room_id.to_string()),
                    SqlValue::Integer(LIST_LIMIT),
                ],
            )
            .await?;

        rows.iter().map(|row| row_to_message(row)).collect()
    }

    /// Delete a message. Absent record is a success; a record the caller
    /// does not own is silently skipped, also a success. Returns the room id
    /// when a row was actually removed so the caller can notify subscribers.
    pub async fn remove(&self, message_id: &str, caller: &Caller) -> RoomResult<Option<String>> {
        let rows = self
            .store
            .query(
                "SELECT room_id, user_id, session_id FROM messages WHERE id = ?".to_string(),
                vec![SqlValue::Text(message_id.to_string())],
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None); // already deleted
        };

        let owner_user = field_str(row, "user_id");
        let owner_session = field_str(row, "session_id");
        if !caller.may_delete(owner_user.as_deref(), owner_session.as_deref()) {
            debug!(message_id, "delete skipped: caller does not own message");
            return Ok(None);
        }

        self.store
            .execute(
                "DELETE FROM messages WHERE id = ?".to_string(),
                vec![SqlValue::Text(message_id.to_string())],
            )
            .await?;
        Ok(field_str(row, "room_id"))
    }

    /// Delete up to `limit` messages created before `cutoff`, sequentially
    pub async fn sweep_expired(&self, cutoff: i64, limit: i64) -> RoomResult<u64> {
        let rows = self
            .store
            .query(
                "SELECT id FROM messages WHERE created_at < ? LIMIT ?".to_string(),
                vec![SqlValue::Integer(cutoff), SqlValue::Integer(limit)],
            )
            .await?;

        let mut deleted = 0u64;
        for row in &rows {
            if let Some(id) = field_str(row, "id") {
                deleted += self
                    .store
                    .execute(
                        "DELETE FROM messages WHERE id = ?".to_string(),
                        vec![SqlValue::Text(id)],
                    )
                    .await?;
            }
        }
        Ok(deleted)
    }
}

fn row_to_message(row: &[(String, Value)]) -> RoomResult<Message> {
    Ok(Message {
        id: field_str(row, "id")
            .ok_or_else(|| RoomError::Internal(anyhow::anyhow!("Missing field: id")))?,
        room_id: field_str(row, "room_id").unwrap_or_default(),
        user_id: field_str(row, "user_id"),
        session_id: field_str(row, "session_id"),
        user_name: field_str(row, "user_name").unwrap_or_default(),
        content: field_str(row, "content").unwrap_or_default(),
        created_at: field_i64(row, "created_at").unwrap_or(0),
    })
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub user_name: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /v1/rooms/:room_id/messages
async fn send_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, RoomError> {
    let caller = state.identity.resolve_caller(&headers, req.session_id);
    let id = state
        .messages
        .send(&room_id, &caller, &req.content, &req.user_name)
        .await?;

    state.publish(&room_id, json!({ "event": "message", "room_id": room_id }));

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": { "id": id } })),
    ))
}

/// GET /v1/rooms/:room_id/messages
async fn list_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, RoomError> {
    let messages = state.messages.list(&room_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": messages,
        "count": messages.len(),
    })))
}

/// DELETE /v1/messages/:id
async fn remove_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RoomError> {
    let caller = state.identity.resolve_caller(&headers, query.session_id);
    if let Some(room_id) = state.messages.remove(&id, &caller).await? {
        state.publish(&room_id, json!({ "event": "message", "room_id": room_id }));
    }
    Ok(Json(json!({ "success": true })))
}

/// Message routes, nested under /v1 by the main router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms/:room_id/messages", post(send_handler))
        .route("/rooms/:room_id/messages", get(list_handler))
        .route("/messages/:id", delete(remove_handler))
}

// ============================================================================
// Tests
// ============================================================================
