//! # Presence Module
//!
//! Room presence entries: who is in a room right now, with arbitrary display
//! data (cursor position, name, color, status). Clients re-send a heartbeat
//! at an interval shorter than the timeout; an entry is active iff
//! `now - last_seen < PRESENCE_TIMEOUT_MS`.
//!
//! Lookups prioritize the session id over the user id so a single
//! authenticated account can project multiple concurrent cursors (two tabs,
//! two iframes). Only when no session id is supplied does the user id key
//! the entry.

use crate::api::AppState;
use crate::db::{field_i64, field_str, now_ms, validate_room_id, RoomStore, SqlValue};
use crate::error::{RoomError, RoomResult};
use crate::identity::Caller;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{delete, get, put},
    Json, Router,
};
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// An entry is active iff `now - last_seen` is below this (30 seconds)
pub const PRESENCE_TIMEOUT_MS: i64 = 30_000;

/// A live presence entry in a room
#[derive(Debug, Clone, serde::Serialize)]
pub struct PresenceEntry {
    pub id: String,
    pub room_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub data: Value,
    pub last_seen: i64,
}

/// Presence service over the room store
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<RoomStore>,
}

impl PresenceService {
    pub fn new(store: Arc<RoomStore>) -> Self {
        Self { store }
    }

    /// Heartbeat: upsert the caller's entry and stamp `last_seen`.
    ///
    /// A caller with no identity at all is a no-op success so an anonymous
    /// page view never errors. The lookup and write run in one immediate
    /// transaction, so two racing heartbeats cannot create duplicate rows.
    pub async fn heartbeat(
        &self,
        room_id: &str,
        caller: &Caller,
        data: Value,
    ) -> RoomResult<bool> {
        validate_room_id(room_id)?;
        if !data.is_object() {
            return Err(RoomError::InvalidPayload(
                "presence data must be a JSON object".to_string(),
            ));
        }
        if !caller.has_identity() {
            return Ok(false);
        }

        let room = room_id.to_string();
        let user_id = caller.user_id.clone();
        let session_id = caller.session_id.clone();
        let data_str = data.to_string();
        let now = now_ms();

        self.store
            .with_transaction(move |tx| {
                let existing: Option<String> = if let Some(sid) = &session_id {
                    tx.query_row(
                        "SELECT id FROM presence WHERE session_id = ?1 AND room_id = ?2",
                        params![sid, room],
                        |r| r.get(0),
                    )
                    .optional()?
                } else if let Some(uid) = &user_id {
                    tx.query_row(
                        "SELECT id FROM presence WHERE user_id = ?1 AND room_id = ?2",
                        params![uid, room],
                        |r| r.get(0),
                    )
                    .optional()?
                } else {
                    None
                };

                match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE presence SET data = ?1, last_seen = ?2 WHERE id = ?3",
                            params![data_str, now, id],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO presence (id, room_id, user_id, session_id, data, last_seen)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            params![
                                Uuid::new_v4().to_string(),
                                room,
                                user_id,
                                session_id,
                                data_str,
                                now
                            ],
                        )?;
                    }
                }
                Ok(())
            })
            .await?;

        Ok(true)
    }

    /// Active entries for a room. Stale rows are filtered out by the read;
    /// the cleanup sweep deletes them later.
    pub async fn list(&self, room_id: &str) -> RoomResult<Vec<PresenceEntry>> {
        validate_room_id(room_id)?;
        let cutoff = now_ms() - PRESENCE_TIMEOUT_MS;

        let rows = self
            .store
            .query(
                "SELECT id, room_id, user_id, session_id, data, last_seen
                 FROM presence WHERE room_id = ? AND last_seen > ?"
                    .to_string(),
                vec![
                    SqlValue::Text(room_id.to_string()),
                    SqlValue::Integer(cutoff),
                ],
            )
            .await?;

        rows.iter().map(|row| row_to_entry(row)).collect()
    }

    /// Explicit leave: delete the caller's entry directly rather than
    /// patching it stale, which would race a concurrent heartbeat update.
    /// Absent entry is a no-op success.
    pub async fn leave(&self, room_id: &str, caller: &Caller) -> RoomResult<bool> {
        validate_room_id(room_id)?;
        if !caller.has_identity() {
            return Ok(false);
        }

        let room = room_id.to_string();
        let user_id = caller.user_id.clone();
        let session_id = caller.session_id.clone();

        let deleted = self
            .store
            .with_transaction(move |tx| {
                // Same precedence as heartbeat
                let existing: Option<String> = if let Some(sid) = &session_id {
                    tx.query_row(
                        "SELECT id FROM presence WHERE session_id = ?1 AND room_id = ?2",
                        params![sid, room],
                        |r| r.get(0),
                    )
                    .optional()?
                } else if let Some(uid) = &user_id {
                    tx.query_row(
                        "SELECT id FROM presence WHERE user_id = ?1 AND room_id = ?2",
                        params![uid, room],
                        |r| r.get(0),
                    )
                    .optional()?
                } else {
                    None
                };

                match existing {
                    Some(id) => {
                        tx.execute("DELETE FROM presence WHERE id = ?1", params![id])?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await?;

        debug!(room_id, deleted, "presence leave");
        Ok(deleted)
    }

    /// Delete up to `limit` entries with `last_seen` before `cutoff`.
    /// Deletions are sequential; the predicate also catches rows soft-marked
    /// with `last_seen = 0`.
    pub async fn sweep_stale(&self, cutoff: i64, limit: i64) -> RoomResult<u64> {
        let rows = self
            .store
            .query(
                "SELECT id FROM presence WHERE last_seen < ? LIMIT ?".to_string(),
                vec![SqlValue::Integer(cutoff), SqlValue::Integer(limit)],
            )
            .await?;

        let mut deleted = 0u64;
        for row in &rows {
            if let Some(id) = field_str(row, "id") {
                deleted += self
                    .store
                    .execute(
                        "DELETE FROM presence WHERE id = ?".to_string(),
                        vec![SqlValue::Text(id)],
                    )
                    .await?;
            }
        }
        Ok(deleted)
    }
}

fn row_to_entry(row: &[(String, Value)]) -> RoomResult<PresenceEntry> {
    let data_str = field_str(row, "data").unwrap_or_else(|| "{}".to_string());
    Ok(PresenceEntry {
        id: field_str(row, "id")
            .ok_or_else(|| RoomError::Internal(anyhow::anyhow!("Missing field: id")))?,
        room_id: field_str(row, "room_id").unwrap_or_default(),
        user_id: field_str(row, "user_id"),
        session_id: field_str(row, "session_id"),
        data: serde_json::from_str(&data_str).unwrap_or_else(|_| json!({})),
        last_seen: field_i64(row, "last_seen").unwrap_or(0),
    })
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub data: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaveQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// PUT /v1/rooms/:room_id/presence - heartbeat
async fn heartbeat_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, RoomError> {
    let caller = state.identity.resolve_caller(&headers, req.session_id);
    let written = state.presence.heartbeat(&room_id, &caller, req.data).await?;

    if written {
        state.publish(&room_id, json!({ "event": "presence", "room_id": room_id }));
    }

    Ok(Json(json!({ "success": true })))
}

/// GET /v1/rooms/:room_id/presence - active entries
async fn list_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, RoomError> {
    let entries = state.presence.list(&room_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": entries,
        "count": entries.len(),
    })))
}

/// DELETE /v1/rooms/:room_id/presence - leave
async fn leave_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<LeaveQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RoomError> {
    let caller = state.identity.resolve_caller(&headers, query.session_id);
    let deleted = state.presence.leave(&room_id, &caller).await?;

    if deleted {
        state.publish(&room_id, json!({ "event": "presence", "room_id": room_id }));
    }

    Ok(Json(json!({ "success": true })))
}

/// Presence routes, nested under /v1 by the main router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms/:room_id/presence", put(heartbeat_handler))
        .route("/rooms/:room_id/presence", get(list_handler))
        .route("/rooms/:room_id/presence", delete(leave_handler))
}

// ============================================================================
// Tests
// ============================================================================
