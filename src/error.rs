//! # Error Handling Module
//!
//! Structured error types for the roomsync service. Validation failures carry
//! a machine-readable code so callers can map them to UI-level messaging.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for roomsync operations
pub type RoomResult<T> = Result<T, RoomError>;

/// Comprehensive error type for all roomsync operations
#[derive(Error, Debug)]
pub enum RoomError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(String),

    /// JSON parsing or serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Room id is empty, too long, or contains invalid characters
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    /// Message content is empty or whitespace-only
    #[error("Message cannot be empty")]
    EmptyMessage,

    /// Message content exceeds the allowed length
    #[error("Message too long. Maximum {max} characters")]
    MessageTooLong { max: usize },

    /// Uploaded file exceeds the allowed size
    #[error("File too large. Maximum size is {max} bytes")]
    FileTooLarge { max: usize },

    /// Invalid request structure or field value
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Blob storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RoomError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoomError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            RoomError::Json(_) => StatusCode::BAD_REQUEST,
            RoomError::InvalidRoomId(_) => StatusCode::BAD_REQUEST,
            RoomError::EmptyMessage => StatusCode::BAD_REQUEST,
            RoomError::MessageTooLong { .. } => StatusCode::BAD_REQUEST,
            RoomError::FileTooLarge { .. } => StatusCode::BAD_REQUEST,
            RoomError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RoomError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RoomError::NotFound(_) => StatusCode::NOT_FOUND,
            RoomError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RoomError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            RoomError::Database(_) => "DATABASE_ERROR",
            RoomError::Json(_) => "JSON_ERROR",
            RoomError::InvalidRoomId(_) => "INVALID_ROOM_ID",
            RoomError::EmptyMessage => "EMPTY_MESSAGE",
            RoomError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            RoomError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            RoomError::InvalidPayload(_) => "INVALID_PAYLOAD",
            RoomError::Unauthorized(_) => "UNAUTHORIZED",
            RoomError::NotFound(_) => "NOT_FOUND",
            RoomError::Storage(_) => "STORAGE_ERROR",
            RoomError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        RoomError::Unauthorized(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        RoomError::NotFound(msg.into())
    }
}

/// Converts RoomError into an Axum HTTP response
impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            },
            "success": false,
        }));

        (status, body).into_response()
    }
}

/// Convert rusqlite errors to RoomError
impl From<rusqlite::Error> for RoomError {
    fn from(err: rusqlite::Error) -> Self {
        RoomError::Database(err.to_string())
    }
}

/// Convert tokio-rusqlite errors to RoomError
impl From<tokio_rusqlite::Error> for RoomError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        RoomError::Database(err.to_string())
    }
}
