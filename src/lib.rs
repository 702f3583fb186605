//! # roomsync
//!
//! A self-hosted presence, chat, and ephemeral file service. Rooms carry
//! presence entries (cursors, avatars, status), short-lived chat messages,
//! and file uploads, all owned by an anonymous demo identity or a client
//! session and purged by a periodic cleanup sweep.
//!
//! ## Core Components
//!
//! - **Store**: SQLite with WAL mode holding all room data
//! - **Identity**: anonymous users with JWT access and rotating refresh tokens
//! - **Presence**: heartbeat-driven liveness with a 30-second timeout
//! - **Messages**: room chat with a 60-second retention window
//! - **Files**: filesystem blobs tracked by metadata rows
//! - **Cleanup**: batched expiry sweeps, anonymous-user cascade included
//! - **API**: axum HTTP endpoints plus per-room SSE change streams

pub mod api;
pub mod cleanup;
pub mod db;
pub mod error;
pub mod files;
pub mod identity;
pub mod messages;
pub mod presence;

pub use error::{RoomError, RoomResult};
