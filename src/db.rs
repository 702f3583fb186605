//! # Store Module
//!
//! Manages the persistent .db file using WAL mode for concurrent access.
//! Handles database initialization, the domain schema, and provides utilities
//! for executing queries safely.
//!
//! All timestamps in the schema are Unix epoch milliseconds, so staleness
//! cutoffs stay integer comparisons.

use crate::error::{RoomError, RoomResult};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::TransactionBehavior;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Maximum length of a room id
pub const MAX_ROOM_ID_LENGTH: usize = 100;

lazy_static! {
    /// Room ids are URL path segments; keep them to a safe character set
    static ref ROOM_ID_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Current time as Unix epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Validate a room id: non-empty, bounded, safe character set
pub fn validate_room_id(room_id: &str) -> RoomResult<()> {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err(RoomError::InvalidRoomId(format!(
            "room id must be 1-{} characters",
            MAX_ROOM_ID_LENGTH
        )));
    }
    if !ROOM_ID_REGEX.is_match(room_id) {
        return Err(RoomError::InvalidRoomId(
            "room id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

/// The RoomStore: manages database connections and provides query utilities
pub struct RoomStore {
    conn: Connection,
    path: String,
}

impl RoomStore {
    /// Opens a RoomStore at the specified database path with WAL mode enabled
    /// and the domain schema in place.
    pub async fn open<P: AsRef<Path>>(path: P) -> RoomResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!("Opening room store at: {}", path_str);

        let conn = Connection::open(&path_str)
            .await
            .map_err(|e| RoomError::Database(format!("Failed to open database: {}", e)))?;

        Self::initialize_pragmas(&conn).await?;

        let store = Self {
            conn,
            path: path_str,
        };
        store.initialize_schema().await?;

        info!("Room store initialized with WAL mode");
        Ok(store)
    }

    /// Creates an in-memory store (useful for testing)
    pub async fn in_memory() -> RoomResult<Self> {
        debug!("Initializing in-memory room store");

        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| RoomError::Database(format!("Failed to create database: {}", e)))?;

        Self::initialize_pragmas(&conn).await?;

        let store = Self {
            conn,
            path: ":memory:".to_string(),
        };
        store.initialize_schema().await?;

        Ok(store)
    }

    /// Initialize database with production-ready pragmas:
    /// WAL for concurrent access, NORMAL synchronous for balance between
    /// safety and speed.
    async fn initialize_pragmas(conn: &Connection) -> RoomResult<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;
                 PRAGMA cache_size=-64000;",
            )?;
            Ok(())
        })
        .await
        .map_err(|e| RoomError::Database(format!("Failed to set pragmas: {}", e)))?;

        Ok(())
    }

    /// Create the domain tables and indexes.
    ///
    /// `presence.user_id`/`session_id` are both nullable: a row is owned by a
    /// session token, an authenticated user, or neither. Ownership cascades
    /// are handled by the cleanup sweeps, not by foreign keys, so session-only
    /// rows remain representable.
    async fn initialize_schema(&self) -> RoomResult<()> {
        self.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT,
                image TEXT,
                is_anonymous INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_anonymous ON users(is_anonymous);

            CREATE TABLE IF NOT EXISTS auth_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                refresh_token TEXT UNIQUE NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_token ON auth_sessions(refresh_token);
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_user ON auth_sessions(user_id);

            CREATE TABLE IF NOT EXISTS presence (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id TEXT,
                session_id TEXT,
                data TEXT NOT NULL DEFAULT '{}',
                last_seen INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_presence_room ON presence(room_id);
            CREATE INDEX IF NOT EXISTS idx_presence_user_room ON presence(user_id, room_id);
            CREATE INDEX IF NOT EXISTS idx_presence_session_room ON presence(session_id, room_id);
            CREATE INDEX IF NOT EXISTS idx_presence_last_seen ON presence(last_seen);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id TEXT,
                session_id TEXT,
                user_name TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);

            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                storage_id TEXT UNIQUE NOT NULL,
                user_id TEXT,
                session_id TEXT,
                name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_files_user ON files(user_id);
            CREATE INDEX IF NOT EXISTS idx_files_session ON files(session_id);
            CREATE INDEX IF NOT EXISTS idx_files_created ON files(created_at);
            "#
            .to_string(),
        )
        .await?;

        debug!("Domain schema initialized");
        Ok(())
    }

    /// Execute a write query (INSERT, UPDATE, DELETE)
    pub async fn execute(&self, sql: String, params: Vec<SqlValue>) -> RoomResult<u64> {
        self.conn
            .call(move |conn| {
                let params_refs: Vec<&dyn rusqlite::ToSql> = params
                    .iter()
                    .map(|p| p as &dyn rusqlite::ToSql)
                    .collect();
                let affected = conn.execute(&sql, params_refs.as_slice())?;
                Ok(affected as u64)
            })
            .await
            .map_err(|e| RoomError::Database(format!("Execute failed: {}", e)))
    }

    /// Execute batch SQL
    pub async fn execute_batch(&self, sql: String) -> RoomResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(|e| RoomError::Database(format!("Batch execution failed: {}", e)))
    }

    /// Query and return rows as JSON-like structure
    pub async fn query(
        &self,
        sql: String,
        params: Vec<SqlValue>,
    ) -> RoomResult<Vec<Vec<(String, serde_json::Value)>>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let column_names: Vec<String> = stmt
                    .column_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect();

                let params_refs: Vec<&dyn rusqlite::ToSql> = params
                    .iter()
                    .map(|p| p as &dyn rusqlite::ToSql)
                    .collect();

                let mut rows_result = Vec::new();
                let mut rows = stmt.query(params_refs.as_slice())?;

                while let Some(row) = rows.next()? {
                    let mut row_data = Vec::new();
                    for (i, name) in column_names.iter().enumerate() {
                        let value = Self::get_value_from_row(row, i);
                        row_data.push((name.clone(), value));
                    }
                    rows_result.push(row_data);
                }

                Ok(rows_result)
            })
            .await
            .map_err(|e| RoomError::Database(format!("Query failed: {}", e)))
    }

    /// Query without parameters
    pub async fn query_simple(
        &self,
        sql: String,
    ) -> RoomResult<Vec<Vec<(String, serde_json::Value)>>> {
        self.query(sql, vec![]).await
    }

    /// Helper to extract value from a row
    fn get_value_from_row(row: &rusqlite::Row, idx: usize) -> serde_json::Value {
        if let Ok(v) = row.get::<_, i64>(idx) {
            return serde_json::json!(v);
        }
        if let Ok(v) = row.get::<_, f64>(idx) {
            return serde_json::json!(v);
        }
        if let Ok(v) = row.get::<_, String>(idx) {
            return serde_json::json!(v);
        }
        serde_json::Value::Null
    }

    /// Get the database file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the store is in-memory
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }

    /// Execute with an immediate transaction
    pub async fn with_transaction<F, T>(&self, f: F) -> RoomResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let result = f(&tx)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(|e| RoomError::Database(format!("Transaction failed: {}", e)))
    }
}

/// SQL Value wrapper for parameters
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl SqlValue {
    /// Text value from an optional string, mapping None to SQL NULL
    pub fn opt_text(value: Option<String>) -> Self {
        match value {
            Some(s) => SqlValue::Text(s),
            None => SqlValue::Null,
        }
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        match self {
            SqlValue::Null => Ok(rusqlite::types::ToSqlOutput::Owned(
                rusqlite::types::Value::Null,
            )),
            SqlValue::Integer(i) => Ok(rusqlite::types::ToSqlOutput::Owned(
                rusqlite::types::Value::Integer(*i),
            )),
            SqlValue::Text(s) => Ok(rusqlite::types::ToSqlOutput::Owned(
                rusqlite::types::Value::Text(s.clone()),
            )),
        }
    }
}

/// Look up a string field in a queried row
pub fn field_str(row: &[(String, serde_json::Value)], key: &str) -> Option<String> {
    row.iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.as_str().map(String::from))
}

/// Look up an integer field in a queried row
pub fn field_i64(row: &[(String, serde_json::Value)], key: &str) -> Option<i64> {
    row.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.as_i64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_has_schema() {
        let store = RoomStore::in_memory().await.unwrap();
        assert!(store.is_in_memory());

        let rows = store
            .query_simple(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
                    .to_string(),
            )
            .await
            .unwrap();

        let tables: Vec<String> = rows
            .iter()
            .filter_map(|row| field_str(row, "name"))
            .collect();
        assert_eq!(
            tables,
            vec!["auth_sessions", "files", "messages", "presence", "users"]
        );
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let store = RoomStore::in_memory().await.unwrap();

        store
            .execute(
                "INSERT INTO messages (id, room_id, user_name, content, created_at) VALUES (?, ?, ?, ?, ?)"
                    .to_string(),
                vec![
                    SqlValue::Text("m1".to_string()),
                    SqlValue::Text("lobby".to_string()),
                    SqlValue::Text("Alice".to_string()),
                    SqlValue::Text("hello".to_string()),
                    SqlValue::Integer(now_ms()),
                ],
            )
            .await
            .unwrap();

        let rows = store
            .query_simple("SELECT content FROM messages".to_string())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(field_str(&rows[0], "content").as_deref(), Some("hello"));
    }

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("lobby").is_ok());
        assert!(validate_room_id("room_1-a").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("no spaces").is_err());
        assert!(validate_room_id("a/b").is_err());
        assert!(validate_room_id(&"x".repeat(MAX_ROOM_ID_LENGTH + 1)).is_err());
    }
}
