//! # Cleanup Module
//!
//! Periodic expiry of ephemeral demo data. Each sweep is bounded to a batch
//! of records per table and performs deletions sequentially, so a single
//! sweep never holds the write connection for long.
//!
//! Sweeps:
//! - messages older than the retention window
//! - file records older than the retention window, blobs included
//! - presence entries past the liveness timeout (also catches soft-marked
//!   `last_seen = 0` rows)
//! - anonymous users older than the retention window, cascading to their
//!   messages, files, presence, and auth sessions

use crate::db::{field_str, now_ms, RoomStore, SqlValue};
use crate::error::RoomResult;
use crate::files::{FileService, FILE_RETENTION_MS};
use crate::messages::{MessageService, MESSAGE_RETENTION_MS};
use crate::presence::{PresenceService, PRESENCE_TIMEOUT_MS};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Anonymous users older than this are purged (60 seconds)
pub const ANON_USER_RETENTION_MS: i64 = 60_000;

/// Background sweep interval
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-table batch bound per sweep
pub const BATCH_SIZE: i64 = 100;

/// Counts of records deleted by one full sweep
#[derive(Debug, Default, Serialize)]
pub struct CleanupReport {
    pub messages: u64,
    pub files: u64,
    pub presence: u64,
    pub anonymous_users: u64,
}

/// Runs all expiry sweeps against the store
#[derive(Clone)]
pub struct CleanupService {
    store: Arc<RoomStore>,
    presence: PresenceService,
    messages: MessageService,
    files: FileService,
}

impl CleanupService {
    pub fn new(
        store: Arc<RoomStore>,
        presence: PresenceService,
        messages: MessageService,
        files: FileService,
    ) -> Self {
        Self {
            store,
            presence,
            messages,
            files,
        }
    }

    /// Run every sweep once, returning per-table counts
    pub async fn run_all(&self) -> RoomResult<CleanupReport> {
        let now = now_ms();

        let messages = self
            .messages
            .sweep_expired(now - MESSAGE_RETENTION_MS, BATCH_SIZE)
            .await?;
        let files = self
            .files
            .sweep_expired(now - FILE_RETENTION_MS, BATCH_SIZE)
            .await?;
        let presence = self
            .presence
            .sweep_stale(now - PRESENCE_TIMEOUT_MS, BATCH_SIZE)
            .await?;
        let anonymous_users = self.cleanup_anonymous_users(now).await?;

        Ok(CleanupReport {
            messages,
            files,
            presence,
            anonymous_users,
        })
    }

    /// Purge stale anonymous users and everything they own. Related records
    /// are deleted first, sequentially, then the user row itself.
    async fn cleanup_anonymous_users(&self, now: i64) -> RoomResult<u64> {
        let cutoff = now - ANON_USER_RETENTION_MS;
        let users = self
            .store
            .query(
                "SELECT id FROM users WHERE is_anonymous = 1 AND created_at < ? LIMIT ?"
                    .to_string(),
                vec![SqlValue::Integer(cutoff), SqlValue::Integer(BATCH_SIZE)],
            )
            .await?;

        let mut purged = 0u64;
        for row in &users {
            let Some(user_id) = field_str(row, "id") else {
                continue;
            };
            self.cascade_delete_user(&user_id).await?;
            purged += 1;
        }
        Ok(purged)
    }

    /// Delete every record owned by the user, then the user
    async fn cascade_delete_user(&self, user_id: &str) -> RoomResult<()> {
        self.store
            .execute(
                "DELETE FROM messages WHERE user_id = ?".to_string(),
                vec![SqlValue::Text(user_id.to_string())],
            )
            .await?;

        // Files carry blobs; remove those before their rows
        let files = self
            .store
            .query(
                "SELECT storage_id FROM files WHERE user_id = ?".to_string(),
                vec![SqlValue::Text(user_id.to_string())],
            )
            .await?;
        for file in &files {
            if let Some(storage_id) = field_str(file, "storage_id") {
                self.files.remove_blob(&storage_id).await?;
            }
        }
        self.store
            .execute(
                "DELETE FROM files WHERE user_id = ?".to_string(),
                vec![SqlValue::Text(user_id.to_string())],
            )
            .await?;

        self.store
            .execute(
                "DELETE FROM presence WHERE user_id = ?".to_string(),
                vec![SqlValue::Text(user_id.to_string())],
            )
            .await?;
        self.store
            .execute(
                "DELETE FROM auth_sessions WHERE user_id = ?".to_string(),
                vec![SqlValue::Text(user_id.to_string())],
            )
            .await?;
        self.store
            .execute(
                "DELETE FROM users WHERE id = ?".to_string(),
                vec![SqlValue::Text(user_id.to_string())],
            )
            .await?;

        info!("Purged anonymous user {}", user_id);
        Ok(())
    }

    /// Spawn the background sweep loop. The sweep is awaited before the next
    /// tick, so it never runs in parallel with itself.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep an empty store
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.run_all().await {
                    Ok(report) => info!(
                        "Cleanup: {} messages, {} files, {} presence, {} anonymous users",
                        report.messages, report.files, report.presence, report.anonymous_users
                    ),
                    Err(e) => error!("Cleanup sweep failed: {}", e),
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Caller, IdentityService};
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixture {
        store: Arc<RoomStore>,
        identity: IdentityService,
        presence: PresenceService,
        messages: MessageService,
        files: FileService,
        cleanup: CleanupService,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(RoomStore::in_memory().await.unwrap());
        let dir = tempdir().unwrap();
        let identity = IdentityService::new(Arc::clone(&store), IdentityService::generate_secret());
        let presence = PresenceService::new(Arc::clone(&store));
        let messages = MessageService::new(Arc::clone(&store));
        let files = FileService::new(Arc::clone(&store), Some(dir.path().to_path_buf()));
        let cleanup = CleanupService::new(
            Arc::clone(&store),
            presence.clone(),
            messages.clone(),
            files.clone(),
        );
        Fixture {
            store,
            identity,
            presence,
            messages,
            files,
            cleanup,
            _dir: dir,
        }
    }

    async fn age_table(store: &RoomStore, table: &str, column: &str, ms: i64) {
        store
            .execute(
                format!("UPDATE {} SET {} = {}", table, column, now_ms() - ms),
                vec![],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_data_survives_sweep() {
        let f = fixture().await;
        let caller = Caller {
            user_id: None,
            session_id: Some("s1".to_string()),
        };

        f.messages.send("lobby", &caller, "hi", "Alice").await.unwrap();
        f.presence.heartbeat("lobby", &caller, json!({})).await.unwrap();

        let report = f.cleanup.run_all().await.unwrap();
        assert_eq!(report.messages, 0);
        assert_eq!(report.presence, 0);
        assert_eq!(f.messages.list("lobby").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_data_is_swept() {
        let f = fixture().await;
        let caller = Caller {
            user_id: None,
            session_id: Some("s1".to_string()),
        };

        f.messages.send("lobby", &caller, "old", "Alice").await.unwrap();
        f.presence.heartbeat("lobby", &caller, json!({})).await.unwrap();
        f.files
            .save(&caller, "old.txt", "text/plain", b"x".to_vec())
            .await
            .unwrap();

        age_table(&f.store, "messages", "created_at", MESSAGE_RETENTION_MS + 1000).await;
        age_table(&f.store, "presence", "last_seen", PRESENCE_TIMEOUT_MS + 1000).await;
        age_table(&f.store, "files", "created_at", FILE_RETENTION_MS + 1000).await;

        let report = f.cleanup.run_all().await.unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(report.presence, 1);
        assert_eq!(report.files, 1);
    }

    #[tokio::test]
    async fn test_soft_marked_presence_is_swept() {
        let f = fixture().await;
        let caller = Caller {
            user_id: None,
            session_id: Some("s1".to_string()),
        };
        f.presence.heartbeat("lobby", &caller, json!({})).await.unwrap();
        f.store
            .execute("UPDATE presence SET last_seen = 0".to_string(), vec![])
            .await
            .unwrap();

        let report = f.cleanup.run_all().await.unwrap();
        assert_eq!(report.presence, 1);
    }

    #[tokio::test]
    async fn test_anonymous_user_cascade() {
        let f = fixture().await;

        let tokens = f.identity.create_anonymous(None).await.unwrap();
        let caller = Caller {
            user_id: Some(tokens.user.id.clone()),
            session_id: None,
        };

        f.messages.send("lobby", &caller, "mine", "Ghost").await.unwrap();
        f.presence.heartbeat("lobby", &caller, json!({})).await.unwrap();
        let file = f
            .files
            .save(&caller, "mine.txt", "text/plain", b"x".to_vec())
            .await
            .unwrap();

        age_table(&f.store, "users", "created_at", ANON_USER_RETENTION_MS + 1000).await;

        let report = f.cleanup.run_all().await.unwrap();
        assert_eq!(report.anonymous_users, 1);

        // Everything the user owned is gone, including the refresh session
        assert!(f.identity.get_user(&tokens.user.id).await.is_err());
        assert!(f.identity.refresh(&tokens.refresh_token).await.is_err());
        assert!(f.messages.list("lobby").await.unwrap().is_empty());
        assert!(f.presence.list("lobby").await.unwrap().is_empty());
        assert!(f.files.get(&file.id).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_is_bounded() {
        let f = fixture().await;
        let caller = Caller {
            user_id: None,
            session_id: Some("s1".to_string()),
        };

        for i in 0..(BATCH_SIZE + 20) {
            f.messages
                .send("lobby", &caller, &format!("m{}", i), "Alice")
                .await
                .unwrap();
        }
        age_table(&f.store, "messages", "created_at", MESSAGE_RETENTION_MS + 1000).await;

        let report = f.cleanup.run_all().await.unwrap();
        assert_eq!(report.messages, BATCH_SIZE as u64);

        // A second sweep drains the remainder
        let report = f.cleanup.run_all().await.unwrap();
        assert_eq!(report.messages, 20);
    }
}
