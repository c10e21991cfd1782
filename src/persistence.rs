//! The `Persistence` trait — the **only** filesystem/database touchpoint of
//! the core (spec.md §6). `WorkspaceStore` and `MessageStore` are pure
//! in-memory structures that call through this trait; nothing else in the
//! crate touches disk directly.

use crate::errors::PylonResult;
use crate::identity::ConversationId;
use crate::message_store::StoreMessage;
use crate::workspace_store::WorkspaceSnapshot;
use async_trait::async_trait;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_workspace_snapshot(&self, snapshot: &WorkspaceSnapshot) -> PylonResult<()>;
    async fn load_workspace_snapshot(&self) -> PylonResult<Option<WorkspaceSnapshot>>;
    async fn save_message_session(&self, cid: ConversationId, messages: &[StoreMessage]) -> PylonResult<()>;
    async fn load_message_session(&self, cid: ConversationId) -> PylonResult<Vec<StoreMessage>>;
    /// Flush any buffered writes. Invoked once, synchronously, on shutdown.
    async fn flush_all(&self) -> PylonResult<()>;
}

/// Default timeout for individual SQLite queries — prevents a hung query
/// from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = PylonResult<T>>) -> PylonResult<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(crate::errors::PylonError::Timeout(format!(
            "storage query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        ))),
    }
}

/// SQLite-backed implementation. One row in `workspace_snapshot` (id=0,
/// always overwritten) holds the full workspace/conversation tree; one row
/// per conversation in `message_sessions` holds its ordered message log as
/// a JSON array.
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub async fn open(data_dir: &Path) -> PylonResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("pylon.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workspace_snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                data TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS message_sessions (
                conversation_id INTEGER PRIMARY KEY,
                data TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn save_workspace_snapshot(&self, snapshot: &WorkspaceSnapshot) -> PylonResult<()> {
        let data = serde_json::to_string(snapshot)?;
        with_timeout(async {
            sqlx::query(
                "INSERT INTO workspace_snapshot (id, data) VALUES (0, ?1)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            )
            .bind(data)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn load_workspace_snapshot(&self) -> PylonResult<Option<WorkspaceSnapshot>> {
        let row: Option<(String,)> = with_timeout(async {
            Ok(sqlx::query_as("SELECT data FROM workspace_snapshot WHERE id = 0")
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;
        match row {
            // A malformed snapshot must not crash startup — drop it instead.
            Some((data,)) => Ok(serde_json::from_str(&data).ok()),
            None => Ok(None),
        }
    }

    async fn save_message_session(&self, cid: ConversationId, messages: &[StoreMessage]) -> PylonResult<()> {
        let data = serde_json::to_string(messages)?;
        with_timeout(async {
            sqlx::query(
                "INSERT INTO message_sessions (conversation_id, data) VALUES (?1, ?2)
                 ON CONFLICT(conversation_id) DO UPDATE SET data = excluded.data",
            )
            .bind(cid as i64)
            .bind(data)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn load_message_session(&self, cid: ConversationId) -> PylonResult<Vec<StoreMessage>> {
        let row: Option<(String,)> = with_timeout(async {
            Ok(
                sqlx::query_as("SELECT data FROM message_sessions WHERE conversation_id = ?1")
                    .bind(cid as i64)
                    .fetch_optional(&self.pool)
                    .await?,
            )
        })
        .await?;
        match row {
            Some((data,)) => Ok(serde_json::from_str(&data).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn flush_all(&self) -> PylonResult<()> {
        // SQLite writes are committed per statement above; nothing buffered
        // at this layer needs an explicit flush, but WAL checkpoint keeps
        // the on-disk file compact before shutdown.
        with_timeout(async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}

/// In-memory [`Persistence`] for tests — never touches disk.
#[cfg(any(test, feature = "test-util"))]
pub struct MemoryPersistence {
    workspace: tokio::sync::Mutex<Option<WorkspaceSnapshot>>,
    messages: tokio::sync::Mutex<std::collections::HashMap<ConversationId, Vec<StoreMessage>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for MemoryPersistence {
    fn default() -> Self {
        Self {
            workspace: tokio::sync::Mutex::new(None),
            messages: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_workspace_snapshot(&self, snapshot: &WorkspaceSnapshot) -> PylonResult<()> {
        *self.workspace.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load_workspace_snapshot(&self) -> PylonResult<Option<WorkspaceSnapshot>> {
        Ok(self.workspace.lock().await.clone())
    }

    async fn save_message_session(&self, cid: ConversationId, messages: &[StoreMessage]) -> PylonResult<()> {
        self.messages.lock().await.insert(cid, messages.to_vec());
        Ok(())
    }

    async fn load_message_session(&self, cid: ConversationId) -> PylonResult<Vec<StoreMessage>> {
        Ok(self.messages.lock().await.get(&cid).cloned().unwrap_or_default())
    }

    async fn flush_all(&self) -> PylonResult<()> {
        Ok(())
    }
}
