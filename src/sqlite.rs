use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::instrument;

use crate::model::UnixTimeMs;
use crate::store::{PersistentStore, StoreError};

pub const DEFAULT_QUEUE_KEY: &str = "mutation_queue";

/// Keeps the queue record as one row of a key/value table. Each save is a single
/// upsert, which SQLite applies atomically.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    key: String,
}

fn sqlite_err(e: rusqlite::Error) -> StoreError {
    StoreError::Sqlite(e.to_string())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, key: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(sqlite_err)?;
        // FULL so a committed save survives power loss, not just a process crash
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
        ",
        )
        .map_err(sqlite_err)?;

        Self::init(conn, key.into())
    }

    pub fn open_in_memory(key: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::init(conn, key.into())
    }

    fn init(conn: Connection, key: String) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait::async_trait]
impl PersistentStore for SqliteStore {
    #[instrument(skip(self), fields(key = %self.key))]
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.clone();
        let key = self.key.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::LockFailed)?;
            conn.query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }

    #[instrument(skip(self, bytes), fields(key = %self.key, len = bytes.len()))]
    async fn save(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let key = self.key.clone();
        let now = UnixTimeMs::now().0 as i64;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::LockFailed)?;
            conn.execute(
                r#"
                INSERT INTO kv_store (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, bytes, now],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}
