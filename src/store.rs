//! Byte-oriented persistence contract the queue is written against.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::crypto::CryptoError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("duplicate mutation id in stored queue: {0}")]
    DuplicateMutationId(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lock acquisition failed")]
    LockFailed,

    #[error("blocking task failed: {0}")]
    TaskFailed(String),
}

/// Durable, crash-atomic storage for one opaque blob.
///
/// `save` must either fully replace the previous blob or leave it untouched.
#[async_trait::async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;
    async fn save(&self, bytes: Vec<u8>) -> Result<(), StoreError>;
}

/// Process-local store. Survives a queue being dropped and reopened, not a process exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(bytes)),
        }
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|b| b.clone())
    }
}

#[async_trait::async_trait]
impl PersistentStore for MemoryStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let blob = self.blob.lock().map_err(|_| StoreError::LockFailed)?;
        Ok(blob.clone())
    }

    async fn save(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut blob = self.blob.lock().map_err(|_| StoreError::LockFailed)?;
        *blob = Some(bytes);
        Ok(())
    }
}

/// Single-file store using write-to-temp, fsync, rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temp sibling named after the whole file name, so `queue.a` and `queue.b`
    /// never share one and `queue.tmp` never writes over itself.
    fn tmp_path(path: &Path) -> Result<PathBuf, StoreError> {
        let mut name = path
            .file_name()
            .ok_or_else(|| {
                StoreError::Unavailable(format!("store path has no file name: {}", path.display()))
            })?
            .to_os_string();
        name.push(".tmp");
        Ok(path.with_file_name(name))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp_path = Self::tmp_path(path)?;

        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    fn read(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty file",
            });
        }

        Ok(Some(bytes))
    }
}

#[async_trait::async_trait]
impl PersistentStore for FileStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read(&path))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }

    #[instrument(skip(self, bytes), fields(path = %self.path.display(), len = bytes.len()))]
    async fn save(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))??;
        debug!("queue record written");
        Ok(())
    }
}
