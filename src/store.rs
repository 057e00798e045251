//! Chat persistence
//!
//! The relay only ever writes chat records, through the narrow
//! [`ChatStore`] interface. Writes are fire-and-forget relative to the
//! broadcast path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::RoomId;

/// Identifier assigned to a stored chat record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

/// One persisted chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: RecordId,
    pub room_id: RoomId,
    pub sender: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatRecord {
    /// Create a record stamped with the current time
    pub fn new(room_id: RoomId, sender: String, message: String) -> Self {
        Self {
            id: RecordId(Uuid::new_v4()),
            room_id,
            sender,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Durable storage for chat messages
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert(&self, record: ChatRecord) -> Result<RecordId, StoreError>;
}

/// Store that writes each record to the log and keeps nothing
///
/// Default when no chat log file is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChatStore;

#[async_trait]
impl ChatStore for LogChatStore {
    async fn insert(&self, record: ChatRecord) -> Result<RecordId, StoreError> {
        info!(
            room = %record.room_id,
            sender = %record.sender,
            at = %record.timestamp,
            "chat: {}",
            record.message
        );
        Ok(record.id)
    }
}

/// In-memory store, retaining every record (for tests and embedding)
///
/// Can be switched into a failing mode to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    records: Mutex<Vec<ChatRecord>>,
    failing: AtomicBool,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following insert fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Copy of everything stored so far
    pub async fn records(&self) -> Vec<ChatRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn insert(&self, record: ChatRecord) -> Result<RecordId, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let id = record.id;
        self.records.lock().await.push(record);
        Ok(id)
    }
}

/// Append-only JSON lines file, one record per line
#[derive(Debug)]
pub struct JsonlChatStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlChatStore {
    /// Open (or create) the log file for appending
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChatStore for JsonlChatStore {
    async fn insert(&self, record: ChatRecord) -> Result<RecordId, StoreError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(record.id)
    }
}
