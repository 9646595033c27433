//! Persistent key/value storage behind the session.
//!
//! Everything the session persists (the mnemonic, display name, avatar
//! pointer and per-namespace retrieve cursors) goes through this small
//! async interface so embedders can swap the backing store. Two
//! implementations ship with the crate: a process-local map and a JSON
//! snapshot file.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Async key/value store with list append.
///
/// Values are strings or JSON; list entries accumulate under their own
/// keys. Implementations must be safe to share across tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn has(&self, key: &str) -> Result<bool, StorageError>;
    async fn append_list(&self, key: &str, item: &str) -> Result<(), StorageError>;
    async fn get_list(&self, key: &str) -> Result<Vec<String>, StorageError>;
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// Map-backed store; contents die with the process.
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.read().await.get(key).and_then(value_to_string))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .insert(key.to_owned(), Value::String(value.to_owned()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().await.contains_key(key))
    }

    async fn append_list(&self, key: &str, item: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        append_to_value_list(data.entry(key.to_owned()).or_insert(Value::Null), item);
        Ok(())
    }

    async fn get_list(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .get(key)
            .map(value_to_list)
            .unwrap_or_default())
    }
}

// ─── File-backed ─────────────────────────────────────────────────────────────

/// JSON snapshot store. The whole map is rewritten on every mutation;
/// writes are serialised by a single async mutex.
pub struct FileStorage {
    path: PathBuf,
    data: RwLock<HashMap<String, Value>>,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open (or create) the store at `path`. A missing or corrupt file
    /// starts empty, matching the reference behavior.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                serde_json::from_slice(&bytes).unwrap_or_default()
            }
            _ => HashMap::new(),
        };
        Ok(Self { path, data: RwLock::new(data), write_lock: Mutex::new(()) })
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let data = self.data.read().await;
            serde_json::to_vec_pretty(&*data)?
        };
        tokio::fs::write(&self.path, snapshot).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.read().await.get(key).and_then(value_to_string))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .insert(key.to_owned(), Value::String(value.to_owned()));
        self.persist().await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.data.write().await.remove(key).is_some() {
            self.persist().await?;
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().await.contains_key(key))
    }

    async fn append_list(&self, key: &str, item: &str) -> Result<(), StorageError> {
        {
            let mut data = self.data.write().await;
            append_to_value_list(data.entry(key.to_owned()).or_insert(Value::Null), item);
        }
        self.persist().await
    }

    async fn get_list(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .get(key)
            .map(value_to_list)
            .unwrap_or_default())
    }
}

// ─── Value helpers ───────────────────────────────────────────────────────────

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn value_to_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(value_to_string).collect(),
        _ => Vec::new(),
    }
}

fn append_to_value_list(slot: &mut Value, item: &str) {
    if !slot.is_array() {
        // non-list values are replaced by a fresh list
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(items) = slot {
        items.push(Value::String(item.to_owned()));
    }
}
