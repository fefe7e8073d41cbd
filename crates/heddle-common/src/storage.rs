//! Pluggable key/value storage with TTL semantics.
//!
//! The OAuth engine treats storage as the source of truth for PKCE records
//! and sessions; anything that can get/set/delete string values and honor an
//! optional expiry works, including distributed stores shared across
//! processes.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors emitted by storage backends.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum StorageError {
    /// Filesystem or I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(heddle::storage::io))]
    Io(#[from] std::io::Error),
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(heddle::storage::serde))]
    Serde(#[from] serde_json::Error),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(heddle::storage::other))]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// Pluggable key→value store with optional per-entry TTL.
///
/// Implementations must treat an expired entry as absent. Values are opaque
/// strings; the engine stores JSON documents in them.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get the value for a key, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<(), StorageError>;
    /// Delete a key. Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: Storage + ?Sized> Storage for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.as_ref().get(key).await
    }
    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.as_ref().set(key, value, ttl).await
    }
    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.as_ref().del(key).await
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    value: String,
    /// Absolute expiry in unix milliseconds; `None` means no TTL.
    expires_at: Option<i64>,
}

impl Entry {
    fn expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory store suitable for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryStore(DashMap<String, Entry>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = now_ms();
        if let Some(entry) = self.0.get(key) {
            if !entry.expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // lazily drop expired entries
        self.0.remove_if(key, |_, e| e.expired(now));
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let expires_at = ttl.map(|ttl| now_ms() + ttl.as_millis() as i64);
        self.0.insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.0.remove(key);
        Ok(())
    }
}

/// File-backed store using a single JSON file.
///
/// NOT secure, only suitable for development.
#[derive(Clone, Debug)]
pub struct FileStore {
    /// Path to the JSON file.
    pub path: PathBuf,
}

impl FileStore {
    /// Create a new file store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.as_ref().exists() {
            std::fs::write(path.as_ref(), b"{}")?;
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
        })
    }

    fn read_all(&self) -> Result<std::collections::BTreeMap<String, Entry>, StorageError> {
        let file = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&file)?)
    }

    fn write_all(
        &self,
        entries: &std::collections::BTreeMap<String, Entry>,
    ) -> Result<(), StorageError> {
        std::fs::write(&self.path, serde_json::to_string_pretty(entries)?)?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.read_all()?;
        Ok(entries
            .get(key)
            .filter(|e| !e.expired(now_ms()))
            .map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut entries = self.read_all()?;
        let expires_at = ttl.map(|ttl| now_ms() + ttl.as_millis() as i64);
        entries.insert(key.to_owned(), Entry { value, expires_at });
        self.write_all(&entries)
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.read_all()?;
        entries.remove(key);
        self.write_all(&entries)
    }
}
