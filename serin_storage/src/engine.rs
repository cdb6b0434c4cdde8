//! Backing store interface and an in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Key is absent. Callers treat this as an outcome, not a failure.
    #[error("key not found")]
    KeyNotFound,
    /// On-disk data failed checksum or format validation.
    #[error("corrupted data in {file}: {reason}")]
    Corrupted {
        /// File the bad record was read from.
        file: String,
        /// What failed to validate.
        reason: String,
    },
    /// Underlying file IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Any other backend failure.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl StorageError {
    /// Whether this error is the "not found" outcome rather than a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::KeyNotFound)
    }
}

/// Key/value store the staging layer reads initial values from.
///
/// Reads must distinguish an absent key (`StorageError::KeyNotFound`) from any
/// other failure. The write side exists for whoever seeds or flushes the store.
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Bytes>;

    /// Insert or overwrite a key/value pair.
    fn put(&self, key: &[u8], value: Bytes) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn del(&self, key: &[u8]) -> Result<()>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn get(&self, key: &[u8]) -> Result<Bytes> {
        (**self).get(key)
    }

    fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        (**self).put(key, value)
    }

    fn del(&self, key: &[u8]) -> Result<()> {
        (**self).del(key)
    }
}

/// In-memory storage, shared between clones.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<Vec<u8>, Bytes>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Bytes> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or(StorageError::KeyNotFound)
    }

    fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}
