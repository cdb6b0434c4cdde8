//! Staging errors.

use std::fmt::Debug;

use bytes::Bytes;
use serin_storage::StorageError;
use thiserror::Error;

use crate::owner::Owner;

/// Result type alias for staging operations.
pub type Result<R, T> = std::result::Result<R, StagingError<T>>;

/// A key whose final version moved on after the transaction derived it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConflict<T> {
    /// Raw key.
    pub key: Bytes,
    /// Owner of the final entry at merge time.
    pub owner: Owner<T>,
}

/// Staging layer errors.
#[derive(Debug, Error)]
pub enum StagingError<T: Debug> {
    /// Merge rejected; the final workspace was left untouched.
    #[error("staging table key conflict: txn {tid:?} has {} stale key(s)", .conflicts.len())]
    Conflict {
        /// Transaction whose merge was rejected.
        tid: T,
        /// Every stale key, ordered by key.
        conflicts: Vec<KeyConflict<T>>,
    },
    /// The backing store failed with something other than "not found".
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl<T: Debug> StagingError<T> {
    /// Whether this is a merge conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StagingError::Conflict { .. })
    }
}
