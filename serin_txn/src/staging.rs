//! Staging table: per-transaction workspaces over a shared final workspace.
//!
//! Lock order: the workspace directory lock is only ever taken on its own.
//! The final-workspace lock may be held while a transaction workspace is
//! locked (during merge), never the other way round.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serin_storage::Storage;
use tracing::{debug, trace};

use crate::entry::VersionedValue;
use crate::error::{KeyConflict, Result, StagingError};
use crate::key::canonical_key;
use crate::owner::{Owner, TxnIdentifier};

/// Canonical key -> entry.
type Workspace<T> = HashMap<String, Arc<VersionedValue<T>>>;

/// Stages reads and writes of many transactions against one backing store
/// and folds them into the final workspace with optimistic version checks.
pub struct StagingTable<T, S: ?Sized> {
    storage: Arc<S>,
    workspaces: Mutex<HashMap<T, Arc<Mutex<Workspace<T>>>>>,
    final_values: Mutex<Workspace<T>>,
}

impl<T: TxnIdentifier, S: Storage + ?Sized> StagingTable<T, S> {
    /// Create an empty table over `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            workspaces: Mutex::new(HashMap::new()),
            final_values: Mutex::new(HashMap::new()),
        }
    }

    /// Return `tid`'s entry for `key`, deriving it from the final workspace on
    /// first touch.
    pub fn get(&self, tid: impl Into<Owner<T>>, key: &[u8]) -> Result<Arc<VersionedValue<T>>, T> {
        self.update(tid.into(), key, |_| None)
    }

    /// Overwrite the value. The entry only becomes dirty if the value differs.
    pub fn put(
        &self,
        tid: impl Into<Owner<T>>,
        key: &[u8],
        value: impl Into<Bytes>,
    ) -> Result<Arc<VersionedValue<T>>, T> {
        let value = value.into();
        self.update(tid.into(), key, |entry| Some(entry.with_put(value)))
    }

    /// Overwrite value, tombstone and dirty flags exactly as given.
    pub fn set(
        &self,
        tid: impl Into<Owner<T>>,
        key: &[u8],
        value: impl Into<Bytes>,
        deleted: bool,
        dirty: bool,
    ) -> Result<Arc<VersionedValue<T>>, T> {
        let value = value.into();
        self.update(tid.into(), key, |entry| Some(entry.with_fields(value, deleted, dirty)))
    }

    /// Mark the key deleted (and dirty).
    pub fn del(&self, tid: impl Into<Owner<T>>, key: &[u8]) -> Result<Arc<VersionedValue<T>>, T> {
        self.update(tid.into(), key, |entry| Some(entry.with_deleted()))
    }

    /// Discard `tid`'s workspace. No-op for the final workspace or an unknown tid.
    pub fn purge(&self, tid: impl Into<Owner<T>>) {
        if let Owner::Txn(tid) = tid.into() {
            self.workspaces.lock().remove(&tid);
        }
    }

    /// Publish `tid`'s dirty entries into the final workspace.
    ///
    /// Every key `tid` touched must still be at the version it was derived
    /// from; otherwise nothing is written and all stale keys are reported.
    /// On success returns the owners of the non-default final entries this
    /// merge built on. Callers are expected to [`purge`](Self::purge) `tid`
    /// afterwards.
    pub fn merge_to_final(&self, tid: &T) -> Result<HashSet<T>, T> {
        let Some(workspace) = self.workspaces.lock().get(tid).cloned() else {
            return Ok(HashSet::new());
        };

        let mut final_values = self.final_values.lock();
        let entries = workspace.lock();

        // Defaults loaded here are only kept if the merge goes through.
        let mut loaded: Vec<(&String, Arc<VersionedValue<T>>)> = Vec::new();
        let mut conflicts = Vec::new();
        let mut dependents = HashSet::new();

        for (key_str, entry) in entries.iter() {
            let latest = match final_values.get(key_str) {
                Some(latest) => Arc::clone(latest),
                None => {
                    let latest = Arc::new(self.load_default(entry.key())?);
                    loaded.push((key_str, Arc::clone(&latest)));
                    latest
                }
            };

            if entry.old_version() != latest.new_version() {
                conflicts.push(KeyConflict { key: entry.key().clone(), owner: latest.owner().clone() });
                continue;
            }
            if latest.is_default() {
                continue;
            }
            if let Owner::Txn(owner) = latest.owner() {
                dependents.insert(owner.clone());
            }
        }

        if !conflicts.is_empty() {
            conflicts.sort_by(|a, b| a.key.cmp(&b.key));
            debug!(?tid, ?conflicts, "merge rejected: stale versions");
            return Err(StagingError::Conflict { tid: tid.clone(), conflicts });
        }

        for (key_str, latest) in loaded {
            final_values.insert(key_str.clone(), latest);
        }
        let mut published = 0usize;
        for (key_str, entry) in entries.iter().filter(|(_, entry)| entry.is_dirty()) {
            final_values.insert(key_str.clone(), Arc::new(entry.clone_for_final()));
            published += 1;
        }
        debug!(?tid, touched = entries.len(), published, ?dependents, "merged to final");
        Ok(dependents)
    }

    /// Hold the final-workspace lock until the guard is dropped.
    ///
    /// This is the same lock merges and lazy loads take, so calling any other
    /// operation on this table from the holding thread deadlocks.
    pub fn lock_final(&self) -> FinalGuard<'_, T> {
        FinalGuard { values: self.final_values.lock() }
    }

    /// Number of keys `tid` has touched.
    pub fn workspace_len(&self, tid: &T) -> usize {
        let workspace = self.workspaces.lock().get(tid).cloned();
        workspace.map(|ws| ws.lock().len()).unwrap_or(0)
    }

    /// Transactions that currently own a workspace.
    pub fn active_transactions(&self) -> Vec<T> {
        self.workspaces.lock().keys().cloned().collect()
    }

    /// Get-or-derive the entry, then swap in whatever `f` builds from it.
    fn update<F>(&self, tid: Owner<T>, key: &[u8], f: F) -> Result<Arc<VersionedValue<T>>, T>
    where
        F: FnOnce(&VersionedValue<T>) -> Option<VersionedValue<T>>,
    {
        let key_str = canonical_key(key);
        match tid {
            Owner::Final => {
                let mut final_values = self.final_values.lock();
                let current = self.final_entry(&mut final_values, &key_str, key)?;
                Ok(match f(current.as_ref()) {
                    Some(next) => {
                        let next = Arc::new(next);
                        final_values.insert(key_str, Arc::clone(&next));
                        next
                    }
                    None => current,
                })
            }
            Owner::Txn(tid) => {
                let workspace = self.workspace(&tid);
                let cached = workspace.lock().get(&key_str).cloned();
                let current = match cached {
                    Some(entry) => entry,
                    None => {
                        let latest = {
                            let mut final_values = self.final_values.lock();
                            self.final_entry(&mut final_values, &key_str, key)?
                        };
                        let derived = Arc::new(VersionedValue::derive_for(Owner::Txn(tid), &latest));
                        Arc::clone(workspace.lock().entry(key_str.clone()).or_insert(derived))
                    }
                };
                Ok(match f(current.as_ref()) {
                    Some(next) => {
                        let next = Arc::new(next);
                        workspace.lock().insert(key_str, Arc::clone(&next));
                        next
                    }
                    None => current,
                })
            }
        }
    }

    /// Workspace for `tid`, created on first touch.
    fn workspace(&self, tid: &T) -> Arc<Mutex<Workspace<T>>> {
        let mut workspaces = self.workspaces.lock();
        Arc::clone(workspaces.entry(tid.clone()).or_default())
    }

    /// Final entry for `key`, loading a default from storage if absent.
    /// Caller holds the final-workspace lock.
    fn final_entry(
        &self,
        final_values: &mut Workspace<T>,
        key_str: &str,
        key: &[u8],
    ) -> Result<Arc<VersionedValue<T>>, T> {
        if let Some(entry) = final_values.get(key_str) {
            return Ok(Arc::clone(entry));
        }
        let entry = Arc::new(self.load_default(key)?);
        final_values.insert(key_str.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    fn load_default(&self, key: &[u8]) -> Result<VersionedValue<T>, T> {
        let value = match self.storage.get(key) {
            Ok(value) => value,
            Err(e) if e.is_not_found() => Bytes::new(),
            Err(e) => return Err(e.into()),
        };
        trace!(key = %canonical_key(key), len = value.len(), "loaded default from storage");
        Ok(VersionedValue::new_default(Bytes::copy_from_slice(key), value))
    }
}

/// Scoped hold on the final workspace. Released on drop.
pub struct FinalGuard<'a, T> {
    values: MutexGuard<'a, Workspace<T>>,
}

impl<T> FinalGuard<'_, T> {
    /// Final entry for `key`, if the table has touched it.
    pub fn get(&self, key: &[u8]) -> Option<Arc<VersionedValue<T>>> {
        self.values.get(&canonical_key(key)).cloned()
    }

    /// All final entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &VersionedValue<T>> + '_ {
        self.values.values().map(|entry| entry.as_ref())
    }

    /// Number of keys in the final workspace.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the final workspace is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
