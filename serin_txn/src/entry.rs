//! Versioned value entries held by staging workspaces.

use bytes::Bytes;

use crate::owner::Owner;

/// A key's value as seen or produced by one workspace.
///
/// Entries are never mutated once shared. Staging operations build a
/// replacement entry and swap it into the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue<T> {
    key: Bytes,
    value: Bytes,
    owner: Owner<T>,
    old_version: u64,
    new_version: u64,
    deleted: bool,
    dirty: bool,
}

impl<T: Clone> VersionedValue<T> {
    /// Entry for a value freshly loaded from the backing store (or absent there).
    /// Owned by the final workspace, both versions zero, clean.
    pub fn new_default(key: Bytes, value: Bytes) -> Self {
        Self {
            key,
            value,
            owner: Owner::Final,
            old_version: 0,
            new_version: 0,
            deleted: false,
            dirty: false,
        }
    }

    /// Copy `preceding` into `owner`'s workspace one version ahead.
    pub fn derive_for(owner: Owner<T>, preceding: &Self) -> Self {
        Self {
            key: preceding.key.clone(),
            value: preceding.value.clone(),
            owner,
            old_version: preceding.new_version,
            new_version: preceding.new_version + 1,
            deleted: preceding.deleted,
            dirty: false,
        }
    }

    /// Exact copy with `dirty` forced on, as published into the final workspace.
    pub fn clone_for_final(&self) -> Self {
        Self { dirty: true, ..self.clone() }
    }

    /// Value overwrite that only dirties the entry when the value changes.
    pub(crate) fn with_put(&self, value: Bytes) -> Self {
        Self {
            dirty: self.dirty || self.value != value,
            value,
            ..self.clone()
        }
    }

    /// Unconditional overwrite of value and flags.
    pub(crate) fn with_fields(&self, value: Bytes, deleted: bool, dirty: bool) -> Self {
        Self { value, deleted, dirty, ..self.clone() }
    }

    /// Tombstone.
    pub(crate) fn with_deleted(&self) -> Self {
        Self { deleted: true, dirty: true, ..self.clone() }
    }
}

impl<T> VersionedValue<T> {
    /// Whether this entry came straight from the backing store and was never
    /// produced by a transaction.
    pub fn is_default(&self) -> bool {
        self.owner.is_final() && self.old_version == 0 && self.new_version == 0
    }

    /// Raw key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Current value; empty when absent.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Workspace the entry belongs to.
    pub fn owner(&self) -> &Owner<T> {
        &self.owner
    }

    /// Version this entry was derived from.
    pub fn old_version(&self) -> u64 {
        self.old_version
    }

    /// Version this entry becomes once merged.
    pub fn new_version(&self) -> u64 {
        self.new_version
    }

    /// Tombstone flag.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the entry must be published on merge.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_entry(value: &'static str) -> VersionedValue<u64> {
        VersionedValue::new_default(Bytes::from_static(b"k"), Bytes::from_static(value.as_bytes()))
    }

    #[test]
    fn default_entry_shape() {
        let entry = default_entry("v");
        assert!(entry.is_default());
        assert_eq!(entry.owner(), &Owner::Final);
        assert_eq!((entry.old_version(), entry.new_version()), (0, 0));
        assert!(!entry.is_dirty());
        assert!(!entry.is_deleted());
    }

    #[test]
    fn derive_bumps_version_and_clears_dirty() {
        let base = default_entry("v").with_deleted();
        let derived = VersionedValue::derive_for(Owner::Txn(3), &base);
        assert_eq!(derived.owner(), &Owner::Txn(3));
        assert_eq!((derived.old_version(), derived.new_version()), (0, 1));
        assert_eq!(derived.value(), &Bytes::from_static(b"v"));
        assert!(derived.is_deleted());
        assert!(!derived.is_dirty());
        assert!(!derived.is_default());

        let again = VersionedValue::derive_for(Owner::Txn(4), &derived);
        assert_eq!((again.old_version(), again.new_version()), (1, 2));
    }

    #[test]
    fn put_dirties_only_on_change() {
        let entry = VersionedValue::derive_for(Owner::Txn(1), &default_entry("v"));
        let same = entry.with_put(Bytes::from_static(b"v"));
        assert!(!same.is_dirty());
        let changed = same.with_put(Bytes::from_static(b"w"));
        assert!(changed.is_dirty());
        // Writing the original value back stays dirty.
        let reverted = changed.with_put(Bytes::from_static(b"v"));
        assert!(reverted.is_dirty());
    }

    #[test]
    fn empty_value_put_on_absent_key_is_clean() {
        let entry = VersionedValue::derive_for(Owner::Txn(1), &default_entry(""));
        assert!(!entry.with_put(Bytes::new()).is_dirty());
    }

    #[test]
    fn fields_overwrite_unconditionally() {
        let entry = default_entry("v").with_deleted();
        let set = entry.with_fields(Bytes::from_static(b"v"), false, false);
        assert!(!set.is_deleted());
        assert!(!set.is_dirty());
    }

    #[test]
    fn clone_for_final_forces_dirty() {
        let entry = VersionedValue::derive_for(Owner::Txn(9), &default_entry("v"));
        let published = entry.clone_for_final();
        assert!(published.is_dirty());
        assert_eq!(published.owner(), entry.owner());
        assert_eq!(published.old_version(), entry.old_version());
        assert_eq!(published.new_version(), entry.new_version());
        assert_eq!(published.value(), entry.value());
    }
}
