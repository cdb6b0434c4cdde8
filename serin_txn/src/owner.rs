//! Transaction identifiers and entry ownership.

use std::fmt::Debug;
use std::hash::Hash;

/// Bounds every transaction identifier must satisfy.
///
/// Identifiers are opaque to the staging layer: it only compares, hashes and
/// clones them.
pub trait TxnIdentifier: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> TxnIdentifier for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Who an entry or an operation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner<T> {
    /// The final (already merged) workspace itself.
    Final,
    /// An in-flight transaction.
    Txn(T),
}

impl<T> Owner<T> {
    /// Whether this addresses the final workspace.
    pub fn is_final(&self) -> bool {
        matches!(self, Owner::Final)
    }

    /// The transaction identifier, if any.
    pub fn txn(&self) -> Option<&T> {
        match self {
            Owner::Final => None,
            Owner::Txn(tid) => Some(tid),
        }
    }
}

impl<T> From<T> for Owner<T> {
    fn from(tid: T) -> Self {
        Owner::Txn(tid)
    }
}
