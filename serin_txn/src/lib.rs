//! SerinDB transaction staging layer (MVCC).
//!
//! Transactions read and tentatively write through a [`StagingTable`], each in
//! its own workspace of [`VersionedValue`] entries derived from the shared
//! final workspace. [`StagingTable::merge_to_final`] publishes a workspace
//! only if every key it touched is still at the version it was derived from.
#![deny(missing_docs)]

pub mod entry;
pub mod error;
pub mod key;
pub mod owner;
pub mod staging;

pub use entry::VersionedValue;
pub use error::{KeyConflict, Result, StagingError};
pub use key::canonical_key;
pub use owner::{Owner, TxnIdentifier};
pub use staging::{FinalGuard, StagingTable};
