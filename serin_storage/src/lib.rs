//! SerinDB storage layer: the key/value backing store read by the staging layer.
#![deny(missing_docs)]

pub mod engine;
pub mod lsm;

pub use engine::{MemoryStorage, Result, Storage, StorageError};
pub use lsm::{LsmConfig, LsmStorage};
