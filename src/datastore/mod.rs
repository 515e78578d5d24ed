//! Key-value persistence for blobber entities
//!
//! ## Layers
//!
//! ```text
//! EntityRegistry   typed read/write/delete, "<db-name>:<entity-id>" keys
//!     ↓
//! StoreContext     per-connection transaction (read-your-writes, atomic commit)
//!     ↓
//! KeyValueStore    raw backend (sled)
//! ```
//!
//! Backends only provide point reads, prefix scans and atomic batches. Every
//! transactional behavior lives in [`StoreContext`] so it is identical across
//! backends.

pub mod context;
pub mod registry;
pub mod sled_store;

pub use context::{CancelHandle, StoreContext};
pub use registry::{Entity, EntityMetadata, EntityRegistry};
pub use sled_store::{SledStore, SledStoreConfig};

use crate::error::StorageError;

/// One pending mutation: `Some(value)` writes, `None` deletes
pub type BatchOp = (String, Option<Vec<u8>>);

/// Raw key-value backend
pub trait KeyValueStore: Send + Sync {
    /// Point read of a committed value
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// All committed pairs whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Apply a batch atomically
    fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<(), StorageError>;
}
