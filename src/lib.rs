//! Blobber - storage node core for allocation content
//!
//! A blobber hosts allocations: per-client file trees whose root hash is
//! committed on chain and later challenged by validators.
//!
//! ## Components
//!
//! - **datastore**: sled-backed entity store with per-request contexts
//! - **reference**: the Merkle-style ref tree of each allocation
//! - **allocation**: upload connections, their pending changes, and commit
//! - **filestore**: temp and permanent storage for uploaded bytes
//! - **challenge**: proof-of-storage challenges and validator tickets
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/blobber/
//! ├── blobberstate.sled/         # Refs, change collectors, challenges
//! ├── files/
//! │   ├── temp/<alloc>/<conn>/   # Staged uploads
//! │   └── blobs/<alloc>/ab12/    # Committed content by hash
//! └── config.toml
//! ```

pub mod allocation;
pub mod challenge;
pub mod config;
pub mod datastore;
pub mod digest;
pub mod error;
pub mod filestore;
pub mod reference;

use std::sync::Arc;

pub use allocation::{
    AllocationChange, AllocationChangeCollector, AllocationLocks, Operation, UploadFormData,
    WriteCommitter,
};
pub use challenge::{
    ChallengeEntity, ChallengeProcessor, ChallengeStatus, TicketOutcome, ValidationTicket,
};
pub use config::Config;
pub use datastore::{EntityRegistry, KeyValueStore, SledStore, StoreContext};
pub use error::StorageError;
pub use filestore::{DiskFileStore, FileStore};
pub use reference::{Ref, RefType, ReferenceStore};

/// Registry with every persisted entity of the node registered
pub fn setup_entities(store: Arc<dyn KeyValueStore>) -> EntityRegistry {
    EntityRegistry::new(store)
        .register::<Ref>()
        .register::<AllocationChangeCollector>()
        .register::<ChallengeEntity>()
}
