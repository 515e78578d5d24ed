//! sled-backed key-value store

use std::path::PathBuf;

use tracing::{debug, info};

use super::{BatchOp, KeyValueStore};
use crate::error::StorageError;

/// Configuration for the sled store
#[derive(Debug, Clone)]
pub struct SledStoreConfig {
    /// Path to sled database
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: u64,
}

impl Default for SledStoreConfig {
    fn default() -> Self {
        Self {
            db_path: crate::config::default_storage_dir().join("blobberstate.sled"),
            cache_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Entity records in a single sled tree
pub struct SledStore {
    /// Sled database
    db: sled::Db,
    /// Entity tree
    entities: sled::Tree,
}

impl SledStore {
    /// Open or create the store
    pub fn open(config: &SledStoreConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::Config::new()
            .path(&config.db_path)
            .cache_capacity(config.cache_size)
            .mode(sled::Mode::HighThroughput)
            .open()?;

        let store = Self::from_db(db)?;
        info!(path = %config.db_path.display(), "Opened entity store");
        Ok(store)
    }

    /// Open a throwaway store that is removed on drop (for tests)
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let entities = db.open_tree("entities")?;
        Ok(Self { db, entities })
    }

    /// Flush dirty pages to disk
    pub async fn flush(&self) -> Result<usize, StorageError> {
        Ok(self.db.flush_async().await?)
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entities.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut pairs = Vec::new();
        for item in self.entities.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Store(format!("Non UTF-8 key: {}", e)))?;
            pairs.push((key, value.to_vec()));
        }
        Ok(pairs)
    }

    fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<(), StorageError> {
        let count = batch.len();
        let mut sled_batch = sled::Batch::default();
        for (key, value) in batch {
            match value {
                Some(value) => sled_batch.insert(key.as_bytes(), value),
                None => sled_batch.remove(key.as_bytes()),
            }
        }
        self.entities.apply_batch(sled_batch)?;
        debug!(ops = count, "Applied batch");
        Ok(())
    }
}
