//! Configuration for the blobber node

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::datastore::SledStoreConfig;
use crate::error::StorageError;
use crate::filestore::MERKLE_CHUNK_SIZE;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blobber")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for the entity store and file blobs
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Sled page cache in bytes
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,

    /// Merkle leaf size for uploaded content
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// How many times an errored challenge may return to Accepted
    #[serde(default = "default_max_challenge_retries")]
    pub max_challenge_retries: u32,
}

fn default_cache_size() -> u64 {
    64 * 1024 * 1024
}

fn default_chunk_size() -> usize {
    MERKLE_CHUNK_SIZE
}

fn default_max_challenge_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            cache_size: default_cache_size(),
            chunk_size: default_chunk_size(),
            max_challenge_retries: default_max_challenge_retries(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get entity database path
    pub fn metadata_db_path(&self) -> PathBuf {
        self.storage_dir.join("blobberstate.sled")
    }

    /// Get file store root
    pub fn files_dir(&self) -> PathBuf {
        self.storage_dir.join("files")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn sled_config(&self) -> SledStoreConfig {
        SledStoreConfig {
            db_path: self.metadata_db_path(),
            cache_size: self.cache_size,
        }
    }
}
