//! Local disk file store
//!
//! ```text
//! <root>/
//! ├── temp/<allocation>/<connection>/<path lookup key>   # staged uploads
//! └── blobs/<allocation>/<hash[..4]>/<hash>              # committed content
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use super::{merkle_root, CommitResult, FileInputData, FileOutputData, FileStore, MERKLE_CHUNK_SIZE};
use crate::digest;
use crate::error::StorageError;
use crate::reference::{canonical_path, lookup_key};

/// Ids and hashes become path components, so only a safe alphabet is allowed
fn check_component(kind: &str, value: &str) -> Result<(), StorageError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::FileStore(format!("Invalid {}: {:?}", kind, value)))
    }
}

pub struct DiskFileStore {
    /// Root directory for temp and committed files
    root_dir: PathBuf,
    /// Chunk size for merkle roots of staged files
    chunk_size: usize,
}

impl DiskFileStore {
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, StorageError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(root_dir.join("temp")).await?;
        fs::create_dir_all(root_dir.join("blobs")).await?;

        info!(path = %root_dir.display(), "Initialized file store");

        Ok(Self {
            root_dir,
            chunk_size: MERKLE_CHUNK_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    fn temp_dir(&self, allocation_id: &str, connection_id: &str) -> Result<PathBuf, StorageError> {
        check_component("allocation id", allocation_id)?;
        check_component("connection id", connection_id)?;
        Ok(self
            .root_dir
            .join("temp")
            .join(allocation_id)
            .join(connection_id))
    }

    /// Path of a staged file
    pub fn temp_path(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
    ) -> Result<PathBuf, StorageError> {
        let name = lookup_key(allocation_id, &canonical_path(&input.path));
        Ok(self.temp_dir(allocation_id, connection_id)?.join(name))
    }

    /// Path of committed content
    pub fn blob_path(&self, allocation_id: &str, content_hash: &str) -> Result<PathBuf, StorageError> {
        check_component("allocation id", allocation_id)?;
        check_component("content hash", content_hash)?;
        let subdir = &content_hash[..4.min(content_hash.len())];
        Ok(self
            .root_dir
            .join("blobs")
            .join(allocation_id)
            .join(subdir)
            .join(content_hash))
    }

    /// Count committed files and bytes
    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        let mut allocations = fs::read_dir(self.root_dir.join("blobs")).await?;
        while let Some(allocation) = allocations.next_entry().await? {
            if !allocation.file_type().await?.is_dir() {
                continue;
            }
            stats.allocations += 1;
            let mut subdirs = fs::read_dir(allocation.path()).await?;
            while let Some(subdir) = subdirs.next_entry().await? {
                if !subdir.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = fs::read_dir(subdir.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    stats.total_files += 1;
                    stats.total_bytes += file.metadata().await?.len();
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn write_temp_file(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
        data: &[u8],
    ) -> Result<FileOutputData, StorageError> {
        let temp_path = self.temp_path(allocation_id, input, connection_id)?;
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&temp_path, data).await?;

        let output = FileOutputData {
            name: input.name.clone(),
            path: input.path.clone(),
            content_hash: digest::hash(data),
            merkle_root: merkle_root(data, self.chunk_size),
            size: data.len() as u64,
        };
        debug!(
            allocation_id = %allocation_id,
            connection_id = %connection_id,
            path = %input.path,
            size = output.size,
            "Staged temp file"
        );
        Ok(output)
    }

    async fn commit_write(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
    ) -> Result<CommitResult, StorageError> {
        let temp_path = self.temp_path(allocation_id, input, connection_id)?;
        let data = match fs::read(&temp_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Moved by an earlier attempt on this connection
                let blob_path = self.blob_path(allocation_id, &input.hash)?;
                if let Ok(meta) = fs::metadata(&blob_path).await {
                    debug!(hash = %input.hash, path = %input.path, "Temp file already committed");
                    return Ok(CommitResult {
                        content_hash: input.hash.clone(),
                        size: meta.len(),
                        already_existed: true,
                    });
                }
                return Err(StorageError::FileStore(format!(
                    "No temp file for {} on connection {}",
                    input.path, connection_id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = digest::hash(&data);
        if actual != input.hash {
            return Err(StorageError::HashMismatch {
                expected: input.hash.clone(),
                actual,
            });
        }

        let blob_path = self.blob_path(allocation_id, &input.hash)?;
        let size = data.len() as u64;

        if fs::metadata(&blob_path).await.is_ok() {
            fs::remove_file(&temp_path).await?;
            debug!(hash = %input.hash, "Content already committed");
            return Ok(CommitResult {
                content_hash: input.hash.clone(),
                size,
                already_existed: true,
            });
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&temp_path, &blob_path).await?;

        info!(
            allocation_id = %allocation_id,
            path = %input.path,
            hash = %input.hash,
            size = size,
            "Committed file"
        );
        Ok(CommitResult {
            content_hash: input.hash.clone(),
            size,
            already_existed: false,
        })
    }

    async fn delete_temp_file(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
    ) -> Result<(), StorageError> {
        let temp_path = self.temp_path(allocation_id, input, connection_id)?;
        match fs::remove_file(&temp_path).await {
            Ok(()) => {
                debug!(path = %input.path, connection_id = %connection_id, "Deleted temp file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, allocation_id: &str, content_hash: &str) -> Result<Vec<u8>, StorageError> {
        let blob_path = self.blob_path(allocation_id, content_hash)?;
        match fs::read(&blob_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(content_hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Committed storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub allocations: u64,
    pub total_files: u64,
    pub total_bytes: u64,
}
