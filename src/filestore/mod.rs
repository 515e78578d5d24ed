//! File byte storage for uploads
//!
//! Uploads land in a connection-scoped temp area first. Committing a
//! connection moves each temp file into permanent content-addressed storage;
//! aborting it deletes the temp files.

pub mod disk;
pub mod merkle;

pub use disk::{DiskFileStore, StorageStats};
pub use merkle::{merkle_root, MERKLE_CHUNK_SIZE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Identifies one uploaded file within a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInputData {
    pub name: String,
    pub path: String,
    /// Content hash the client declared
    pub hash: String,
}

/// What the store observed about bytes it wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutputData {
    pub name: String,
    pub path: String,
    pub content_hash: String,
    pub merkle_root: String,
    pub size: u64,
}

/// Result of moving a temp file into permanent storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub content_hash: String,
    pub size: u64,
    /// Content was already stored under this hash
    pub already_existed: bool,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Stage bytes for a connection
    async fn write_temp_file(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
        data: &[u8],
    ) -> Result<FileOutputData, StorageError>;

    /// Validate a staged file against `input.hash` and move it into permanent storage
    async fn commit_write(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
    ) -> Result<CommitResult, StorageError>;

    /// Remove a staged file
    async fn delete_temp_file(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
    ) -> Result<(), StorageError>;

    /// Read committed content by hash
    async fn get(&self, allocation_id: &str, content_hash: &str) -> Result<Vec<u8>, StorageError>;
}
