//! Connection commit coordination
//!
//! The collector and reference store do not lock anything themselves. Writers
//! that go through [`WriteCommitter`] are serialized per allocation, and a
//! commit either lands in the store as a whole (file moves excepted) or is
//! discarded.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use super::change::{AllocationChange, AllocationChangeCollector, UploadFormData};
use crate::datastore::{EntityRegistry, StoreContext};
use crate::error::StorageError;
use crate::filestore::{FileInputData, FileStore};
use crate::reference::{canonical_path, file_name, Ref, ReferenceStore};

/// One async mutex per allocation id
#[derive(Default)]
pub struct AllocationLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AllocationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to an allocation
    pub async fn lock(&self, allocation_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(allocation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the entry for an allocation nobody holds or waits on
    ///
    /// Call after releasing the guard. An entry still shared with a holder or
    /// waiter is kept.
    pub fn release(&self, allocation_id: &str) {
        self.locks
            .remove_if(allocation_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of allocations with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Stages, commits and aborts upload connections
pub struct WriteCommitter {
    registry: Arc<EntityRegistry>,
    ref_store: Arc<ReferenceStore>,
    file_store: Arc<dyn FileStore>,
    locks: Arc<AllocationLocks>,
    chunk_size: i64,
}

impl WriteCommitter {
    pub fn new(
        registry: Arc<EntityRegistry>,
        ref_store: Arc<ReferenceStore>,
        file_store: Arc<dyn FileStore>,
        locks: Arc<AllocationLocks>,
    ) -> Self {
        Self {
            registry,
            ref_store,
            file_store,
            locks,
            chunk_size: crate::filestore::MERKLE_CHUNK_SIZE as i64,
        }
    }

    /// Block size used for a change's block count
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1) as i64;
        self
    }

    /// Stage an upload on a connection and record the insert change
    ///
    /// The bytes must match the declared content hash, and the declared
    /// merkle root when one is given.
    pub async fn stage_upload(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        client_id: &str,
        mut form: UploadFormData,
        data: &[u8],
    ) -> Result<AllocationChange, StorageError> {
        form.path = canonical_path(&form.path);
        if form.filename.is_empty() {
            form.filename = file_name(&form.path).to_string();
        }
        let input = FileInputData {
            name: form.filename.clone(),
            path: form.path.clone(),
            hash: form.hash.clone(),
        };

        let output = self
            .file_store
            .write_temp_file(allocation_id, &input, &form.connection_id, data)
            .await?;
        if output.content_hash != form.hash {
            self.file_store
                .delete_temp_file(allocation_id, &input, &form.connection_id)
                .await?;
            return Err(StorageError::HashMismatch {
                expected: form.hash,
                actual: output.content_hash,
            });
        }
        if !form.merkle_root.is_empty() && output.merkle_root != form.merkle_root {
            self.file_store
                .delete_temp_file(allocation_id, &input, &form.connection_id)
                .await?;
            return Err(StorageError::HashMismatch {
                expected: form.merkle_root,
                actual: output.merkle_root,
            });
        }
        if form.merkle_root.is_empty() {
            form.merkle_root = output.merkle_root;
        }

        let size = output.size as i64;
        let num_blocks = (size + self.chunk_size - 1) / self.chunk_size;
        let change = AllocationChange::insert(form, size, num_blocks);

        let mut collector = AllocationChangeCollector::load_or_new(
            &self.registry,
            ctx,
            allocation_id,
            &change.upload.connection_id,
            client_id,
        )?;
        collector.add_change(change.clone());
        collector.save(&self.registry, ctx)?;
        Ok(change)
    }

    /// Record a delete intent for an existing file
    pub fn stage_delete(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        connection_id: &str,
        client_id: &str,
        path: &str,
    ) -> Result<AllocationChange, StorageError> {
        let path = canonical_path(path);
        let existing = self.ref_store.get_ref(ctx, allocation_id, &path)?;
        let content = existing
            .file_content()
            .ok_or_else(|| StorageError::InvalidChange(format!("{} is not a file", path)))?;

        let change = AllocationChange::delete(
            UploadFormData {
                connection_id: connection_id.to_string(),
                filename: existing.name.clone(),
                path,
                hash: content.content_hash.clone(),
                ..Default::default()
            },
            content.size,
        );

        let mut collector = AllocationChangeCollector::load_or_new(
            &self.registry,
            ctx,
            allocation_id,
            connection_id,
            client_id,
        )?;
        collector.add_change(change.clone());
        collector.save(&self.registry, ctx)?;
        Ok(change)
    }

    /// Commit a connection and return the new allocation root
    ///
    /// Runs under the allocation lock. On any failure the store context is
    /// discarded and no root is returned; temp files already moved into
    /// permanent storage stay there.
    pub async fn commit(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<Ref, StorageError> {
        let guard = self.locks.lock(allocation_id).await;

        let result = match self.commit_locked(ctx, allocation_id, connection_id).await {
            Ok(root) => ctx.commit().map(|_| root),
            Err(e) => Err(e),
        };
        drop(guard);
        self.locks.release(allocation_id);

        match result {
            Ok(root) => {
                info!(
                    allocation_id = %allocation_id,
                    connection_id = %connection_id,
                    root_hash = %root.hash,
                    "Committed connection"
                );
                Ok(root)
            }
            Err(e) => {
                ctx.discard();
                warn!(
                    allocation_id = %allocation_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Connection commit failed"
                );
                Err(e)
            }
        }
    }

    async fn commit_locked(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<Ref, StorageError> {
        let collector =
            AllocationChangeCollector::load(&self.registry, ctx, allocation_id, connection_id)?;
        collector
            .commit_to_file_store(self.file_store.as_ref())
            .await?;
        let root = collector.apply_changes(ctx, &self.ref_store)?;
        collector.remove(&self.registry, ctx)?;
        Ok(root)
    }

    /// Abort a connection, dropping its temp files and change record
    pub async fn abort(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<usize, StorageError> {
        let guard = self.locks.lock(allocation_id).await;
        let result = self.abort_locked(ctx, allocation_id, connection_id).await;
        drop(guard);
        self.locks.release(allocation_id);
        result
    }

    async fn abort_locked(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<usize, StorageError> {
        let collector =
            AllocationChangeCollector::load(&self.registry, ctx, allocation_id, connection_id)?;
        let deleted = collector
            .delete_changes(&self.registry, ctx, self.file_store.as_ref())
            .await?;
        ctx.commit()?;
        Ok(deleted)
    }
}
