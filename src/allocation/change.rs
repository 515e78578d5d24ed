//! Per-connection change collector
//!
//! Uploads and deletes sent over one connection are buffered here until the
//! client commits (apply into the reference tree) or aborts (drop temp files).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::datastore::{Entity, EntityRegistry, StoreContext};
use crate::digest;
use crate::error::StorageError;
use crate::filestore::{FileInputData, FileStore};
use crate::reference::{
    canonical_path, file_name, lookup_key, parent_path, FileContent, Ref, RefType, ReferenceStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Delete,
}

/// Upload metadata declared by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFormData {
    pub connection_id: String,
    pub filename: String,
    #[serde(rename = "filepath")]
    pub path: String,
    #[serde(rename = "content_hash")]
    pub hash: String,
    pub merkle_root: String,
    pub actual_hash: String,
    pub actual_size: i64,
    pub custom_meta: String,
}

/// One pending intent on a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChange {
    pub upload: UploadFormData,
    pub size: i64,
    #[serde(rename = "num_of_blocks")]
    pub num_blocks: i64,
    pub operation: Operation,
}

impl AllocationChange {
    pub fn insert(upload: UploadFormData, size: i64, num_blocks: i64) -> Self {
        Self {
            upload,
            size,
            num_blocks,
            operation: Operation::Insert,
        }
    }

    pub fn delete(upload: UploadFormData, size: i64) -> Self {
        Self {
            upload,
            size,
            num_blocks: 0,
            operation: Operation::Delete,
        }
    }

    fn file_input(&self) -> FileInputData {
        FileInputData {
            name: self.upload.filename.clone(),
            path: self.upload.path.clone(),
            hash: self.upload.hash.clone(),
        }
    }
}

/// Entity id of a connection's collector
pub fn collector_id(allocation_id: &str, connection_id: &str) -> String {
    digest::hash(format!("{}:{}", allocation_id, connection_id))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationChangeCollector {
    pub connection_id: String,
    pub allocation_id: String,
    pub client_id: String,
    /// Net size delta of the connection in bytes
    pub size: i64,
    pub last_updated: i64,
    pub changes: Vec<AllocationChange>,
    /// Lookup key -> index into `changes`; derived, never stored
    #[serde(skip)]
    change_map: HashMap<String, usize>,
}

impl Entity for AllocationChangeCollector {
    const NAME: &'static str = "allocation_change";

    fn entity_id(&self) -> String {
        collector_id(&self.allocation_id, &self.connection_id)
    }

    fn after_read(&mut self) {
        self.compute_change_map();
    }
}

impl AllocationChangeCollector {
    pub fn new(allocation_id: &str, connection_id: &str, client_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            allocation_id: allocation_id.to_string(),
            client_id: client_id.to_string(),
            size: 0,
            last_updated: digest::now(),
            changes: Vec::new(),
            change_map: HashMap::new(),
        }
    }

    pub fn load(
        registry: &EntityRegistry,
        ctx: &StoreContext,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<Self, StorageError> {
        registry.read(ctx, &collector_id(allocation_id, connection_id))
    }

    /// Load the connection's collector, or start an empty one
    pub fn load_or_new(
        registry: &EntityRegistry,
        ctx: &StoreContext,
        allocation_id: &str,
        connection_id: &str,
        client_id: &str,
    ) -> Result<Self, StorageError> {
        match Self::load(registry, ctx, allocation_id, connection_id) {
            Ok(collector) => Ok(collector),
            Err(e) if e.is_not_found() => Ok(Self::new(allocation_id, connection_id, client_id)),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, registry: &EntityRegistry, ctx: &StoreContext) -> Result<(), StorageError> {
        registry.write(ctx, self)
    }

    /// Delete the persisted record
    pub fn remove(&self, registry: &EntityRegistry, ctx: &StoreContext) -> Result<(), StorageError> {
        registry.delete::<Self>(ctx, &self.entity_id())
    }

    /// Rebuild the lookup map from the ordered change list
    pub fn compute_change_map(&mut self) {
        self.change_map.clear();
        for (idx, change) in self.changes.iter().enumerate() {
            let key = lookup_key(&self.allocation_id, &canonical_path(&change.upload.path));
            self.change_map.insert(key, idx);
        }
    }

    /// Record a change; a later change on the same path wins the lookup
    pub fn add_change(&mut self, change: AllocationChange) {
        let key = lookup_key(&self.allocation_id, &canonical_path(&change.upload.path));
        match change.operation {
            Operation::Insert => self.size += change.size,
            Operation::Delete => self.size -= change.size,
        }
        self.changes.push(change);
        self.change_map.insert(key, self.changes.len() - 1);
        self.last_updated = digest::now();
    }

    /// Latest change recorded for a path
    pub fn change_for_path(&self, path: &str) -> Option<&AllocationChange> {
        let key = lookup_key(&self.allocation_id, &canonical_path(path));
        self.change_map.get(&key).and_then(|idx| self.changes.get(*idx))
    }

    fn insert_changes(&self) -> impl Iterator<Item = &AllocationChange> {
        self.changes
            .iter()
            .filter(|c| c.operation == Operation::Insert)
    }

    /// Move every uploaded temp file into permanent storage
    ///
    /// Stops at the first failure. Files moved before it stay moved.
    pub async fn commit_to_file_store(&self, file_store: &dyn FileStore) -> Result<(), StorageError> {
        for change in self.insert_changes() {
            file_store
                .commit_write(&self.allocation_id, &change.file_input(), &self.connection_id)
                .await
                .map_err(|e| e.context(format!("committing {} to file store", change.upload.path)))?;
        }
        Ok(())
    }

    /// Apply every insert change to the reference tree, in recorded order
    ///
    /// Returns the allocation root after the last change. On error, changes
    /// applied before the failing one remain written to `ctx`.
    pub fn apply_changes(
        &self,
        ctx: &StoreContext,
        ref_store: &ReferenceStore,
    ) -> Result<Ref, StorageError> {
        for change in self.insert_changes() {
            self.apply_insert(ctx, ref_store, change)?;
        }

        ref_store
            .get_root(ctx, &self.allocation_id)
            .map_err(|e| e.context("reading root reference"))
    }

    fn apply_insert(
        &self,
        ctx: &StoreContext,
        ref_store: &ReferenceStore,
        change: &AllocationChange,
    ) -> Result<(), StorageError> {
        let upload = &change.upload;
        let path = canonical_path(&upload.path);
        let parent_dir = parent_path(&path)
            .ok_or_else(|| StorageError::InvalidChange("cannot upload to the root path".into()))?;
        if !upload.filename.is_empty() && upload.filename != file_name(&path) {
            return Err(StorageError::InvalidChange(format!(
                "filename {} does not match path {}",
                upload.filename, path
            )));
        }

        ref_store
            .ensure_directory_chain(ctx, &self.allocation_id, &parent_dir)
            .map_err(|e| e.context(format!("creating directory refs for {}", parent_dir)))?;

        match ref_store.get_ref(ctx, &self.allocation_id, &path) {
            Ok(existing) if existing.ref_type() == RefType::Directory => {
                return Err(StorageError::InvalidChange(format!(
                    "{} is a directory",
                    path
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let file = Ref::file(
            &self.allocation_id,
            &path,
            Some(ref_store.ref_key(&self.allocation_id, &parent_dir)?),
            FileContent {
                content_hash: upload.hash.clone(),
                size: change.size,
                merkle_root: upload.merkle_root.clone(),
                actual_file_size: upload.actual_size,
                actual_file_hash: upload.actual_hash.clone(),
                custom_meta: upload.custom_meta.clone(),
            },
        );
        ref_store
            .write_ref(ctx, &file)
            .map_err(|e| e.context(format!("writing file ref {}", path)))?;

        let parent = ref_store
            .add_child(ctx, &file)
            .map_err(|e| e.context(format!("linking {} into parent", path)))?;
        ref_store
            .recalculate_hash_bottom_up(ctx, parent)
            .map_err(|e| e.context("calculating allocation hash"))?;

        debug!(
            allocation_id = %self.allocation_id,
            path = %path,
            hash = %file.hash,
            "Applied insert change"
        );
        Ok(())
    }

    /// Abort the connection: drop every uploaded temp file, then the record
    ///
    /// Returns the number of temp files deleted.
    pub async fn delete_changes(
        &self,
        registry: &EntityRegistry,
        ctx: &StoreContext,
        file_store: &dyn FileStore,
    ) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for change in self.insert_changes() {
            file_store
                .delete_temp_file(&self.allocation_id, &change.file_input(), &self.connection_id)
                .await?;
            deleted += 1;
        }
        self.remove(registry, ctx)?;

        info!(
            allocation_id = %self.allocation_id,
            connection_id = %self.connection_id,
            deleted = deleted,
            "Deleted connection changes"
        );
        Ok(deleted)
    }
}
