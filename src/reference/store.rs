//! Reference store: tree mutation and hash recomputation

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    ancestors_top_down, canonical_path, directory_hash, join_path, lookup_key, parent_path, Ref,
    RefKind, RefListing, RefType,
};
use crate::datastore::{EntityRegistry, StoreContext};
use crate::error::{HashChainStep, StorageError};

fn chain_error(path: &str, step: HashChainStep, source: StorageError) -> StorageError {
    StorageError::HashChain {
        path: path.to_string(),
        step,
        source: Box::new(source),
    }
}

/// Per-allocation namespace and its content commitment
pub struct ReferenceStore {
    registry: Arc<EntityRegistry>,
}

impl ReferenceStore {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Full store key of the ref at `path`
    pub fn ref_key(&self, allocation_id: &str, path: &str) -> Result<String, StorageError> {
        self.registry
            .key::<Ref>(&lookup_key(allocation_id, &canonical_path(path)))
    }

    pub fn get_ref(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        path: &str,
    ) -> Result<Ref, StorageError> {
        self.registry
            .read(ctx, &lookup_key(allocation_id, &canonical_path(path)))
    }

    pub fn write_ref(&self, ctx: &StoreContext, r: &Ref) -> Result<(), StorageError> {
        self.registry.write(ctx, r)
    }

    /// Root ref of an allocation, or `NotFound`
    pub fn get_root(&self, ctx: &StoreContext, allocation_id: &str) -> Result<Ref, StorageError> {
        self.get_ref(ctx, allocation_id, "/")
    }

    /// Create every missing directory from the root down to `dir_path`
    ///
    /// Each directory is linked into its parent and, when anything was
    /// created, the ancestors are rehashed up to the root. Returns the
    /// directory at `dir_path`. Calling it again on an existing chain writes
    /// nothing.
    pub fn ensure_directory_chain(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        dir_path: &str,
    ) -> Result<Ref, StorageError> {
        let dir_path = canonical_path(dir_path);
        let mut parent: Option<(String, Ref)> = None;
        let mut created_any = false;

        for path in ancestors_top_down(&dir_path) {
            let key = self.ref_key(allocation_id, &path)?;
            let dir = match self.registry.read_key::<Ref>(ctx, &key) {
                Ok(existing) => {
                    if existing.ref_type() != RefType::Directory {
                        return Err(StorageError::NotADirectory(path));
                    }
                    existing
                }
                Err(e) if e.is_not_found() => {
                    let parent_key = parent.as_ref().map(|(k, _)| k.clone());
                    let mut created = Ref::directory(allocation_id, &path, parent_key);
                    created.hash = directory_hash(std::iter::empty());
                    self.registry.write(ctx, &created)?;
                    created_any = true;
                    debug!(allocation_id = %allocation_id, path = %path, "Created directory ref");
                    created
                }
                Err(e) => return Err(e),
            };

            if let Some((_, mut parent_dir)) = parent.take() {
                if link(&mut parent_dir, &dir.name, &key) {
                    self.registry.write(ctx, &parent_dir)?;
                }
            }
            parent = Some((key, dir));
        }

        let dir = parent
            .map(|(_, dir)| dir)
            .ok_or_else(|| StorageError::Internal(format!("Empty directory chain for {}", dir_path)))?;
        if created_any {
            // New directories are always a suffix of the chain, so the deepest is new
            self.recalculate_hash_bottom_up(ctx, dir.clone())?;
        }
        Ok(dir)
    }

    /// Link `child` into its parent directory, re-read from the store
    ///
    /// Returns the updated parent.
    pub fn add_child(&self, ctx: &StoreContext, child: &Ref) -> Result<Ref, StorageError> {
        let parent_key = child
            .parent_ref
            .as_deref()
            .ok_or_else(|| StorageError::Internal(format!("{} has no parent", child.path)))?;
        let mut parent: Ref = self.registry.read_key(ctx, parent_key)?;
        if parent.ref_type() != RefType::Directory {
            return Err(StorageError::NotADirectory(parent.path));
        }
        let child_key = self.ref_key(&child.allocation_id, &child.path)?;
        if link(&mut parent, &child.name, &child_key) {
            self.registry.write(ctx, &parent)?;
        }
        Ok(parent)
    }

    /// Hash of a ref from its own fields or its currently stored children
    fn compute_hash(&self, ctx: &StoreContext, r: &Ref) -> Result<String, StorageError> {
        match &r.kind {
            RefKind::File(_) => r
                .file_hash()
                .ok_or_else(|| StorageError::Internal(format!("No file hash for {}", r.path))),
            RefKind::Directory { children } => {
                let mut hashes = Vec::with_capacity(children.len());
                for (name, key) in children {
                    let child: Ref = self.registry.read_key(ctx, key).map_err(|e| {
                        chain_error(&join_path(&r.path, name), HashChainStep::ReadChild, e)
                    })?;
                    hashes.push(child.hash);
                }
                Ok(directory_hash(hashes.iter().map(String::as_str)))
            }
        }
    }

    /// Recompute `r`'s hash, then every ancestor's, up to the root
    ///
    /// Each parent is re-read from the store before it is rehashed. Returns the
    /// updated root. On error some ancestors may already be rewritten in the
    /// context; the caller must discard the context or rebuild the tree.
    pub fn recalculate_hash_bottom_up(
        &self,
        ctx: &StoreContext,
        r: Ref,
    ) -> Result<Ref, StorageError> {
        let mut current = r;
        loop {
            ctx.ensure_active()
                .map_err(|e| chain_error(&current.path, HashChainStep::Cancelled, e))?;

            current.hash = self.compute_hash(ctx, &current)?;
            self.registry
                .write(ctx, &current)
                .map_err(|e| chain_error(&current.path, HashChainStep::WriteRef, e))?;
            debug!(path = %current.path, hash = %current.hash, "Rehashed ref");

            let parent_key = match current.parent_ref.clone() {
                Some(key) => key,
                None => return Ok(current),
            };
            let parent_dir = parent_path(&current.path).unwrap_or_else(|| "/".to_string());
            current = self
                .registry
                .read_key(ctx, &parent_key)
                .map_err(|e| chain_error(&parent_dir, HashChainStep::ReadParent, e))?;
        }
    }

    /// Listing rows for the children of a directory
    pub fn list_directory(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
        path: &str,
    ) -> Result<Vec<RefListing>, StorageError> {
        let dir = self.get_ref(ctx, allocation_id, path)?;
        let children = dir
            .children()
            .ok_or_else(|| StorageError::NotADirectory(dir.path.clone()))?;
        let mut rows = Vec::with_capacity(children.len());
        for key in children.values() {
            let child: Ref = self.registry.read_key(ctx, key)?;
            rows.push(child.listing());
        }
        Ok(rows)
    }

    /// Root hash recomputed from file fields alone, ignoring stored directory hashes
    pub fn recompute_root_hash(
        &self,
        ctx: &StoreContext,
        allocation_id: &str,
    ) -> Result<String, StorageError> {
        let root = self.get_root(ctx, allocation_id)?;
        self.recompute(ctx, &root)
    }

    fn recompute(&self, ctx: &StoreContext, r: &Ref) -> Result<String, StorageError> {
        match &r.kind {
            RefKind::File(_) => self.compute_hash(ctx, r),
            RefKind::Directory { children } => {
                let mut hashes = Vec::with_capacity(children.len());
                for key in children.values() {
                    let child: Ref = self.registry.read_key(ctx, key)?;
                    hashes.push(self.recompute(ctx, &child)?);
                }
                Ok(directory_hash(hashes.iter().map(String::as_str)))
            }
        }
    }

    /// Check that every stored hash matches its node's stored inputs
    ///
    /// Returns the root hash, or `HashMismatch` wrapped with the first
    /// inconsistent path.
    pub fn verify_tree(&self, ctx: &StoreContext, allocation_id: &str) -> Result<String, StorageError> {
        let root = self.get_root(ctx, allocation_id)?;
        self.verify_node(ctx, &root)?;
        Ok(root.hash)
    }

    fn verify_node(&self, ctx: &StoreContext, r: &Ref) -> Result<(), StorageError> {
        if let Some(children) = r.children() {
            for key in children.values() {
                let child: Ref = self.registry.read_key(ctx, key)?;
                self.verify_node(ctx, &child)?;
            }
        }
        let expected = self.compute_hash(ctx, r)?;
        if expected != r.hash {
            return Err(StorageError::HashMismatch {
                expected,
                actual: r.hash.clone(),
            }
            .context(format!("verifying {}", r.path)));
        }
        Ok(())
    }

    /// Rewrite every hash in the allocation, children first
    ///
    /// Recovery path after a failed or cancelled bottom-up chain.
    pub fn rebuild_hashes(&self, ctx: &StoreContext, allocation_id: &str) -> Result<Ref, StorageError> {
        let root = self.get_root(ctx, allocation_id)?;
        let root = self.rebuild(ctx, root)?;
        info!(allocation_id = %allocation_id, root_hash = %root.hash, "Rebuilt allocation hashes");
        Ok(root)
    }

    fn rebuild(&self, ctx: &StoreContext, mut r: Ref) -> Result<Ref, StorageError> {
        ctx.ensure_active()?;
        if let Some(children) = r.children() {
            for key in children.values() {
                let child: Ref = self.registry.read_key(ctx, key)?;
                self.rebuild(ctx, child)?;
            }
        }
        r.hash = self.compute_hash(ctx, &r)?;
        self.registry.write(ctx, &r)?;
        Ok(r)
    }
}

/// Insert `name -> key` into a directory; true if anything changed
fn link(dir: &mut Ref, name: &str, key: &str) -> bool {
    match &mut dir.kind {
        RefKind::Directory { children } => {
            if children.get(name).map(String::as_str) == Some(key) {
                return false;
            }
            children.insert(name.to_string(), key.to_string());
            true
        }
        RefKind::File(_) => false,
    }
}
