//! Store context: the transaction a connection or challenge runs inside
//!
//! Writes are buffered in the context and become visible to other contexts
//! only on [`StoreContext::commit`]. Reads see the context's own pending
//! writes first. A context can be cancelled from another task through a
//! [`CancelHandle`]; long operations check it between steps and a cancelled
//! context refuses to commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use uuid::Uuid;

use super::KeyValueStore;
use crate::error::StorageError;

type Pending = BTreeMap<String, Option<Vec<u8>>>;

/// Cancels the context it was taken from
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Transaction scoped to one connection or challenge
pub struct StoreContext {
    id: Uuid,
    store: Arc<dyn KeyValueStore>,
    pending: Mutex<Pending>,
    cancelled: Arc<AtomicBool>,
}

impl StoreContext {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            pending: Mutex::new(BTreeMap::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context id, for log correlation
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if the context has been cancelled
    pub fn ensure_active(&self) -> Result<(), StorageError> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }

    fn pending(&self) -> Result<MutexGuard<'_, Pending>, StorageError> {
        self.pending
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Read a value, or `NotFound`
    pub fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(value) = self.pending()?.get(key) {
            return value
                .clone()
                .ok_or_else(|| StorageError::NotFound(key.to_string()));
        }
        self.store
            .get(key)?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    pub fn write(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.pending()?.insert(key.to_string(), Some(value));
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.pending()?.insert(key.to_string(), None);
        Ok(())
    }

    /// Visit every visible pair in key order
    pub fn iterate<F>(&self, handler: F) -> Result<(), StorageError>
    where
        F: FnMut(&str, &[u8]) -> Result<(), StorageError>,
    {
        self.iterate_prefix("", handler)
    }

    /// Visit every visible pair under `prefix` in key order
    ///
    /// The handler runs on a snapshot, so it may itself read or write through
    /// this context.
    pub fn iterate_prefix<F>(&self, prefix: &str, mut handler: F) -> Result<(), StorageError>
    where
        F: FnMut(&str, &[u8]) -> Result<(), StorageError>,
    {
        let mut merged: BTreeMap<String, Option<Vec<u8>>> = self
            .store
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();

        {
            let pending = self.pending()?;
            for (key, value) in pending.range(prefix.to_string()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                merged.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in merged {
            if let Some(value) = value {
                handler(&key, &value)?;
            }
        }
        Ok(())
    }

    /// Number of buffered mutations
    pub fn pending_len(&self) -> usize {
        self.pending().map(|p| p.len()).unwrap_or(0)
    }

    /// Atomically apply every buffered mutation
    pub fn commit(&self) -> Result<usize, StorageError> {
        self.ensure_active()?;
        let batch: Vec<_> = std::mem::take(&mut *self.pending()?).into_iter().collect();
        let count = batch.len();
        if count > 0 {
            self.store.apply_batch(batch)?;
        }
        debug!(ctx = %self.id, ops = count, "Committed store context");
        Ok(count)
    }

    /// Drop every buffered mutation
    pub fn discard(&self) {
        if let Ok(mut pending) = self.pending() {
            let count = pending.len();
            pending.clear();
            debug!(ctx = %self.id, ops = count, "Discarded store context");
        }
    }
}
