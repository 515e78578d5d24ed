//! Entity registry
//!
//! Every persisted type is registered once at startup with the db name its
//! keys are prefixed with. The registry is an ordinary value handed to the
//! components that need it; there is no process-wide table.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{KeyValueStore, StoreContext};
use crate::error::StorageError;

/// A type stored under `"<db-name>:<entity-id>"`
pub trait Entity: Serialize + DeserializeOwned {
    /// Registry name of the entity type
    const NAME: &'static str;

    /// Id of this instance within its db
    fn entity_id(&self) -> String;

    /// Rebuild derived state after decoding
    fn after_read(&mut self) {}
}

/// Registration record for one entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub name: &'static str,
    pub db_name: String,
}

/// Registered entity types bound to one store
pub struct EntityRegistry {
    store: Arc<dyn KeyValueStore>,
    entities: HashMap<&'static str, EntityMetadata>,
}

impl EntityRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            entities: HashMap::new(),
        }
    }

    /// Register an entity type whose db name equals its registry name
    pub fn register<E: Entity>(self) -> Self {
        self.register_as::<E>(E::NAME)
    }

    /// Register an entity type under a custom db name
    pub fn register_as<E: Entity>(mut self, db_name: impl Into<String>) -> Self {
        self.entities.insert(
            E::NAME,
            EntityMetadata {
                name: E::NAME,
                db_name: db_name.into(),
            },
        );
        self
    }

    pub fn metadata(&self, name: &str) -> Option<&EntityMetadata> {
        self.entities.get(name)
    }

    /// Start a new store context on the bound store
    pub fn begin(&self) -> StoreContext {
        StoreContext::new(Arc::clone(&self.store))
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    fn metadata_for<E: Entity>(&self) -> Result<&EntityMetadata, StorageError> {
        self.entities
            .get(E::NAME)
            .ok_or_else(|| StorageError::Internal(format!("Entity not registered: {}", E::NAME)))
    }

    /// Key prefix shared by every instance of `E`
    pub fn prefix<E: Entity>(&self) -> Result<String, StorageError> {
        Ok(format!("{}:", self.metadata_for::<E>()?.db_name))
    }

    /// Full store key of the instance of `E` with this id
    pub fn key<E: Entity>(&self, entity_id: &str) -> Result<String, StorageError> {
        Ok(format!("{}{}", self.prefix::<E>()?, entity_id))
    }

    pub fn read<E: Entity>(&self, ctx: &StoreContext, entity_id: &str) -> Result<E, StorageError> {
        let key = self.key::<E>(entity_id)?;
        self.read_key(ctx, &key)
    }

    /// Read by full store key, as held in back-references
    pub fn read_key<E: Entity>(&self, ctx: &StoreContext, key: &str) -> Result<E, StorageError> {
        let bytes = ctx.read(key)?;
        let mut entity: E = decode(&bytes)?;
        entity.after_read();
        Ok(entity)
    }

    pub fn write<E: Entity>(&self, ctx: &StoreContext, entity: &E) -> Result<(), StorageError> {
        let key = self.key::<E>(&entity.entity_id())?;
        ctx.write(&key, encode(entity)?)
    }

    pub fn delete<E: Entity>(&self, ctx: &StoreContext, entity_id: &str) -> Result<(), StorageError> {
        let key = self.key::<E>(entity_id)?;
        ctx.delete(&key)
    }

    /// Decode every instance of `E` visible in the context
    pub fn list<E: Entity>(&self, ctx: &StoreContext) -> Result<Vec<E>, StorageError> {
        let prefix = self.prefix::<E>()?;
        let mut entities = Vec::new();
        ctx.iterate_prefix(&prefix, |_, value| {
            let mut entity: E = decode(value)?;
            entity.after_read();
            entities.push(entity);
            Ok(())
        })?;
        Ok(entities)
    }
}

/// Field-tagged MessagePack encoding
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| StorageError::Encoding(format!("Serialization error: {}", e)))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| StorageError::Encoding(format!("Deserialization error: {}", e)))
}
