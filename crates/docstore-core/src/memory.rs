use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::collection::Collection;
use crate::error::StorageError;
use crate::store::{
    DeleteResult, DocumentStore, Filter, InsertManyResult, InsertOneResult, UpdateResult,
};
use crate::tree::ValueTree;
use crate::update::UpdateDocument;

/// In-process document store.
///
/// Every operation runs under one mutex, so each update is atomic with
/// respect to concurrent callers.
#[derive(Debug)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    /// When false, writes are applied but reported as not acknowledged.
    acknowledge: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            acknowledge: true,
        }
    }

    /// A store that reports every write as unacknowledged.
    pub fn unacknowledged() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            acknowledge: false,
        }
    }

    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(collections.entry(collection.to_string()).or_default())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, document), level = "debug")]
    async fn insert_one(
        &self,
        collection: &str,
        document: ValueTree,
    ) -> Result<InsertOneResult, StorageError> {
        let inserted_id = self.with_collection(collection, |c| c.insert(document))?;
        debug!("Inserted {} into {}", inserted_id, collection);
        Ok(InsertOneResult {
            acknowledged: self.acknowledge,
            inserted_id,
        })
    }

    #[instrument(skip(self, documents), level = "debug", fields(count = documents.len()))]
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<ValueTree>,
    ) -> Result<InsertManyResult, StorageError> {
        let inserted_ids = self.with_collection(collection, |c| c.insert_many(documents))?;
        Ok(InsertManyResult {
            acknowledged: self.acknowledge,
            inserted_ids,
        })
    }

    #[instrument(skip(self, update), level = "debug")]
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDocument,
        upsert: bool,
    ) -> Result<UpdateResult, StorageError> {
        let mut result = self.with_collection(collection, |c| c.update_one(filter, update, upsert))?;
        result.acknowledged = self.acknowledge;
        Ok(result)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<DeleteResult, StorageError> {
        let deleted_count = self.with_collection(collection, |c| Ok(c.delete_one(filter)))?;
        Ok(DeleteResult {
            acknowledged: self.acknowledge,
            deleted_count,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<ValueTree>, StorageError> {
        self.with_collection(collection, |c| Ok(c.find(filter, limit)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        self.with_collection(collection, |c| Ok(c.count(filter)))
    }
}
