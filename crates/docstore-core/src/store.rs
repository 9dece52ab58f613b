use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::id::ObjectId;
use crate::path::FieldPath;
use crate::tree::ValueTree;
use crate::update::UpdateDocument;
use crate::value::Value;

/// Conjunction of equality conditions. A null condition matches absence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<FieldPath, Value>,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn field(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::default().and_eq(path, value)
    }

    pub fn by_id(field: &str, id: ObjectId) -> Self {
        Self::field(FieldPath::key(field), id)
    }

    pub fn and_eq(mut self, path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        self.conditions.insert(path.into(), value.into());
        self
    }

    pub fn conditions(&self) -> &BTreeMap<FieldPath, Value> {
        &self.conditions
    }

    pub fn matches(&self, document: &ValueTree) -> bool {
        self.conditions.iter().all(|(path, expected)| {
            match document.get(path) {
                Some(actual) => actual == expected,
                None => expected.is_null(),
            }
        })
    }
}

/// Result of a single-document insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOneResult {
    pub acknowledged: bool,
    pub inserted_id: ObjectId,
}

/// Result of a batch insert. `inserted_ids` follows submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertManyResult {
    pub acknowledged: bool,
    pub inserted_ids: Vec<ObjectId>,
}

/// Result of a filtered single-document update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub acknowledged: bool,
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub acknowledged: bool,
    pub deleted_count: u64,
}

/// Document store abstraction.
///
/// All methods take the collection name first; implementations keep
/// collections isolated from one another. `update_one` must apply the whole
/// update atomically to at most one document, and must reject an update
/// whose `append` grouping touches a path that another grouping also touches
/// (same path, ancestor or descendant).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "local").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Insert one document, generating `_id` when absent.
    async fn insert_one(
        &self,
        collection: &str,
        document: ValueTree,
    ) -> Result<InsertOneResult, StorageError>;

    /// Insert documents in one call. Either all are inserted or none.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<ValueTree>,
    ) -> Result<InsertManyResult, StorageError>;

    /// Apply `update` to the first document matching `filter`.
    ///
    /// With `upsert`, a new document seeded from the filter's equality
    /// conditions is created when nothing matches.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDocument,
        upsert: bool,
    ) -> Result<UpdateResult, StorageError>;

    /// Delete the first document matching `filter`.
    async fn delete_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<DeleteResult, StorageError>;

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Documents matching `filter`, in insertion order.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<ValueTree>, StorageError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<ValueTree>, StorageError> {
        Ok(self.find(collection, filter, Some(1)).await?.into_iter().next())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matching() {
        let doc = ValueTree::from_json(&json!({ "name": "a", "address": { "city": "Paris" } }))
            .unwrap();
        assert!(Filter::all().matches(&doc));
        assert!(Filter::field("name", "a").matches(&doc));
        assert!(Filter::field("address.city", "Paris").and_eq("name", "a").matches(&doc));
        assert!(!Filter::field("name", "b").matches(&doc));
        assert!(Filter::field("missing", Value::Null).matches(&doc));
        assert!(!Filter::field("version", 1).matches(&doc));
    }

    #[test]
    fn test_object_id_serializes_as_hex() {
        let id = ObjectId::new();
        let json = serde_json::to_value(InsertOneResult {
            acknowledged: true,
            inserted_id: id,
        })
        .unwrap();
        assert_eq!(json["inserted_id"], id.to_hex());
    }
}
