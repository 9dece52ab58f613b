//! Document matching and update application shared by the bundled stores.

use std::collections::HashSet;

use tracing::debug;

use crate::error::StorageError;
use crate::id::ObjectId;
use crate::path::FieldPath;
use crate::store::{Filter, UpdateResult};
use crate::tree::ValueTree;
use crate::update::UpdateDocument;
use crate::value::Value;
use crate::ID_FIELD;

/// An ordered set of documents with unique `_id`s.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    documents: Vec<ValueTree>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap documents loaded from persistent storage.
    pub fn from_documents(documents: Vec<ValueTree>) -> Result<Self, StorageError> {
        let mut collection = Self::new();
        collection.insert_many(documents)?;
        Ok(collection)
    }

    pub fn documents(&self) -> &[ValueTree] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn insert(&mut self, document: ValueTree) -> Result<ObjectId, StorageError> {
        let (document, id) = Self::with_identity(document)?;
        if self.position_of(id).is_some() {
            return Err(StorageError::InvalidArgument(format!(
                "duplicate key: {} {}",
                ID_FIELD, id
            )));
        }
        self.documents.push(document);
        Ok(id)
    }

    /// Insert every document or none of them.
    pub fn insert_many(&mut self, documents: Vec<ValueTree>) -> Result<Vec<ObjectId>, StorageError> {
        let mut prepared = Vec::with_capacity(documents.len());
        let mut seen = HashSet::new();
        for document in documents {
            let (document, id) = Self::with_identity(document)?;
            if !seen.insert(id) || self.position_of(id).is_some() {
                return Err(StorageError::InvalidArgument(format!(
                    "duplicate key: {} {}",
                    ID_FIELD, id
                )));
            }
            prepared.push((document, id));
        }
        let ids = prepared.iter().map(|(_, id)| *id).collect();
        self.documents.extend(prepared.into_iter().map(|(doc, _)| doc));
        Ok(ids)
    }

    pub fn update_one(
        &mut self,
        filter: &Filter,
        update: &UpdateDocument,
        upsert: bool,
    ) -> Result<UpdateResult, StorageError> {
        validate(update)?;

        if let Some(pos) = self.documents.iter().position(|d| filter.matches(d)) {
            let mut updated = self.documents[pos].clone();
            apply(&mut updated, update)?;
            let modified = updated != self.documents[pos];
            if modified {
                self.documents[pos] = updated;
            }
            return Ok(UpdateResult {
                acknowledged: true,
                matched_count: 1,
                modified_count: u64::from(modified),
                upserted_id: None,
            });
        }

        if !upsert {
            return Ok(UpdateResult {
                acknowledged: true,
                ..Default::default()
            });
        }

        let mut seeded = ValueTree::new();
        for (path, value) in filter.conditions() {
            seeded.set(path, value.clone())?;
        }
        apply(&mut seeded, update)?;
        let id = self.insert(seeded)?;
        debug!("Upserted document {}", id);
        Ok(UpdateResult {
            acknowledged: true,
            matched_count: 0,
            modified_count: 0,
            upserted_id: Some(id),
        })
    }

    pub fn delete_one(&mut self, filter: &Filter) -> u64 {
        match self.documents.iter().position(|d| filter.matches(d)) {
            Some(pos) => {
                self.documents.remove(pos);
                1
            }
            None => 0,
        }
    }

    pub fn find(&self, filter: &Filter, limit: Option<usize>) -> Vec<ValueTree> {
        self.documents
            .iter()
            .filter(|d| filter.matches(d))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn count(&self, filter: &Filter) -> u64 {
        self.documents.iter().filter(|d| filter.matches(d)).count() as u64
    }

    fn position_of(&self, id: ObjectId) -> Option<usize> {
        let id = Value::ObjectId(id);
        self.documents
            .iter()
            .position(|d| d.as_map().get(ID_FIELD) == Some(&id))
    }

    fn with_identity(document: ValueTree) -> Result<(ValueTree, ObjectId), StorageError> {
        let existing = document.as_map().get(ID_FIELD).cloned();
        match existing {
            Some(Value::ObjectId(id)) => Ok((document, id)),
            Some(other) => Err(StorageError::InvalidArgument(format!(
                "{} must be an ObjectId, got {:?}",
                ID_FIELD,
                other.kind()
            ))),
            None => {
                let id = ObjectId::new();
                Ok((document.with(ID_FIELD, id), id))
            }
        }
    }
}

/// Reject updates the store cannot apply in a single call.
pub fn validate(update: &UpdateDocument) -> Result<(), StorageError> {
    let identity = FieldPath::key(ID_FIELD);
    if let Some(path) = update.paths().find(|p| identity.is_prefix_of(p)) {
        return Err(StorageError::InvalidArgument(format!(
            "update may not modify {}",
            path
        )));
    }

    let others: Vec<&FieldPath> = update
        .assign
        .keys()
        .chain(update.remove.iter())
        .chain(update.increment.keys())
        .collect();
    for append_path in update.append.keys() {
        if let Some(other) = others.iter().find(|p| append_path.conflicts_with(p)) {
            return Err(StorageError::InvalidArgument(format!(
                "append to {} conflicts with an operation on {}",
                append_path, other
            )));
        }
    }
    Ok(())
}

/// Apply every grouping of `update` to `document`.
pub fn apply(document: &mut ValueTree, update: &UpdateDocument) -> Result<(), StorageError> {
    for (path, value) in &update.assign {
        document.set(path, value.clone())?;
    }
    for path in &update.remove {
        document.remove(path);
    }
    for (path, append) in &update.append {
        match document.get(path) {
            None | Some(Value::Null) => {
                document.set(path, Value::Array(append.values.clone()))?;
            }
            Some(Value::Array(items)) => {
                let mut items = items.clone();
                items.extend(append.values.iter().cloned());
                document.set(path, Value::Array(items))?;
            }
            Some(other) => {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot append to {}: it holds a {:?}",
                    path,
                    other.kind()
                )))
            }
        }
    }
    for (path, delta) in &update.increment {
        let next = match document.get(path) {
            None => Value::Int(*delta),
            Some(Value::Int(i)) => Value::Int(i.checked_add(*delta).ok_or_else(|| {
                StorageError::InvalidArgument(format!("increment of {} overflows", path))
            })?),
            Some(Value::Float(f)) => Value::Float(f + *delta as f64),
            Some(other) => {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot increment {}: it holds a {:?}",
                    path,
                    other.kind()
                )))
            }
        };
        document.set(path, next)?;
    }
    Ok(())
}
