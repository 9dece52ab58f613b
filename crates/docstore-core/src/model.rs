//! Models and the collaborators that move values in and out of them.

use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StorageError;
use crate::tree::ValueTree;
use crate::value::Value;

/// A domain object that can report its current values as a document.
pub trait Document: Send + Sync + 'static {
    /// Current values, including the identity field when the object has one.
    fn values(&self) -> ValueTree;
}

/// Shared handle to a model.
///
/// Change tracking keys snapshots by handle identity: clones of a handle
/// share one snapshot, two handles built from equal values do not.
pub struct Model<M>(Arc<RwLock<M>>);

impl<M: Document> Model<M> {
    pub fn new(inner: M) -> Self {
        Self(Arc::new(RwLock::new(inner)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, M> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, M> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current values of the wrapped object.
    pub fn values(&self) -> ValueTree {
        self.read().values()
    }

    pub fn ptr_eq(&self, other: &Model<M>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address used to key the tracker's side table.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Type-erased handle; downgraded by the tracker so it never keeps the model alive.
    pub(crate) fn erased(&self) -> Arc<dyn Any + Send + Sync> {
        self.0.clone()
    }
}

impl<M> Clone for Model<M> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<M: Document + std::fmt::Debug> std::fmt::Debug for Model<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Model").field(&*self.read()).finish()
    }
}

/// Builds and populates models.
pub trait Hydrator<M>: Send + Sync {
    /// A fresh, default-valued model.
    fn create(&self) -> M;

    /// Populate `model` from `values`. Only the members present in `values`
    /// are touched.
    fn hydrate(&self, values: &ValueTree, model: &mut M) -> Result<(), StorageError>;

    fn hydrate_new(&self, values: &ValueTree) -> Result<M, StorageError> {
        let mut model = self.create();
        self.hydrate(values, &mut model)?;
        Ok(model)
    }
}

/// Converts between native values and the store's representation.
pub trait ValueConverter: Send + Sync {
    /// `previous` is the last stored form, when known, so encodings can stay stable.
    fn to_store_values(
        &self,
        values: &ValueTree,
        previous: Option<&ValueTree>,
    ) -> Result<ValueTree, StorageError>;

    fn to_native_values(&self, store_values: &ValueTree) -> Result<ValueTree, StorageError>;
}

/// Converter for stores that hold native values as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughConverter;

impl ValueConverter for PassthroughConverter {
    fn to_store_values(
        &self,
        values: &ValueTree,
        _previous: Option<&ValueTree>,
    ) -> Result<ValueTree, StorageError> {
        Ok(values.clone())
    }

    fn to_native_values(&self, store_values: &ValueTree) -> Result<ValueTree, StorageError> {
        Ok(store_values.clone())
    }
}

/// Schemaless model: the document itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericDocument {
    pub fields: ValueTree,
}

impl GenericDocument {
    pub fn new(fields: ValueTree) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.as_map().get(key)
    }

    /// Assign a top-level member; null removes it.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields = std::mem::take(&mut self.fields).with(key, value);
    }
}

impl Document for GenericDocument {
    fn values(&self) -> ValueTree {
        self.fields.clone()
    }
}

/// Hydrator for [`GenericDocument`]: top-level members are replaced wholesale.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeHydrator;

impl Hydrator<GenericDocument> for TreeHydrator {
    fn create(&self) -> GenericDocument {
        GenericDocument::default()
    }

    fn hydrate(&self, values: &ValueTree, model: &mut GenericDocument) -> Result<(), StorageError> {
        for (key, value) in values.as_map() {
            model.set(key, value.clone());
        }
        Ok(())
    }
}
