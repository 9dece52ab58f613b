//! The storage façade: loads models, writes their diffs and coordinates locking.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::id::ObjectId;
use crate::lock::{LockTicket, PessimisticLock};
use crate::model::{Document, Hydrator, Model, PassthroughConverter, ValueConverter};
use crate::path::FieldPath;
use crate::store::{
    DeleteResult, DocumentStore, Filter, InsertManyResult, InsertOneResult, UpdateResult,
};
use crate::tracker::ChangeTracker;
use crate::tree::ValueTree;
use crate::update::UpdateDocument;
use crate::value::Value;
use crate::ID_FIELD;

/// Default name of the optimistic-locking version field.
pub const DEFAULT_VERSION_FIELD: &str = "version";

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Path of the integer field used for optimistic locking.
    pub version_field: String,
    /// Wait bound for [`DocumentManager::lock`] calls that pass no timeout.
    /// `None` waits indefinitely.
    pub lock_timeout: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            version_field: DEFAULT_VERSION_FIELD.to_string(),
            lock_timeout: None,
        }
    }
}

/// Per-call options for [`DocumentManager::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Create the document when the filter matches nothing.
    pub upsert: bool,
    /// Require the stored version to equal the model's, and bump it.
    pub optimistic_lock: bool,
}

impl UpdateOptions {
    pub fn optimistic() -> Self {
        Self {
            optimistic_lock: true,
            ..Default::default()
        }
    }

    pub fn upsert() -> Self {
        Self {
            upsert: true,
            ..Default::default()
        }
    }
}

/// What an update did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The model had no changes; the store was not called.
    Unchanged,
    Written(UpdateResult),
}

impl UpdateOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, UpdateOutcome::Written(_))
    }

    pub fn result(&self) -> Option<&UpdateResult> {
        match self {
            UpdateOutcome::Written(result) => Some(result),
            UpdateOutcome::Unchanged => None,
        }
    }
}

/// The document a pessimistic lock is taken on.
pub enum LockTarget<M> {
    Model(Model<M>),
    Id(ObjectId),
    /// The 24-character hex rendering of an id.
    IdString(String),
}

impl<M: Document> LockTarget<M> {
    pub fn resolve(self) -> Result<ObjectId, StorageError> {
        match self {
            LockTarget::Id(id) => Ok(id),
            LockTarget::IdString(s) => ObjectId::parse_str(&s),
            LockTarget::Model(model) => identity_of(&model.values()).ok_or_else(|| {
                StorageError::UnsupportedIdentity("model has no identity".to_string())
            }),
        }
    }
}

impl<M> From<ObjectId> for LockTarget<M> {
    fn from(id: ObjectId) -> Self {
        LockTarget::Id(id)
    }
}

impl<M> From<Model<M>> for LockTarget<M> {
    fn from(model: Model<M>) -> Self {
        LockTarget::Model(model)
    }
}

impl<M> From<&Model<M>> for LockTarget<M> {
    fn from(model: &Model<M>) -> Self {
        LockTarget::Model(model.clone())
    }
}

impl<M> From<&str> for LockTarget<M> {
    fn from(s: &str) -> Self {
        LockTarget::IdString(s.to_string())
    }
}

impl<M> From<String> for LockTarget<M> {
    fn from(s: String) -> Self {
        LockTarget::IdString(s)
    }
}

fn identity_of(values: &ValueTree) -> Option<ObjectId> {
    values.as_map().get(ID_FIELD).and_then(Value::as_object_id)
}

/// Storage façade for one collection of `M` models.
///
/// Reads register each loaded model's raw document as its baseline; writes
/// send only the diff against that baseline and re-register afterwards.
pub struct DocumentManager<M: Document> {
    collection: String,
    store: Arc<dyn DocumentStore>,
    hydrator: Arc<dyn Hydrator<M>>,
    converter: Arc<dyn ValueConverter>,
    lock: Option<Arc<dyn PessimisticLock>>,
    tracker: ChangeTracker,
    options: ManagerOptions,
}

impl<M: Document> DocumentManager<M> {
    pub fn new(
        collection: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        hydrator: Arc<dyn Hydrator<M>>,
    ) -> Self {
        Self {
            collection: collection.into(),
            store,
            hydrator,
            converter: Arc::new(PassthroughConverter),
            lock: None,
            tracker: ChangeTracker::new(ID_FIELD),
            options: ManagerOptions::default(),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn PessimisticLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// A fresh model, not yet registered or stored.
    pub fn create(&self) -> Model<M> {
        Model::new(self.hydrator.create())
    }

    pub fn identity(&self, model: &Model<M>) -> Option<ObjectId> {
        identity_of(&model.values())
    }

    /// Pending operations for `model`, in store representation.
    pub fn changes(&self, model: &Model<M>) -> Result<UpdateDocument, StorageError> {
        let (_, store_values) = self.store_values(model)?;
        self.tracker.diff_against(model, &store_values)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[instrument(skip(self, model), level = "debug", fields(collection = %self.collection))]
    pub async fn insert(&self, model: &Model<M>) -> Result<InsertOneResult, StorageError> {
        let (_, store_values) = self.store_values(model)?;
        let result = self
            .store
            .insert_one(&self.collection, store_values.clone())
            .await?;
        if !result.acknowledged {
            return Err(StorageError::Unacknowledged(format!(
                "insert into {}",
                self.collection
            )));
        }

        self.assign_identity(model, result.inserted_id)?;
        let stored = store_values.with(ID_FIELD, result.inserted_id);
        self.tracker.register(model, Some(&stored));
        debug!("Inserted {} into {}", result.inserted_id, self.collection);
        Ok(result)
    }

    #[instrument(skip(self, models), level = "debug", fields(collection = %self.collection, count = models.len()))]
    pub async fn insert_many(&self, models: &[Model<M>]) -> Result<InsertManyResult, StorageError> {
        let mut submitted = Vec::with_capacity(models.len());
        for model in models {
            let (_, store_values) = self.store_values(model)?;
            submitted.push(store_values);
        }

        let result = self
            .store
            .insert_many(&self.collection, submitted.clone())
            .await?;
        if !result.acknowledged {
            return Err(StorageError::Unacknowledged(format!(
                "batch insert of {} documents into {}",
                models.len(),
                self.collection
            )));
        }
        if result.inserted_ids.len() != models.len() {
            return Err(StorageError::Internal(format!(
                "store returned {} ids for {} documents",
                result.inserted_ids.len(),
                models.len()
            )));
        }

        for ((model, values), id) in models.iter().zip(submitted).zip(&result.inserted_ids) {
            let stored = values.with(ID_FIELD, *id);
            let native = self.converter.to_native_values(&stored)?;
            self.hydrator.hydrate(&native, &mut model.write())?;
            self.tracker.register(model, Some(&stored));
        }
        debug!(
            "Inserted {} documents into {}",
            result.inserted_ids.len(),
            self.collection
        );
        Ok(result)
    }

    /// Write the model's pending changes.
    ///
    /// Without `filter`, the document is matched by identity. Returns
    /// [`UpdateOutcome::Unchanged`] without calling the store when there is
    /// nothing to write.
    ///
    /// Appends and other modifications are sent as two sequential writes
    /// (appends first) because the store cannot combine them in one call.
    /// The two writes are not atomic together.
    #[instrument(skip(self, model, filter), level = "debug", fields(collection = %self.collection))]
    pub async fn update(
        &self,
        model: &Model<M>,
        filter: Option<Filter>,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome, StorageError> {
        let (native, store_values) = self.store_values(model)?;
        let mut filter = match filter {
            Some(filter) => filter,
            None => {
                let id = identity_of(&native).ok_or_else(|| {
                    StorageError::InvalidArgument(
                        "model has no identity: insert it or pass a filter".to_string(),
                    )
                })?;
                Filter::by_id(ID_FIELD, id)
            }
        };

        let version_path = FieldPath::parse(&self.options.version_field);
        let expected_version = if options.optimistic_lock {
            let version = native
                .get(&version_path)
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    StorageError::Precondition(format!(
                        "optimistic locking requires an integer {} field on the model",
                        version_path
                    ))
                })?;
            filter = filter.and_eq(version_path.clone(), version);
            Some(version)
        } else {
            None
        };

        let mut changes = self.tracker.diff_against(model, &store_values)?;
        if expected_version.is_some() {
            changes.assign.remove(&version_path);
            changes.remove.remove(&version_path);
        }
        if changes.is_empty() {
            debug!("No changes to write");
            return Ok(UpdateOutcome::Unchanged);
        }
        if expected_version.is_some() {
            changes.add_increment(version_path.clone(), 1);
        }

        let result = if changes.has_append() && changes.has_modifications() {
            let (appends, rest) = changes.split_append();
            let first = self.write(&filter, &appends, options).await?;
            if let Some(id) = first.upserted_id {
                filter = filter.and_eq(FieldPath::key(ID_FIELD), id);
            }
            let mut second = self.write(&filter, &rest, options).await?;
            second.upserted_id = second.upserted_id.or(first.upserted_id);
            second
        } else {
            self.write(&filter, &changes, options).await?
        };

        if let Some(version) = expected_version {
            let mut bumped = native;
            bumped.set(&version_path, Value::Int(version + 1))?;
            self.hydrator.hydrate(&bumped, &mut model.write())?;
        }
        if let Some(id) = result.upserted_id {
            if self.identity(model).is_none() {
                self.assign_identity(model, id)?;
            }
        }

        if result.matched_count == 0 && result.upserted_id.is_none() {
            debug!("No document matched; changes stay pending");
            return Ok(UpdateOutcome::Written(result));
        }
        let (_, baseline) = self.store_values(model)?;
        self.tracker.register(model, Some(&baseline));
        Ok(UpdateOutcome::Written(result))
    }

    /// Delete the model's document. The model keeps its baseline.
    #[instrument(skip(self, model), level = "debug", fields(collection = %self.collection))]
    pub async fn delete(&self, model: &Model<M>) -> Result<DeleteResult, StorageError> {
        let id = self.identity(model).ok_or_else(|| {
            StorageError::InvalidArgument("cannot delete a model without identity".to_string())
        })?;
        let result = self
            .store
            .delete_one(&self.collection, &Filter::by_id(ID_FIELD, id))
            .await?;
        if !result.acknowledged {
            return Err(StorageError::Unacknowledged(format!("delete of {}", id)));
        }
        debug!("Deleted {} ({} removed)", id, result.deleted_count);
        Ok(result)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[instrument(skip(self), level = "debug", fields(collection = %self.collection))]
    pub async fn find_one(&self, filter: &Filter) -> Result<Option<Model<M>>, StorageError> {
        match self.store.find_one(&self.collection, filter).await? {
            Some(raw) => Ok(Some(self.load(raw)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), level = "debug", fields(collection = %self.collection))]
    pub async fn find(&self, filter: &Filter) -> Result<Vec<Model<M>>, StorageError> {
        self.store
            .find(&self.collection, filter, None)
            .await?
            .into_iter()
            .map(|raw| self.load(raw))
            .collect()
    }

    pub async fn find_by_id(&self, id: ObjectId) -> Result<Option<Model<M>>, StorageError> {
        self.find_one(&Filter::by_id(ID_FIELD, id)).await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64, StorageError> {
        self.store.count(&self.collection, filter).await
    }

    // =========================================================================
    // Pessimistic locking
    // =========================================================================

    /// Run `callback` on the freshly loaded document while holding its lock.
    ///
    /// The lock is released on every exit path. Returns `None` when the
    /// document no longer exists. Without `timeout`, the manager's
    /// configured `lock_timeout` applies.
    pub async fn lock<'a, F, Fut, T>(
        &'a self,
        target: impl Into<LockTarget<M>>,
        blocking: bool,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<Option<T>, StorageError>
    where
        F: FnOnce(Model<M>, &'a Self) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let id = target.into().resolve()?;
        let lock = self.lock.as_deref().ok_or_else(|| {
            StorageError::Precondition("no pessimistic lock is configured".to_string())
        })?;

        let timeout = timeout.or(self.options.lock_timeout);
        let ticket = LockTicket::acquire(lock, id, blocking, timeout).await?;
        let outcome = match self.find_by_id(id).await? {
            Some(model) => Some(callback(model, self).await?),
            None => {
                debug!("Locked document {} no longer exists", id);
                None
            }
        };
        ticket.release()?;
        Ok(outcome)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Current native values and their store representation.
    fn store_values(&self, model: &Model<M>) -> Result<(ValueTree, ValueTree), StorageError> {
        let native = model.values();
        let previous = self.tracker.original_values(model)?;
        let store_values = self.converter.to_store_values(&native, previous.as_ref())?;
        Ok((native, store_values))
    }

    fn load(&self, raw: ValueTree) -> Result<Model<M>, StorageError> {
        let native = self.converter.to_native_values(&raw)?;
        let model = Model::new(self.hydrator.hydrate_new(&native)?);
        self.tracker.register(&model, Some(&raw));
        Ok(model)
    }

    fn assign_identity(&self, model: &Model<M>, id: ObjectId) -> Result<(), StorageError> {
        let values = ValueTree::new().with(ID_FIELD, id);
        self.hydrator.hydrate(&values, &mut model.write())
    }

    async fn write(
        &self,
        filter: &Filter,
        update: &UpdateDocument,
        options: UpdateOptions,
    ) -> Result<UpdateResult, StorageError> {
        let result = self
            .store
            .update_one(&self.collection, filter, update, options.upsert)
            .await?;
        if !result.acknowledged {
            return Err(StorageError::Unacknowledged(format!(
                "update of {} in {}",
                update.len(),
                self.collection
            )));
        }
        if options.optimistic_lock && result.modified_count == 0 && result.upserted_id.is_none() {
            return Err(StorageError::LockConflict(format!(
                "no document in {} matched {:?}",
                self.collection,
                filter.conditions().keys().map(ToString::to_string).collect::<Vec<_>>()
            )));
        }
        debug!(
            "Wrote {} operations (matched {}, modified {})",
            update.len(),
            result.matched_count,
            result.modified_count
        );
        Ok(result)
    }
}

impl<M: Document> std::fmt::Debug for DocumentManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentManager")
            .field("collection", &self.collection)
            .field("backend", &self.store.backend_name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
