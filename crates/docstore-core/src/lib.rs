//! Change tracking and minimal update generation for document stores.
//!
//! This crate defines the pieces shared by every store backend:
//! - `ChangeTracker`: per-model baselines and the recursive diff into an `UpdateDocument`
//! - `DocumentStore`: the store contract (insert, filtered update, delete, find)
//! - `PessimisticLock`: identity-keyed mutual exclusion with a scoped `LockTicket`
//! - `DocumentManager`: the façade that loads models, writes their diffs and
//!   coordinates optimistic and pessimistic locking
//!
//! `MemoryStore` and `MemoryLock` are in-process implementations of the two
//! backend traits.

mod collection;
mod error;
mod id;
mod lock;
mod manager;
mod memory;
mod model;
mod path;
mod store;
mod tracker;
mod tree;
mod update;
mod value;

pub use collection::{apply, validate, Collection};
pub use error::StorageError;
pub use id::ObjectId;
pub use lock::{poll_acquire, LockTicket, MemoryLock, PessimisticLock};
pub use manager::{
    DocumentManager, LockTarget, ManagerOptions, UpdateOptions, UpdateOutcome,
    DEFAULT_VERSION_FIELD,
};
pub use memory::MemoryStore;
pub use model::{
    Document, GenericDocument, Hydrator, Model, PassthroughConverter, TreeHydrator,
    ValueConverter,
};
pub use path::{FieldPath, Segment};
pub use store::{
    DeleteResult, DocumentStore, Filter, InsertManyResult, InsertOneResult, UpdateResult,
};
pub use tracker::{diff, ChangeTracker, Snapshot};
pub use tree::ValueTree;
pub use update::{Append, UpdateDocument};
pub use value::{Kind, Map, Value};

/// Name of the identity field every stored document carries.
pub const ID_FIELD: &str = "_id";
