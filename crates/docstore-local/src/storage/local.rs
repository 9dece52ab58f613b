use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use docstore_core::{
    Collection, DeleteResult, DocumentStore, Filter, InsertManyResult, InsertOneResult,
    StorageError, UpdateDocument, UpdateResult, ValueTree,
};
use fs2::FileExt;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Local filesystem document store.
///
/// Each collection is one extended-JSON array:
/// ```text
/// {base_dir}/
///   {collection}.json
///   {collection}.lock
/// ```
/// Writes replace the file atomically (temp file + rename). Writers are
/// serialized per collection, within the process by an async mutex and across
/// processes by an exclusive lock on `{collection}.lock`.
#[derive(Debug)]
pub struct LocalStore {
    base_dir: PathBuf,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalStore {
    /// Create a new LocalStore with the given base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            writers: DashMap::new(),
        }
    }

    /// Get the path to a collection file.
    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", collection))
    }

    fn check_name(collection: &str) -> Result<(), StorageError> {
        let valid = !collection.is_empty()
            && !collection.starts_with('.')
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(())
        } else {
            Err(StorageError::InvalidArgument(format!(
                "invalid collection name: {:?}",
                collection
            )))
        }
    }

    async fn ensure_base_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create data dir {}: {}",
                self.base_dir.display(),
                e
            ))
        })
    }

    /// Load a collection; a missing file is an empty collection.
    async fn load(&self, collection: &str) -> Result<Collection, StorageError> {
        let path = self.collection_path(collection);
        match fs::read_to_string(&path).await {
            Ok(json) => {
                let documents: Vec<ValueTree> = serde_json::from_str(&json).map_err(|e| {
                    StorageError::Serialization(format!(
                        "Failed to parse {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Collection::from_documents(documents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Collection::new()),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save(&self, collection: &str, documents: &Collection) -> Result<(), StorageError> {
        let path = self.collection_path(collection);
        let json = serde_json::to_string_pretty(documents.documents()).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize {}: {}", collection, e))
        })?;

        // Write atomically via temp file
        let temp_path = self.base_dir.join(format!(
            "{}.{}.json.tmp",
            collection,
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&temp_path, &json).await.map_err(|e| {
            StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StorageError::Io(format!("Failed to rename to {}: {}", path.display(), e))
        })?;

        debug!("Saved {} documents to {}", documents.len(), path.display());
        Ok(())
    }

    /// Take the cross-process writer lock of a collection.
    async fn lock_file(&self, collection: &str) -> Result<std::fs::File, StorageError> {
        let path = self.base_dir.join(format!("{}.lock", collection));
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| {
                    StorageError::Io(format!("Failed to open {}: {}", path.display(), e))
                })?;
            file.lock_exclusive().map_err(|e| {
                StorageError::Io(format!("Failed to lock {}: {}", path.display(), e))
            })?;
            Ok(file)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("Lock task failed: {}", e)))?
    }

    async fn read<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&Collection) -> T + Send,
    ) -> Result<T, StorageError> {
        Self::check_name(collection)?;
        let documents = self.load(collection).await?;
        Ok(f(&documents))
    }

    /// Load, modify and save a collection while holding its writer locks.
    async fn modify<T: Send>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> Result<T, StorageError> + Send,
    ) -> Result<T, StorageError> {
        Self::check_name(collection)?;
        self.ensure_base_dir().await?;

        let writer = self.writers.entry(collection.to_string()).or_default().clone();
        let _guard = writer.lock().await;
        let _file_lock = self.lock_file(collection).await?;

        let mut documents = self.load(collection).await?;
        let result = f(&mut documents)?;
        self.save(collection, &documents).await?;
        Ok(result)
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, document), level = "debug")]
    async fn insert_one(
        &self,
        collection: &str,
        document: ValueTree,
    ) -> Result<InsertOneResult, StorageError> {
        let inserted_id = self.modify(collection, |c| c.insert(document)).await?;
        debug!("Inserted {} into {}", inserted_id, collection);
        Ok(InsertOneResult {
            acknowledged: true,
            inserted_id,
        })
    }

    #[instrument(skip(self, documents), level = "debug", fields(count = documents.len()))]
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<ValueTree>,
    ) -> Result<InsertManyResult, StorageError> {
        let inserted_ids = self.modify(collection, |c| c.insert_many(documents)).await?;
        Ok(InsertManyResult {
            acknowledged: true,
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
        self.modify(collection, |c| c.update_one(filter, update, upsert))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<DeleteResult, StorageError> {
        let deleted_count = self.modify(collection, |c| Ok(c.delete_one(filter))).await?;
        Ok(DeleteResult {
            acknowledged: true,
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
        self.read(collection, |c| c.find(filter, limit)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        self.read(collection, |c| c.count(filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore_core::{FieldPath, Value, ID_FIELD};
    use tempfile::TempDir;

    fn setup() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let (store, _temp) = setup();
        let id = store
            .insert_one("users", ValueTree::new().with("name", "ada"))
            .await
            .unwrap()
            .inserted_id;

        let found = store
            .find_one("users", &Filter::by_id(ID_FIELD, id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.as_map()["name"], Value::from("ada"));
        assert_eq!(store.count("users", &Filter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty() {
        let (store, _temp) = setup();
        assert!(store.find("nothing", &Filter::all(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let (store, temp) = setup();
        let document = mixed_document();
        let id = store.insert_one("events", document.clone()).await.unwrap().inserted_id;
        drop(store);

        let reopened = LocalStore::new(temp.path());
        let found = reopened
            .find_one("events", &Filter::by_id(ID_FIELD, id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, document.with(ID_FIELD, id));
    }

    /// A document using ids, binary, nesting and sequences with nulls.
    fn mixed_document() -> ValueTree {
        ValueTree::new()
            .with("ref", docstore_core::ObjectId::new())
            .with("blob", Value::Binary(vec![0, 1, 254, 255]))
            .with("nested", ValueTree::new().with("n", 1).with("f", 1.5).into_map())
            .with("list", vec![Value::from("a"), Value::Null, Value::from(true)])
    }

    #[tokio::test]
    async fn test_file_layout() {
        let (store, temp) = setup();
        store
            .insert_one("users", ValueTree::new().with("name", "ada"))
            .await
            .unwrap();

        let path = temp.path().join("users.json");
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[0]["name"], "ada");
        assert!(json[0][ID_FIELD]["$oid"].is_string());

        // No temp files left behind
        let leftovers = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        let (store, _temp) = setup();
        for name in ["", "../escape", ".hidden", "a/b"] {
            let err = store
                .insert_one(name, ValueTree::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidArgument(_)), "{:?}", name);
        }
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_file_untouched() {
        let (store, temp) = setup();
        let id = store
            .insert_one("users", ValueTree::new().with("name", "ada"))
            .await
            .unwrap()
            .inserted_id;
        let before = std::fs::read_to_string(temp.path().join("users.json")).unwrap();

        let mut update = UpdateDocument::new();
        update.assign.insert(FieldPath::key(ID_FIELD), docstore_core::ObjectId::new().into());
        assert!(store
            .update_one("users", &Filter::by_id(ID_FIELD, id), &update, false)
            .await
            .is_err());

        let after = std::fs::read_to_string(temp.path().join("users.json")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let (store, _temp) = setup();
        let store = Arc::new(store);
        let id = store
            .insert_one("counters", ValueTree::new().with("n", 0))
            .await
            .unwrap()
            .inserted_id;

        const NUM_TASKS: usize = 10;
        let tasks = (0..NUM_TASKS).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut update = UpdateDocument::new();
                update.add_increment(FieldPath::key("n"), 1);
                store
                    .update_one("counters", &Filter::by_id(ID_FIELD, id), &update, false)
                    .await
            })
        });
        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap().modified_count, 1);
        }

        let doc = store
            .find_one("counters", &Filter::by_id(ID_FIELD, id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.as_map()["n"], Value::Int(NUM_TASKS as i64));
    }
}
