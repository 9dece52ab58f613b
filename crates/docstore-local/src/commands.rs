use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use docstore_core::{
    diff, DocumentManager, FieldPath, GenericDocument, ManagerOptions, Model, ObjectId,
    StorageError, TreeHydrator, UpdateDocument, UpdateOptions, UpdateOutcome, ValueTree, ID_FIELD,
};
use serde_json::{json, Value as Json};
use tracing::info;

use crate::config::{Command, Config};
use crate::lock::FileLock;
use crate::storage::LocalStore;

/// Executes CLI commands against a local store.
pub struct App {
    store: Arc<LocalStore>,
    lock: Arc<FileLock>,
    options: ManagerOptions,
}

impl App {
    pub fn new(store: Arc<LocalStore>, lock: Arc<FileLock>, options: ManagerOptions) -> Self {
        Self {
            store,
            lock,
            options,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(LocalStore::new(config.effective_data_dir())),
            Arc::new(FileLock::new(config.effective_lock_dir())),
            ManagerOptions {
                version_field: config.version_field.clone(),
                lock_timeout: Some(config.lock_timeout()),
            },
        )
    }

    fn manager(&self, collection: &str) -> DocumentManager<GenericDocument> {
        DocumentManager::new(collection, self.store.clone(), Arc::new(TreeHydrator))
            .with_lock(self.lock.clone())
            .with_options(self.options.clone())
    }

    /// Run `command` and return what it prints.
    pub async fn execute(&self, command: &Command) -> anyhow::Result<Json> {
        match command {
            Command::Diff { before, after } => diff_files(before, after).await,

            Command::Insert {
                collection,
                document,
            } => {
                let manager = self.manager(collection);
                let model = Model::new(GenericDocument::new(read_document(document).await?));
                let result = manager.insert(&model).await?;
                info!("Inserted {} into {}", result.inserted_id, collection);
                Ok(json!({ "inserted_id": result.inserted_id.to_hex() }))
            }

            Command::Get { collection, id } => {
                let manager = self.manager(collection);
                let model = load(&manager, id).await?;
                let document = model.read().fields.to_json();
                Ok(document)
            }

            Command::Update {
                collection,
                id,
                document,
                optimistic,
            } => {
                let manager = self.manager(collection);
                let replacement = read_document(document).await?;
                let model = load(&manager, id).await?;
                replace_values(&model, replacement, &self.options.version_field)?;

                let changes = manager.changes(&model)?;
                let options = UpdateOptions {
                    optimistic_lock: *optimistic,
                    ..Default::default()
                };
                let outcome = manager.update(&model, None, options).await?;
                Ok(outcome_json(&changes, &outcome))
            }

            Command::Delete { collection, id } => {
                let manager = self.manager(collection);
                let model = load(&manager, id).await?;
                let result = manager.delete(&model).await?;
                info!("Deleted {} from {}", id, collection);
                Ok(serde_json::to_value(result)?)
            }

            Command::Lock {
                collection,
                id,
                document,
                no_wait,
            } => {
                let manager = self.manager(collection);
                let replacement = read_document(document).await?;
                let version_field = self.options.version_field.clone();

                let outcome = manager
                    .lock(id.as_str(), !*no_wait, None, |model, manager| async move {
                        replace_values(&model, replacement, &version_field)?;
                        let changes = manager.changes(&model)?;
                        let outcome = manager
                            .update(&model, None, UpdateOptions::default())
                            .await?;
                        Ok::<_, StorageError>(outcome_json(&changes, &outcome))
                    })
                    .await?;
                outcome.ok_or_else(|| anyhow!("document {} not found in {}", id, collection))
            }
        }
    }
}

/// The update that turns the document in `before` into the one in `after`.
pub async fn diff_files(before: &Path, after: &Path) -> anyhow::Result<Json> {
    let before = read_document(before).await?;
    let after = read_document(after).await?;
    Ok(diff(&before, &after, ID_FIELD).to_json())
}

async fn read_document(path: &Path) -> anyhow::Result<ValueTree> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let json: Json = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(ValueTree::from_json(&json)?)
}

async fn load(
    manager: &DocumentManager<GenericDocument>,
    id: &str,
) -> anyhow::Result<Model<GenericDocument>> {
    let id = ObjectId::parse_str(id)?;
    manager
        .find_by_id(id)
        .await?
        .ok_or_else(|| anyhow!("document {} not found in {}", id, manager.collection()))
}

/// Replace the model's values, keeping its identity and, unless the
/// replacement carries one, its version.
fn replace_values(
    model: &Model<GenericDocument>,
    replacement: ValueTree,
    version_field: &str,
) -> Result<(), StorageError> {
    let version_path = FieldPath::parse(version_field);
    let mut document = model.write();
    let mut fields = replacement;
    if let Some(id) = document.get(ID_FIELD).cloned() {
        fields = fields.with(ID_FIELD, id);
    }
    if !fields.contains(&version_path) {
        if let Some(version) = document.fields.get(&version_path).cloned() {
            fields.set(&version_path, version)?;
        }
    }
    document.fields = fields;
    Ok(())
}

fn outcome_json(changes: &UpdateDocument, outcome: &UpdateOutcome) -> Json {
    match outcome {
        UpdateOutcome::Unchanged => json!({ "changed": false }),
        UpdateOutcome::Written(result) => json!({
            "changed": true,
            "changes": changes.to_json(),
            "matched_count": result.matched_count,
            "modified_count": result.modified_count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore_core::PessimisticLock;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup() -> (App, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let app = App::new(
            Arc::new(LocalStore::new(temp_dir.path().join("data"))),
            Arc::new(FileLock::new(temp_dir.path().join("locks"))),
            ManagerOptions {
                lock_timeout: Some(std::time::Duration::from_millis(100)),
                ..Default::default()
            },
        );
        (app, temp_dir)
    }

    fn write_json(dir: &TempDir, name: &str, value: Json) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    async fn insert(app: &App, dir: &TempDir, value: Json) -> String {
        let document = write_json(dir, "insert.json", value);
        let out = app
            .execute(&Command::Insert {
                collection: "users".to_string(),
                document,
            })
            .await
            .unwrap();
        out["inserted_id"].as_str().unwrap().to_string()
    }

    async fn get(app: &App, id: &str) -> anyhow::Result<Json> {
        app.execute(&Command::Get {
            collection: "users".to_string(),
            id: id.to_string(),
        })
        .await
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (app, temp) = setup();
        let id = insert(&app, &temp, json!({ "name": "ada", "version": 1 })).await;

        let doc = get(&app, &id).await.unwrap();
        assert_eq!(doc["name"], "ada");
        assert_eq!(doc[ID_FIELD]["$oid"], id);
    }

    #[tokio::test]
    async fn test_update_writes_only_changes() {
        let (app, temp) = setup();
        let id = insert(&app, &temp, json!({ "name": "ada", "tags": ["a"], "version": 1 })).await;

        let document = write_json(
            &temp,
            "update.json",
            json!({ "name": "ada", "tags": ["a", "b"], "email": "ada@example.com" }),
        );
        let out = app
            .execute(&Command::Update {
                collection: "users".to_string(),
                id: id.clone(),
                document: document.clone(),
                optimistic: true,
            })
            .await
            .unwrap();
        assert_eq!(out["changed"], true);
        assert_eq!(
            out["changes"],
            json!({
                "$set": { "email": "ada@example.com" },
                "$push": { "tags": { "$each": ["b"] } },
            })
        );

        let doc = get(&app, &id).await.unwrap();
        assert_eq!(doc["tags"], json!(["a", "b"]));
        assert_eq!(doc["version"], 2);

        // Same values again: nothing to write.
        let out = app
            .execute(&Command::Update {
                collection: "users".to_string(),
                id,
                document,
                optimistic: false,
            })
            .await
            .unwrap();
        assert_eq!(out, json!({ "changed": false }));
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let (app, temp) = setup();
        let id = insert(&app, &temp, json!({ "name": "ada", "version": 3 })).await;

        let document = write_json(&temp, "stale.json", json!({ "name": "b", "version": 2 }));
        let err = app
            .execute(&Command::Update {
                collection: "users".to_string(),
                id: id.clone(),
                document,
                optimistic: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::LockConflict(_))
        ));
        assert_eq!(get(&app, &id).await.unwrap()["name"], "ada");
    }

    #[tokio::test]
    async fn test_lock_command() {
        let (app, temp) = setup();
        let id = insert(&app, &temp, json!({ "name": "ada" })).await;
        let document = write_json(&temp, "locked.json", json!({ "name": "locked" }));
        let command = Command::Lock {
            collection: "users".to_string(),
            id: id.clone(),
            document,
            no_wait: true,
        };

        // Held by another lock manager on the same directory.
        let other = FileLock::new(temp.path().join("locks"));
        let oid = ObjectId::parse_str(&id).unwrap();
        other.lock(&oid, false, None).await.unwrap();
        let err = app.execute(&command).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::LockTimeout(_))
        ));
        other.unlock(&oid).unwrap();

        let out = app.execute(&command).await.unwrap();
        assert_eq!(out["changed"], true);
        assert_eq!(get(&app, &id).await.unwrap()["name"], "locked");

        // Released afterwards.
        other.lock(&oid, false, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete() {
        let (app, temp) = setup();
        let id = insert(&app, &temp, json!({ "name": "ada" })).await;

        let out = app
            .execute(&Command::Delete {
                collection: "users".to_string(),
                id: id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(out["deleted_count"], 1);
        assert!(get(&app, &id).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_id() {
        let (app, _temp) = setup();
        let err = get(&app, "xyz").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::UnsupportedIdentity(_))
        ));
    }

    #[tokio::test]
    async fn test_diff_files() {
        let temp = TempDir::new().unwrap();
        let before = write_json(&temp, "before.json", json!({ "aKey": "aVal" }));
        let after = write_json(
            &temp,
            "after.json",
            json!({ "aKey": null, "anotherKey": "aVal" }),
        );

        let out = diff_files(&before, &after).await.unwrap();
        assert_eq!(
            out,
            json!({ "$set": { "anotherKey": "aVal" }, "$unset": { "aKey": "" } })
        );
    }
}
