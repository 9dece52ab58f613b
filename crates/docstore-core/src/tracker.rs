//! Snapshots of persisted values and the path-level diff against them.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use crate::error::StorageError;
use crate::model::{Document, Model};
use crate::path::FieldPath;
use crate::tree::ValueTree;
use crate::update::{Append, UpdateDocument};
use crate::value::{Kind, Value};

/// Flattened, immutable copy of a model's last persisted values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    leaves: BTreeMap<FieldPath, Value>,
}

impl Snapshot {
    pub fn capture(values: &ValueTree) -> Self {
        Self {
            leaves: values.flatten(),
        }
    }

    pub fn leaves(&self) -> &BTreeMap<FieldPath, Value> {
        &self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn to_tree(&self) -> Result<ValueTree, StorageError> {
        ValueTree::unflatten(&self.leaves)
    }
}

/// Compute the operations that turn `baseline` into `candidate`.
///
/// The top-level `identity_field` never takes part.
pub fn diff(baseline: &ValueTree, candidate: &ValueTree, identity_field: &str) -> UpdateDocument {
    let mut out = UpdateDocument::new();
    let keys: BTreeSet<&String> = baseline.keys().chain(candidate.keys()).collect();
    for key in keys {
        if key == identity_field {
            continue;
        }
        diff_node(
            FieldPath::key(key.clone()),
            baseline.as_map().get(key),
            candidate.as_map().get(key),
            &mut out,
        );
    }
    out
}

fn diff_node(path: FieldPath, base: Option<&Value>, cand: Option<&Value>, out: &mut UpdateDocument) {
    let base = base.filter(|v| !v.is_null());
    let cand = cand.filter(|v| !v.is_null());

    match (base, cand) {
        (None, None) => {}
        (Some(_), None) => {
            out.remove.insert(path);
        }
        (None, Some(c)) => add_new(path, c, out),
        (Some(b), Some(c)) if b.kind() != c.kind() => {
            out.assign.insert(path, c.clone());
        }
        (Some(Value::Document(bm)), Some(Value::Document(cm))) => {
            let keys: BTreeSet<&String> = bm.keys().chain(cm.keys()).collect();
            for key in keys {
                diff_node(path.child(key.clone()), bm.get(key), cm.get(key), out);
            }
        }
        (Some(Value::Array(bs)), Some(Value::Array(cs))) => {
            if cs.len() < bs.len() {
                // No positional delete keeps indices stable: rewrite the sequence.
                out.assign.insert(path, Value::Array(cs.clone()));
                return;
            }
            for (i, (b, c)) in bs.iter().zip(cs.iter()).enumerate() {
                if b == c {
                    continue;
                }
                if b.is_null() || c.is_null() {
                    out.assign.insert(path.at(i), c.clone());
                } else {
                    diff_node(path.at(i), Some(b), Some(c), out);
                }
            }
            if cs.len() > bs.len() {
                out.append.insert(
                    path,
                    Append {
                        start: bs.len(),
                        values: cs[bs.len()..].to_vec(),
                    },
                );
            }
        }
        (Some(b), Some(c)) => {
            if b != c {
                out.assign.insert(path, c.clone());
            }
        }
    }
}

fn add_new(path: FieldPath, value: &Value, out: &mut UpdateDocument) {
    match value {
        Value::Document(map) if !map.is_empty() => {
            for (key, child) in map {
                if !child.is_null() {
                    add_new(path.child(key.clone()), child, out);
                }
            }
        }
        Value::Array(items) if !items.is_empty() => {
            out.append.insert(
                path,
                Append {
                    start: 0,
                    values: items.clone(),
                },
            );
        }
        _ => {
            debug_assert!(value.kind() == Kind::Leaf || is_empty_container(value));
            out.assign.insert(path, value.clone());
        }
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Document(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

struct Entry {
    model: Weak<dyn Any + Send + Sync>,
    snapshot: Arc<Snapshot>,
}

impl Entry {
    /// The entry still belongs to the live model at `key`.
    fn is_live_for(&self, key: usize) -> bool {
        self.model.strong_count() > 0 && Weak::as_ptr(&self.model) as *const () as usize == key
    }
}

/// Keeps one snapshot per live model and diffs models against them.
///
/// Snapshots are held in a side table keyed by model handle identity with a
/// weak back-reference, so tracking never extends a model's lifetime. Entries
/// of dropped models are reclaimed on the next registration.
pub struct ChangeTracker {
    identity_field: String,
    entries: Mutex<HashMap<usize, Entry>>,
}

impl ChangeTracker {
    pub fn new(identity_field: impl Into<String>) -> Self {
        Self {
            identity_field: identity_field.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    /// Make `original` (or the model's current values) the diff baseline.
    pub fn register<M: Document>(&self, model: &Model<M>, original: Option<&ValueTree>) {
        let snapshot = match original {
            Some(values) => Snapshot::capture(values),
            None => Snapshot::capture(&model.values()),
        };
        let key = model.key();
        let leaves = snapshot.leaves().len();

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|k, entry| entry.is_live_for(*k));
        entries.insert(
            key,
            Entry {
                model: Arc::downgrade(&model.erased()),
                snapshot: Arc::new(snapshot),
            },
        );
        debug!("Registered snapshot for model {:#x} ({} leaves)", key, leaves);
    }

    /// Drop the model's snapshot.
    pub fn forget<M: Document>(&self, model: &Model<M>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&model.key());
    }

    pub fn is_registered<M: Document>(&self, model: &Model<M>) -> bool {
        self.snapshot(model).is_some()
    }

    /// The registered baseline, or `None` when the model was never registered.
    pub fn original_values<M: Document>(
        &self,
        model: &Model<M>,
    ) -> Result<Option<ValueTree>, StorageError> {
        self.snapshot(model).map(|s| s.to_tree()).transpose()
    }

    /// Diff the model's current values against its baseline.
    pub fn changes<M: Document>(&self, model: &Model<M>) -> Result<UpdateDocument, StorageError> {
        let current = model.values();
        self.diff_against(model, &current)
    }

    /// Diff `candidate` against the model's baseline (empty when unregistered).
    pub fn diff_against<M: Document>(
        &self,
        model: &Model<M>,
        candidate: &ValueTree,
    ) -> Result<UpdateDocument, StorageError> {
        let baseline = match self.snapshot(model) {
            Some(snapshot) => snapshot.to_tree()?,
            None => ValueTree::new(),
        };
        Ok(diff(&baseline, candidate, &self.identity_field))
    }

    /// Number of live snapshots, after reclaiming those of dropped models.
    pub fn tracked(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|k, entry| entry.is_live_for(*k));
        entries.len()
    }

    fn snapshot<M: Document>(&self, model: &Model<M>) -> Option<Arc<Snapshot>> {
        let key = model.key();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&key)
            .filter(|entry| entry.is_live_for(key))
            .map(|entry| Arc::clone(&entry.snapshot))
    }
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new(crate::ID_FIELD)
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("identity_field", &self.identity_field)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::model::GenericDocument;
    use serde_json::json;

    fn tree(json: serde_json::Value) -> ValueTree {
        ValueTree::from_json(&json).unwrap()
    }

    fn model(json: serde_json::Value) -> Model<GenericDocument> {
        Model::new(GenericDocument::new(tree(json)))
    }

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s)
    }

    #[test]
    fn test_unmodified_model_has_no_changes() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "name": "a", "tags": ["x"], "address": { "city": "Paris" } }));
        tracker.register(&m, None);
        assert!(tracker.changes(&m).unwrap().is_empty());

        // Registering the same values again is idempotent.
        tracker.register(&m, None);
        assert!(tracker.changes(&m).unwrap().is_empty());
    }

    #[test]
    fn test_set_then_clear_is_a_no_op() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "name": "a" }));
        tracker.register(&m, None);

        m.write().set("nickname", "b");
        m.write().set("nickname", Value::Null);
        assert!(tracker.changes(&m).unwrap().is_empty());
    }

    #[test]
    fn test_new_field_is_one_assign() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "name": "a" }));
        tracker.register(&m, None);

        m.write().set("email", "a@example.com");
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.assign[&p("email")], Value::from("a@example.com"));
    }

    #[test]
    fn test_append_to_empty_sequence_is_index_qualified() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "tags": [] }));
        tracker.register(&m, None);

        m.write().set("tags", vec!["x", "y"]);
        let changes = tracker.changes(&m).unwrap();
        assert!(changes.assign.is_empty());
        let appended: Vec<(String, Value)> = changes
            .indexed_appends()
            .map(|(path, v)| (path.to_string(), v.clone()))
            .collect();
        assert_eq!(
            appended,
            vec![
                ("tags.0".to_string(), Value::from("x")),
                ("tags.1".to_string(), Value::from("y"))
            ]
        );
    }

    #[test]
    fn test_append_to_existing_sequence_keeps_prefix() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "tags": ["a", "b"] }));
        tracker.register(&m, None);

        m.write().set("tags", vec!["a", "B", "c"]);
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.assign[&p("tags.1")], Value::from("B"));
        assert_eq!(changes.append[&p("tags")].start, 2);
        assert_eq!(changes.append[&p("tags")].values, vec![Value::from("c")]);
    }

    #[test]
    fn test_shrunk_sequence_is_rewritten() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "tags": ["a", "b", "c"] }));
        tracker.register(&m, None);

        m.write().set("tags", vec!["a"]);
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.assign[&p("tags")], Value::from(vec!["a"]));
    }

    #[test]
    fn test_remove_and_assign_are_kept_apart() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "aKey": "aVal" }));
        tracker.register(&m, None);

        m.write().set("aKey", Value::Null);
        m.write().set("anotherKey", "aVal");
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.assign[&p("anotherKey")], Value::from("aVal"));
        assert!(changes.remove.contains(&p("aKey")));
    }

    #[test]
    fn test_removed_subtree_is_one_remove() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "address": { "city": "Paris", "zip": "75001" } }));
        tracker.register(&m, None);

        m.write().set("address", Value::Null);
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes.remove.contains(&p("address")));
    }

    #[test]
    fn test_kind_change_assigns_whole_subtree() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "address": "10 Main St" }));
        tracker.register(&m, None);

        let new_address = tree(json!({ "street": "10 Main St", "city": "Springfield" }));
        m.write().set("address", new_address.clone().into_value());
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.assign[&p("address")], new_address.into_value());
        assert!(!changes.assign.contains_key(&p("address.city")));
    }

    #[test]
    fn test_sequence_to_mapping_is_a_kind_change() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "slot": [1, 2] }));
        tracker.register(&m, None);

        m.write().set("slot", tree(json!({ "0": 1 })).into_value());
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes.assign.contains_key(&p("slot")));
    }

    #[test]
    fn test_nested_leaf_change_is_path_level() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "address": { "city": "Paris", "zip": "75001" } }));
        tracker.register(&m, None);

        m.write()
            .set("address", tree(json!({ "city": "Lyon", "zip": "75001" })).into_value());
        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.assign[&p("address.city")], Value::from("Lyon"));
    }

    #[test]
    fn test_identity_never_diffed() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "name": "a" }));
        m.write().set("_id", ObjectId::new());
        tracker.register(&m, None);

        m.write().set("_id", ObjectId::new());
        assert!(tracker.changes(&m).unwrap().is_empty());

        m.write().set("_id", Value::Null);
        assert!(tracker.changes(&m).unwrap().is_empty());

        let fresh = model(json!({ "name": "b" }));
        fresh.write().set("_id", ObjectId::new());
        let changes = tracker.changes(&fresh).unwrap();
        assert!(changes.paths().all(|path| path != &p("_id")));
    }

    #[test]
    fn test_unregistered_model_is_all_new() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "name": "a", "tags": ["x"], "address": { "city": "Paris" } }));
        assert!(tracker.original_values(&m).unwrap().is_none());

        let changes = tracker.changes(&m).unwrap();
        assert_eq!(changes.assign[&p("name")], Value::from("a"));
        assert_eq!(changes.assign[&p("address.city")], Value::from("Paris"));
        assert_eq!(changes.append[&p("tags")].start, 0);
        assert!(changes.remove.is_empty());
    }

    #[test]
    fn test_original_values_reflect_registered_raw_values() {
        let tracker = ChangeTracker::default();
        let m = model(json!({ "name": "native" }));
        let raw = tree(json!({ "name": "stored", "tags": [] }));
        tracker.register(&m, Some(&raw));
        assert_eq!(tracker.original_values(&m).unwrap(), Some(raw));
    }

    #[test]
    fn test_snapshots_are_per_handle_and_reclaimed() {
        let tracker = ChangeTracker::default();
        let a = model(json!({ "name": "a" }));
        let b = model(json!({ "name": "a" }));
        tracker.register(&a, None);
        assert!(tracker.is_registered(&a));
        assert!(tracker.is_registered(&a.clone()));
        assert!(!tracker.is_registered(&b));

        tracker.register(&b, None);
        assert_eq!(tracker.tracked(), 2);
        drop(a);
        assert_eq!(tracker.tracked(), 1);

        tracker.forget(&b);
        assert_eq!(tracker.tracked(), 0);
    }
}
