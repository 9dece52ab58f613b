use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map as JsonMap, Value as Json};

use crate::path::FieldPath;
use crate::value::Value;

/// New trailing elements of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Append {
    /// Index the first new element lands at.
    pub start: usize,
    pub values: Vec<Value>,
}

/// Field-level operations that bring a stored document in sync with a model.
///
/// The groupings are disjoint: a path appears in at most one of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDocument {
    pub assign: BTreeMap<FieldPath, Value>,
    pub remove: BTreeSet<FieldPath>,
    pub append: BTreeMap<FieldPath, Append>,
    pub increment: BTreeMap<FieldPath, i64>,
}

impl UpdateDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// No operation at all: no write is required.
    pub fn is_empty(&self) -> bool {
        self.assign.is_empty()
            && self.remove.is_empty()
            && self.append.is_empty()
            && self.increment.is_empty()
    }

    pub fn has_append(&self) -> bool {
        !self.append.is_empty()
    }

    /// Whether anything other than appends is present.
    pub fn has_modifications(&self) -> bool {
        !self.assign.is_empty() || !self.remove.is_empty() || !self.increment.is_empty()
    }

    /// Number of individual operations (each appended element counts once).
    pub fn len(&self) -> usize {
        self.assign.len()
            + self.remove.len()
            + self.increment.len()
            + self.append.values().map(|a| a.values.len()).sum::<usize>()
    }

    /// Add `delta` to the increment for `path`, merging with an existing one.
    pub fn add_increment(&mut self, path: FieldPath, delta: i64) {
        *self.increment.entry(path).or_insert(0) += delta;
    }

    /// Split into `(appends, everything else)`.
    pub fn split_append(self) -> (UpdateDocument, UpdateDocument) {
        let appends = UpdateDocument {
            append: self.append,
            ..Default::default()
        };
        let rest = UpdateDocument {
            assign: self.assign,
            remove: self.remove,
            increment: self.increment,
            append: BTreeMap::new(),
        };
        (appends, rest)
    }

    /// Appends rendered as index-qualified assignments (`tags.0`, `tags.1`, ...).
    pub fn indexed_appends(&self) -> impl Iterator<Item = (FieldPath, &Value)> + '_ {
        self.append.iter().flat_map(|(path, append)| {
            append
                .values
                .iter()
                .enumerate()
                .map(move |(offset, value)| (path.at(append.start + offset), value))
        })
    }

    /// Every path touched by any grouping.
    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> + '_ {
        self.assign
            .keys()
            .chain(self.remove.iter())
            .chain(self.append.keys())
            .chain(self.increment.keys())
    }

    /// Render with the conventional operator names
    /// (`$set`, `$unset`, `$push` with `$each`, `$inc`).
    pub fn to_json(&self) -> Json {
        let mut out = JsonMap::new();
        if !self.assign.is_empty() {
            out.insert(
                "$set".into(),
                Json::Object(
                    self.assign
                        .iter()
                        .map(|(p, v)| (p.to_string(), v.to_json()))
                        .collect(),
                ),
            );
        }
        if !self.remove.is_empty() {
            out.insert(
                "$unset".into(),
                Json::Object(
                    self.remove
                        .iter()
                        .map(|p| (p.to_string(), json!("")))
                        .collect(),
                ),
            );
        }
        if !self.append.is_empty() {
            out.insert(
                "$push".into(),
                Json::Object(
                    self.append
                        .iter()
                        .map(|(p, a)| {
                            let each: Vec<Json> = a.values.iter().map(Value::to_json).collect();
                            (p.to_string(), json!({ "$each": each }))
                        })
                        .collect(),
                ),
            );
        }
        if !self.increment.is_empty() {
            out.insert(
                "$inc".into(),
                Json::Object(
                    self.increment
                        .iter()
                        .map(|(p, d)| (p.to_string(), json!(d)))
                        .collect(),
                ),
            );
        }
        Json::Object(out)
    }
}
