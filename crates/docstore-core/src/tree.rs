use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StorageError;
use crate::path::{FieldPath, Segment};
use crate::value::{Map, Value};

/// A document: an ordered mapping at the root, addressable by [`FieldPath`].
///
/// Mapping members never hold [`Value::Null`]; assigning null removes the
/// member instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueTree {
    root: Map,
}

impl ValueTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a mapping, dropping null members.
    pub fn from_map(map: Map) -> Self {
        match Value::Document(map).normalized() {
            Value::Document(root) => Self { root },
            _ => Self::default(),
        }
    }

    /// Builder-style assignment of a top-level key.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        match value.into().normalized() {
            Value::Null => {
                self.root.remove(key);
            }
            value => {
                self.root.insert(key.to_string(), value);
            }
        }
        self
    }

    pub fn as_map(&self) -> &Map {
        &self.root
    }

    pub fn into_map(self) -> Map {
        self.root
    }

    pub fn into_value(self) -> Value {
        Value::Document(self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.root.keys()
    }

    /// Look up a node. Index segments address mapping keys of the same spelling.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut node = self.root.get(first.as_key().as_ref())?;
        for segment in rest {
            node = match (node, segment) {
                (Value::Document(map), seg) => map.get(seg.as_key().as_ref())?,
                (Value::Array(items), Segment::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        self.get(path).is_some_and(|v| !v.is_null())
    }

    /// Assign `value` at `path`, creating missing intermediate nodes.
    ///
    /// Missing intermediates become sequences when the next segment is an
    /// index and mappings otherwise. Assigning past the end of a sequence pads
    /// it with nulls. Assigning null to a mapping member removes it.
    pub fn set(&mut self, path: &FieldPath, value: Value) -> Result<(), StorageError> {
        let value = value.normalized();
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return match value {
                Value::Document(root) => {
                    self.root = root;
                    Ok(())
                }
                other => Err(StorageError::InvalidArgument(format!(
                    "cannot replace document root with {:?}",
                    other.kind()
                ))),
            };
        };

        if value.is_null() && (parents.is_empty() || !matches!(last, Segment::Index(_))) {
            self.remove(path);
            return Ok(());
        }

        let mut node = Self::root_entry(&mut self.root, segments)?;
        for (i, segment) in parents.iter().enumerate().skip(1) {
            node = Self::descend(node, segment, &segments[i + 1], path)?;
        }
        if parents.is_empty() {
            // `node` is the root member itself.
            *node = value;
            return Ok(());
        }
        Self::assign_child(node, last, value, path)
    }

    /// Remove the node at `path`, returning it. Removing a sequence element
    /// shifts later elements down.
    pub fn remove(&mut self, path: &FieldPath) -> Option<Value> {
        let (last, parents) = path.segments().split_last()?;
        if parents.is_empty() {
            return self.root.remove(last.as_key().as_ref());
        }
        let (first, rest) = parents.split_first()?;
        let mut node = self.root.get_mut(first.as_key().as_ref())?;
        for segment in rest {
            node = match (node, segment) {
                (Value::Document(map), seg) => map.get_mut(seg.as_key().as_ref())?,
                (Value::Array(items), Segment::Index(i)) => items.get_mut(*i)?,
                _ => return None,
            };
        }
        match (node, last) {
            (Value::Document(map), seg) => map.remove(seg.as_key().as_ref()),
            (Value::Array(items), Segment::Index(i)) if *i < items.len() => Some(items.remove(*i)),
            _ => None,
        }
    }

    /// Flatten into leaf paths. Empty mappings and sequences are leaves so
    /// the container kind survives flattening; null sequence elements are
    /// kept so positions do too.
    pub fn flatten(&self) -> BTreeMap<FieldPath, Value> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.root {
            flatten_into(FieldPath::key(key.clone()), value, &mut out);
        }
        out
    }

    /// Rebuild a tree from [`ValueTree::flatten`] output.
    pub fn unflatten(leaves: &BTreeMap<FieldPath, Value>) -> Result<Self, StorageError> {
        let mut tree = Self::new();
        for (path, value) in leaves {
            tree.set(path, value.clone())?;
        }
        Ok(tree)
    }

    /// Render as extended JSON.
    pub fn to_json(&self) -> serde_json::Value {
        Value::Document(self.root.clone()).to_json()
    }

    /// Parse an extended-JSON object.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, StorageError> {
        match Value::from_json(json)? {
            Value::Document(map) => Ok(Self::from_map(map)),
            other => Err(StorageError::Serialization(format!(
                "expected a JSON object, got {:?}",
                other.kind()
            ))),
        }
    }

    fn root_entry<'a>(
        root: &'a mut Map,
        segments: &[Segment],
    ) -> Result<&'a mut Value, StorageError> {
        let first = segments[0].as_key().into_owned();
        let entry = root.entry(first).or_insert(Value::Null);
        if entry.is_null() && segments.len() > 1 {
            *entry = empty_container_for(&segments[1]);
        }
        Ok(entry)
    }

    fn descend<'a>(
        node: &'a mut Value,
        segment: &Segment,
        next: &Segment,
        path: &FieldPath,
    ) -> Result<&'a mut Value, StorageError> {
        let child = match (node, segment) {
            (Value::Document(map), seg) => map
                .entry(seg.as_key().into_owned())
                .or_insert(Value::Null),
            (Value::Array(items), Segment::Index(i)) => {
                if *i >= items.len() {
                    items.resize(*i + 1, Value::Null);
                }
                &mut items[*i]
            }
            (other, _) => {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot traverse {:?} node while assigning {}",
                    other.kind(),
                    path
                )))
            }
        };
        if child.is_null() {
            *child = empty_container_for(next);
        }
        Ok(child)
    }

    fn assign_child(
        node: &mut Value,
        last: &Segment,
        value: Value,
        path: &FieldPath,
    ) -> Result<(), StorageError> {
        match (node, last) {
            (Value::Document(map), seg) => {
                map.insert(seg.as_key().into_owned(), value);
                Ok(())
            }
            (Value::Array(items), Segment::Index(i)) => {
                if *i >= items.len() {
                    items.resize(*i + 1, Value::Null);
                }
                items[*i] = value;
                Ok(())
            }
            (other, _) => Err(StorageError::InvalidArgument(format!(
                "cannot assign {} inside a {:?} node",
                path,
                other.kind()
            ))),
        }
    }
}

fn empty_container_for(next: &Segment) -> Value {
    match next {
        Segment::Index(_) => Value::Array(Vec::new()),
        Segment::Key(_) => Value::Document(Map::new()),
    }
}

fn flatten_into(path: FieldPath, value: &Value, out: &mut BTreeMap<FieldPath, Value>) {
    match value {
        Value::Document(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(path.child(key.clone()), child, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(path.at(i), child, out);
            }
        }
        leaf => {
            out.insert(path, leaf.clone());
        }
    }
}

impl From<Map> for ValueTree {
    fn from(map: Map) -> Self {
        Self::from_map(map)
    }
}

impl Serialize for ValueTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ValueTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        ValueTree::from_json(&json).map_err(serde::de::Error::custom)
    }
}
