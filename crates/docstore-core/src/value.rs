use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as Json};

use crate::error::StorageError;
use crate::id::ObjectId;

/// Ordered mapping node.
pub type Map = BTreeMap<String, Value>;

/// A node of a document.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    ObjectId(ObjectId),
    Binary(Vec<u8>),
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
    Document(Map),
}

/// Structural kind of a node, used to decide whether a diff may recurse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Leaf,
    Sequence,
    Mapping,
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Array(_) => Kind::Sequence,
            Value::Document(_) => Kind::Mapping,
            _ => Kind::Leaf,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Map> {
        match self {
            Value::Document(map) => Some(map),
            _ => None,
        }
    }

    /// Drop null members of every mapping, recursively.
    ///
    /// Sequence elements keep their nulls so positions stay stable.
    pub fn normalized(self) -> Value {
        match self {
            Value::Document(map) => Value::Document(
                map.into_iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k, v.normalized()))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(Value::normalized).collect()),
            other => other,
        }
    }

    /// Render as extended JSON.
    ///
    /// Boundary types are wrapped: `{"$oid": hex}`, `{"$binary": hex}`,
    /// `{"$date": rfc3339}`.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::String(s) => Json::String(s.clone()),
            Value::ObjectId(id) => json!({ "$oid": id.to_hex() }),
            Value::Binary(bytes) => json!({ "$binary": hex::encode(bytes) }),
            Value::DateTime(dt) => json!({ "$date": dt.to_rfc3339() }),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Document(map) => Json::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Parse extended JSON produced by [`Value::to_json`].
    pub fn from_json(json: &Json) -> Result<Value, StorageError> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().ok_or_else(|| {
                    StorageError::Serialization(format!("unrepresentable number {}", n))
                })?),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Json::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(special) = Self::from_extended(obj)? {
                        return Ok(special);
                    }
                }
                let mut map = Map::new();
                for (k, v) in obj {
                    map.insert(k.clone(), Value::from_json(v)?);
                }
                Value::Document(map)
            }
        })
    }

    fn from_extended(obj: &serde_json::Map<String, Json>) -> Result<Option<Value>, StorageError> {
        let Some((key, Json::String(raw))) = obj.iter().next() else {
            return Ok(None);
        };
        let value = match key.as_str() {
            "$oid" => Value::ObjectId(ObjectId::parse_str(raw).map_err(|e| {
                StorageError::Serialization(format!("bad $oid: {}", e))
            })?),
            "$binary" => Value::Binary(hex::decode(raw).map_err(|e| {
                StorageError::Serialization(format!("bad $binary: {}", e))
            })?),
            "$date" => Value::DateTime(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| StorageError::Serialization(format!("bad $date: {}", e)))?
                    .with_timezone(&Utc),
            ),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Value::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::ObjectId(id)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Document(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_json_boundary_types() {
        let id = ObjectId::new();
        let value = Value::Document(Map::from([
            ("_id".to_string(), Value::ObjectId(id)),
            ("blob".to_string(), Value::Binary(vec![0xde, 0xad])),
            ("n".to_string(), Value::Int(3)),
        ]));

        let json = value.to_json();
        assert_eq!(json["_id"]["$oid"], id.to_hex());
        assert_eq!(json["blob"]["$binary"], "dead");
        assert_eq!(Value::from_json(&json).unwrap(), value);
    }

    #[test]
    fn test_plain_single_key_object_is_a_document() {
        let json = json!({ "$oid": 5 });
        let value = Value::from_json(&json).unwrap();
        assert_eq!(value.kind(), Kind::Mapping);
    }

    #[test]
    fn test_normalized_strips_null_members_but_not_elements() {
        let value = Value::Document(Map::from([
            ("gone".to_string(), Value::Null),
            ("list".to_string(), Value::Array(vec![Value::Null, Value::Int(1)])),
        ]));
        let normalized = value.normalized();
        let map = normalized.as_document().unwrap();
        assert!(!map.contains_key("gone"));
        assert_eq!(map["list"].as_array().unwrap().len(), 2);
    }
}
