use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StorageError;

/// Counter shared by every id generated in this process (lower 24 bits used).
static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Per-process random component, drawn once.
static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();

/// Store-generated document identity.
///
/// Layout (12 bytes):
/// - 4 bytes: big-endian seconds since the Unix epoch
/// - 5 bytes: per-process random value
/// - 3 bytes: big-endian counter
///
/// Rendered as 24 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a new id.
    pub fn new() -> Self {
        let secs = chrono::Utc::now().timestamp() as u32;
        let unique = PROCESS_UNIQUE.get_or_init(|| {
            let random = uuid::Uuid::new_v4();
            let mut out = [0u8; 5];
            out.copy_from_slice(&random.as_bytes()[..5]);
            out
        });
        let count = COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00ff_ffff;

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(unique);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Seconds since the epoch encoded in the id.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 24-character hex rendering.
    pub fn parse_str(s: &str) -> Result<Self, StorageError> {
        if s.len() != 24 {
            return Err(StorageError::UnsupportedIdentity(format!(
                "expected 24 hex characters, got {:?}",
                s
            )));
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| {
            StorageError::UnsupportedIdentity(format!("invalid id {:?}: {}", s, e))
        })?;
        Ok(Self(bytes))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let id = ObjectId::new();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 24);
        assert_eq!(rendered.parse::<ObjectId>().unwrap(), id);
    }

    #[test]
    fn test_ids_are_unique_and_ordered_within_a_second() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        if a.timestamp() == b.timestamp() {
            assert!(a < b);
        }
    }

    #[test]
    fn test_rejects_malformed_strings() {
        assert!(matches!(
            "abc".parse::<ObjectId>(),
            Err(StorageError::UnsupportedIdentity(_))
        ));
        assert!(matches!(
            "zzzzzzzzzzzzzzzzzzzzzzzz".parse::<ObjectId>(),
            Err(StorageError::UnsupportedIdentity(_))
        ));
    }
}
