//! Data encryption key records as stored in the key vault.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key_provider::MasterKeyRef;

/// Reference to a data key, by id or by alternate name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyRef {
    /// The key's UUID
    Id(Uuid),
    /// One of the key's `keyAltNames`
    AltName(String),
}

impl KeyRef {
    /// Creates an alternate-name reference.
    #[must_use]
    pub fn alt_name(name: impl Into<String>) -> Self {
        Self::AltName(name.into())
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::AltName(name) => write!(f, "alt name '{name}'"),
        }
    }
}

impl From<Uuid> for KeyRef {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

/// A data encryption key wrapped by a master key.
///
/// `key_material` only ever holds wrapped bytes; the raw key exists in memory
/// for the duration of a single encrypt or decrypt call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataKey {
    /// Key identifier, embedded in every ciphertext it produces
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// DEK wrapped by `master_key`
    #[serde(with = "base64_bytes")]
    pub key_material: Vec<u8>,
    /// Unique alternate names
    #[serde(default)]
    pub key_alt_names: BTreeSet<String>,
    /// Master key that wrapped `key_material`
    pub master_key: MasterKeyRef,
    /// When the key was created
    pub creation_date: DateTime<Utc>,
    /// When the record last changed
    pub update_date: DateTime<Utc>,
}

impl DataKey {
    /// Creates a record with a fresh random id.
    #[must_use]
    pub fn new<I, S>(key_material: Vec<u8>, master_key: MasterKeyRef, alt_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key_material,
            key_alt_names: alt_names.into_iter().map(Into::into).collect(),
            master_key,
            creation_date: now,
            update_date: now,
        }
    }

    /// Whether this key is the one a reference points to.
    #[must_use]
    pub fn matches(&self, key_ref: &KeyRef) -> bool {
        match key_ref {
            KeyRef::Id(id) => self.id == *id,
            KeyRef::AltName(name) => self.key_alt_names.contains(name),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_key_has_unique_id() {
        let a = DataKey::new(vec![1, 2, 3], MasterKeyRef::Local, ["a"]);
        let b = DataKey::new(vec![1, 2, 3], MasterKeyRef::Local, ["b"]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.creation_date, a.update_date);
    }

    #[test]
    fn test_matches() {
        let key = DataKey::new(vec![], MasterKeyRef::Local, ["patients"]);
        assert!(key.matches(&KeyRef::Id(key.id)));
        assert!(key.matches(&KeyRef::alt_name("patients")));
        assert!(!key.matches(&KeyRef::alt_name("other")));
        assert!(!key.matches(&KeyRef::Id(Uuid::new_v4())));
    }

    #[test]
    fn test_serde_shape() {
        let key = DataKey::new(vec![0xde, 0xad], MasterKeyRef::Local, ["k1"]);
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["_id"], serde_json::json!(key.id.to_string()));
        assert_eq!(json["keyMaterial"], serde_json::json!("3q0="));
        assert_eq!(json["keyAltNames"], serde_json::json!(["k1"]));
        assert_eq!(json["masterKey"], serde_json::json!({"provider": "local"}));

        let parsed: DataKey = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, key);
    }
}
