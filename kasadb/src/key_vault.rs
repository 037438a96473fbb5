//! Key vault: durable storage for wrapped data keys.
//!
//! The vault enforces that every `keyAltNames` entry belongs to at most one
//! key. It never retries; storage failures surface as
//! [`Error::StorageUnavailable`] and retry policy belongs to the caller.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::data_key::{DataKey, KeyRef};
use crate::error::Error;

/// Storage for data encryption keys.
///
/// Implementations must be thread-safe; a single vault is shared by every
/// concurrent encrypt and decrypt call.
pub trait KeyVault: Send + Sync {
    /// Fetches a key by id or alternate name.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key matches.
    fn get_key(&self, key_ref: &KeyRef) -> Result<DataKey, Error>;

    /// Stores a new key and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateAltName` if any alternate name is taken and
    /// `Error::DuplicateKeyId` if the id is already stored.
    fn put_key(&self, key: DataKey) -> Result<Uuid, Error>;

    /// Returns every stored key in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the backing store fails.
    fn list_keys(&self) -> Result<Vec<DataKey>, Error>;

    /// Deletes a key and returns the removed record.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key has this id.
    fn delete_key(&self, id: Uuid) -> Result<DataKey, Error>;

    /// Adds an alternate name to a key and returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateAltName` if another key owns the name.
    fn add_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error>;

    /// Removes an alternate name from a key and returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key has this id.
    fn remove_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error>;
}

impl<V: KeyVault + ?Sized> KeyVault for Arc<V> {
    fn get_key(&self, key_ref: &KeyRef) -> Result<DataKey, Error> {
        (**self).get_key(key_ref)
    }

    fn put_key(&self, key: DataKey) -> Result<Uuid, Error> {
        (**self).put_key(key)
    }

    fn list_keys(&self) -> Result<Vec<DataKey>, Error> {
        (**self).list_keys()
    }

    fn delete_key(&self, id: Uuid) -> Result<DataKey, Error> {
        (**self).delete_key(id)
    }

    fn add_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        (**self).add_key_alt_name(id, alt_name)
    }

    fn remove_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        (**self).remove_key_alt_name(id, alt_name)
    }
}

/// Keys plus the unique index over their alternate names.
#[derive(Debug, Clone, Default)]
struct KeyIndex {
    keys: Vec<DataKey>,
    alt_names: HashMap<String, Uuid>,
}

impl KeyIndex {
    fn from_keys(keys: Vec<DataKey>) -> Result<Self, Error> {
        let mut index = Self::default();
        for key in keys {
            index.insert(key)?;
        }
        Ok(index)
    }

    fn get(&self, key_ref: &KeyRef) -> Result<&DataKey, Error> {
        let id = match key_ref {
            KeyRef::Id(id) => *id,
            KeyRef::AltName(name) => *self
                .alt_names
                .get(name)
                .ok_or_else(|| Error::KeyNotFound(key_ref.to_string()))?,
        };
        self.keys
            .iter()
            .find(|key| key.id == id)
            .ok_or_else(|| Error::KeyNotFound(key_ref.to_string()))
    }

    fn position(&self, id: Uuid) -> Result<usize, Error> {
        self.keys
            .iter()
            .position(|key| key.id == id)
            .ok_or_else(|| Error::KeyNotFound(KeyRef::Id(id).to_string()))
    }

    fn insert(&mut self, key: DataKey) -> Result<Uuid, Error> {
        if self.keys.iter().any(|k| k.id == key.id) {
            return Err(Error::DuplicateKeyId(key.id));
        }
        if let Some(taken) = key.key_alt_names.iter().find(|n| self.alt_names.contains_key(*n)) {
            return Err(Error::DuplicateAltName(taken.clone()));
        }
        for name in &key.key_alt_names {
            self.alt_names.insert(name.clone(), key.id);
        }
        let id = key.id;
        self.keys.push(key);
        Ok(id)
    }

    fn remove(&mut self, id: Uuid) -> Result<DataKey, Error> {
        let key = self.keys.remove(self.position(id)?);
        for name in &key.key_alt_names {
            self.alt_names.remove(name);
        }
        Ok(key)
    }

    fn add_alt_name(&mut self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        let pos = self.position(id)?;
        match self.alt_names.get(alt_name) {
            Some(owner) if *owner == id => return Ok(self.keys[pos].clone()),
            Some(_) => return Err(Error::DuplicateAltName(alt_name.to_string())),
            None => {}
        }
        self.alt_names.insert(alt_name.to_string(), id);
        let key = &mut self.keys[pos];
        key.key_alt_names.insert(alt_name.to_string());
        key.update_date = Utc::now();
        Ok(key.clone())
    }

    fn remove_alt_name(&mut self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        let pos = self.position(id)?;
        let key = &mut self.keys[pos];
        if key.key_alt_names.remove(alt_name) {
            self.alt_names.remove(alt_name);
            key.update_date = Utc::now();
        }
        Ok(key.clone())
    }
}

/// In-memory key vault.
///
/// Suitable for tests and for processes that load keys from elsewhere.
#[derive(Debug, Default)]
pub struct MemoryKeyVault {
    index: RwLock<KeyIndex>,
}

impl MemoryKeyVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyVault for MemoryKeyVault {
    fn get_key(&self, key_ref: &KeyRef) -> Result<DataKey, Error> {
        self.index.read().get(key_ref).cloned()
    }

    fn put_key(&self, key: DataKey) -> Result<Uuid, Error> {
        let id = self.index.write().insert(key)?;
        debug!(key_id = %id, "stored data key");
        Ok(id)
    }

    fn list_keys(&self) -> Result<Vec<DataKey>, Error> {
        Ok(self.index.read().keys.clone())
    }

    fn delete_key(&self, id: Uuid) -> Result<DataKey, Error> {
        self.index.write().remove(id)
    }

    fn add_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        self.index.write().add_alt_name(id, alt_name)
    }

    fn remove_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        self.index.write().remove_alt_name(id, alt_name)
    }
}

/// Key vault persisted as a JSON array in a single file.
///
/// Every mutation is applied to a copy, written to a temporary file and
/// renamed into place; the in-memory view only changes once the write
/// succeeded.
#[derive(Debug)]
pub struct FileKeyVault {
    path: PathBuf,
    index: RwLock<KeyIndex>,
}

impl FileKeyVault {
    /// Opens a vault file, starting empty if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the file cannot be read or
    /// parsed, or violates the alternate name uniqueness.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let keys = if path.exists() {
            let data = fs::read(&path).map_err(|e| storage_error(&path, &e))?;
            serde_json::from_slice::<Vec<DataKey>>(&data).map_err(|e| storage_error(&path, &e))?
        } else {
            Vec::new()
        };
        let index = KeyIndex::from_keys(keys)
            .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), keys = index.keys.len(), "opened key vault");
        Ok(Self { path, index: RwLock::new(index) })
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut KeyIndex) -> Result<T, Error>) -> Result<T, Error> {
        let mut guard = self.index.write();
        let mut next = guard.clone();
        let out = apply(&mut next)?;
        self.persist(&next.keys)?;
        *guard = next;
        Ok(out)
    }

    fn persist(&self, keys: &[DataKey]) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(keys).map_err(|e| storage_error(&self.path, &e))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|e| storage_error(&tmp, &e))?;
        fs::rename(&tmp, &self.path).map_err(|e| storage_error(&self.path, &e))
    }
}

fn storage_error(path: &Path, err: &dyn std::fmt::Display) -> Error {
    Error::StorageUnavailable(format!("{}: {err}", path.display()))
}

impl KeyVault for FileKeyVault {
    fn get_key(&self, key_ref: &KeyRef) -> Result<DataKey, Error> {
        self.index.read().get(key_ref).cloned()
    }

    fn put_key(&self, key: DataKey) -> Result<Uuid, Error> {
        let id = self.mutate(|index| index.insert(key))?;
        debug!(key_id = %id, path = %self.path.display(), "stored data key");
        Ok(id)
    }

    fn list_keys(&self) -> Result<Vec<DataKey>, Error> {
        Ok(self.index.read().keys.clone())
    }

    fn delete_key(&self, id: Uuid) -> Result<DataKey, Error> {
        self.mutate(|index| index.remove(id))
    }

    fn add_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        self.mutate(|index| index.add_alt_name(id, alt_name))
    }

    fn remove_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        self.mutate(|index| index.remove_alt_name(id, alt_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::MasterKeyRef;

    fn key(alt_names: &[&str]) -> DataKey {
        DataKey::new(vec![9u8; 80], MasterKeyRef::Local, alt_names.iter().copied())
    }

    #[test]
    fn test_put_and_get_by_id_and_alt_name() {
        let vault = MemoryKeyVault::new();
        let k = key(&["patients"]);
        let id = vault.put_key(k.clone()).unwrap();

        assert_eq!(vault.get_key(&KeyRef::Id(id)).unwrap(), k);
        assert_eq!(vault.get_key(&KeyRef::alt_name("patients")).unwrap(), k);
    }

    #[test]
    fn test_key_not_found() {
        let vault = MemoryKeyVault::new();
        assert!(matches!(vault.get_key(&KeyRef::alt_name("nope")), Err(Error::KeyNotFound(_))));
        assert!(matches!(vault.get_key(&KeyRef::Id(Uuid::new_v4())), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_duplicate_alt_name_rejected() {
        let vault = MemoryKeyVault::new();
        vault.put_key(key(&["a", "shared"])).unwrap();

        let result = vault.put_key(key(&["b", "shared"]));
        assert!(matches!(result, Err(Error::DuplicateAltName(name)) if name == "shared"));

        // The failed insert must not leave a partial index entry behind
        assert!(vault.get_key(&KeyRef::alt_name("b")).is_err());
        assert_eq!(vault.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let vault = MemoryKeyVault::new();
        let k = key(&[]);
        vault.put_key(k.clone()).unwrap();
        assert!(matches!(vault.put_key(k), Err(Error::DuplicateKeyId(_))));
    }

    #[test]
    fn test_alt_name_management() {
        let vault = MemoryKeyVault::new();
        let a = vault.put_key(key(&["a"])).unwrap();
        let b = vault.put_key(key(&["b"])).unwrap();

        let updated = vault.add_key_alt_name(a, "extra").unwrap();
        assert!(updated.key_alt_names.contains("extra"));
        assert!(updated.update_date >= updated.creation_date);

        // Re-adding an owned name is a no-op, stealing one is an error
        assert!(vault.add_key_alt_name(a, "extra").is_ok());
        assert!(matches!(vault.add_key_alt_name(b, "extra"), Err(Error::DuplicateAltName(_))));

        vault.remove_key_alt_name(a, "extra").unwrap();
        assert!(vault.get_key(&KeyRef::alt_name("extra")).is_err());
        vault.add_key_alt_name(b, "extra").unwrap();
        assert_eq!(vault.get_key(&KeyRef::alt_name("extra")).unwrap().id, b);
    }

    #[test]
    fn test_delete_releases_alt_names() {
        let vault = MemoryKeyVault::new();
        let id = vault.put_key(key(&["gone"])).unwrap();
        let removed = vault.delete_key(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(vault.put_key(key(&["gone"])).is_ok());
        assert!(matches!(vault.delete_key(id), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_file_vault_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datakeys.json");

        let id = {
            let vault = FileKeyVault::open(&path).unwrap();
            let id = vault.put_key(key(&["persisted"])).unwrap();
            vault.add_key_alt_name(id, "second").unwrap();
            id
        };

        let reopened = FileKeyVault::open(&path).unwrap();
        let k = reopened.get_key(&KeyRef::alt_name("second")).unwrap();
        assert_eq!(k.id, id);
        assert!(matches!(
            reopened.put_key(key(&["persisted"])),
            Err(Error::DuplicateAltName(_))
        ));
    }

    #[test]
    fn test_file_vault_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datakeys.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(FileKeyVault::open(&path), Err(Error::StorageUnavailable(_))));
    }

    #[test]
    fn test_file_vault_unwritable_location() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileKeyVault::open(dir.path().join("missing").join("datakeys.json")).unwrap();
        let result = vault.put_key(key(&["x"]));
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
        assert!(vault.list_keys().unwrap().is_empty());
    }
}
