//! Client facades over the encryption engine.
//!
//! - [`ClientEncryption`]: explicit API for data key management and manual
//!   encryption of single values
//! - [`AutoEncrypter`]: automatic API applying per-namespace schemas to
//!   writes, filters and reads
//! - [`EncryptedCollection`]: a [`Collection`] seen through an `AutoEncrypter`

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::debug;
use uuid::Uuid;

use crate::ciphertext::Algorithm;
use crate::data_key::{DataKey, KeyRef};
use crate::engine::Encrypter;
use crate::error::Error;
use crate::kdf::generate_dek;
use crate::key_provider::{KmsProviders, MasterKeyRef};
use crate::key_vault::KeyVault;
use crate::namespace::Namespace;
use crate::query::Predicate;
use crate::schema::{FieldEncryptionPolicy, SchemaMap};
use crate::store::Collection;
use crate::value::{Document, Value};

/// Explicit encryption and data key management.
pub struct ClientEncryption<V: KeyVault> {
    encrypter: Encrypter<V>,
}

impl<V: KeyVault> ClientEncryption<V> {
    /// Creates a client over a key vault and master key providers.
    pub fn new(vault: Arc<V>, providers: KmsProviders) -> Self {
        Self { encrypter: Encrypter::new(vault, providers) }
    }

    /// Wraps an existing engine.
    #[must_use]
    pub const fn from_encrypter(encrypter: Encrypter<V>) -> Self {
        Self { encrypter }
    }

    /// Returns the underlying engine.
    #[must_use]
    pub const fn encrypter(&self) -> &Encrypter<V> {
        &self.encrypter
    }

    /// Generates a data key, wraps it with a master key and stores it.
    ///
    /// # Arguments
    ///
    /// * `master_key` - Master key that wraps the new DEK
    /// * `alt_names` - Unique alternate names for the key
    ///
    /// # Returns
    ///
    /// The id of the new key.
    ///
    /// # Errors
    ///
    /// Returns a provider error if wrapping fails and
    /// `Error::DuplicateAltName` if a name is taken.
    pub fn create_data_key<I, S>(
        &self,
        master_key: MasterKeyRef,
        alt_names: I,
    ) -> Result<Uuid, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dek = generate_dek();
        let wrapped = self.encrypter.providers().wrap_dek(&master_key, dek.expose_secret())?;
        let key = DataKey::new(wrapped, master_key, alt_names);
        debug!(
            key_id = %key.id,
            alt_names = ?key.key_alt_names,
            provider = %key.master_key.kind(),
            "creating data key"
        );
        self.encrypter.vault().put_key(key)
    }

    /// Encrypts a value with an explicit algorithm and key.
    ///
    /// # Errors
    ///
    /// See [`Encrypter::encrypt_value`].
    pub fn encrypt(
        &self,
        value: &Value,
        algorithm: Algorithm,
        key: &KeyRef,
    ) -> Result<Value, Error> {
        self.encrypter.encrypt_value(value, algorithm, key)
    }

    /// Decrypts a ciphertext blob.
    ///
    /// # Errors
    ///
    /// See [`Encrypter::decrypt_value`].
    pub fn decrypt(&self, value: &Value) -> Result<Value, Error> {
        self.encrypter.decrypt_value(value)
    }

    /// Fetches a key record.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key matches.
    pub fn get_key(&self, key: &KeyRef) -> Result<DataKey, Error> {
        self.encrypter.vault().get_key(key)
    }

    /// Lists every key record.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the vault cannot be read.
    pub fn list_keys(&self) -> Result<Vec<DataKey>, Error> {
        self.encrypter.vault().list_keys()
    }

    /// Deletes a key. Data encrypted under it becomes unreadable.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key has this id.
    pub fn delete_key(&self, id: Uuid) -> Result<DataKey, Error> {
        debug!(key_id = %id, "deleting data key");
        self.encrypter.vault().delete_key(id)
    }

    /// Adds an alternate name to a key.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateAltName` if another key owns the name.
    pub fn add_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        self.encrypter.vault().add_key_alt_name(id, alt_name)
    }

    /// Removes an alternate name from a key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key has this id.
    pub fn remove_key_alt_name(&self, id: Uuid, alt_name: &str) -> Result<DataKey, Error> {
        self.encrypter.vault().remove_key_alt_name(id, alt_name)
    }
}

/// Automatic encryption driven by a schema map.
///
/// Namespaces without a schema pass through untouched. With
/// `bypass_auto_encryption` set, writes and filters are never encrypted but
/// reads are still decrypted.
pub struct AutoEncrypter<V: KeyVault> {
    encrypter: Encrypter<V>,
    schemas: SchemaMap,
    bypass: bool,
}

impl<V: KeyVault> AutoEncrypter<V> {
    /// Creates an automatic encrypter.
    #[must_use]
    pub const fn new(encrypter: Encrypter<V>, schemas: SchemaMap) -> Self {
        Self { encrypter, schemas, bypass: false }
    }

    /// Enables or disables bypass mode.
    #[must_use]
    pub const fn bypass_auto_encryption(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Returns the underlying engine.
    #[must_use]
    pub const fn encrypter(&self) -> &Encrypter<V> {
        &self.encrypter
    }

    /// Returns the policy applied to a namespace, if any.
    #[must_use]
    pub fn policy(&self, namespace: &Namespace) -> Option<&Arc<FieldEncryptionPolicy>> {
        self.schemas.get(namespace)
    }

    fn write_policy(&self, namespace: &Namespace) -> Option<&FieldEncryptionPolicy> {
        if self.bypass {
            return None;
        }
        self.schemas.get(namespace).map(|policy| policy.as_ref())
    }

    /// Encrypts a document about to be inserted into `namespace`.
    ///
    /// # Errors
    ///
    /// See [`Encrypter::encrypt`].
    pub fn encrypt_for_insert(
        &self,
        namespace: &Namespace,
        doc: &Document,
    ) -> Result<Document, Error> {
        match self.write_policy(namespace) {
            Some(policy) => self.encrypter.encrypt(doc, policy),
            None => Ok(doc.clone()),
        }
    }

    /// Rewrites a filter issued against `namespace`.
    ///
    /// # Errors
    ///
    /// See [`Predicate::rewrite`].
    pub fn rewrite_filter(
        &self,
        namespace: &Namespace,
        filter: &Predicate,
    ) -> Result<Predicate, Error> {
        match self.write_policy(namespace) {
            Some(policy) => filter.rewrite(policy, &self.encrypter),
            None => Ok(filter.clone()),
        }
    }

    /// Decrypts a document read from `namespace`.
    ///
    /// # Errors
    ///
    /// See [`Encrypter::decrypt`].
    pub fn decrypt_result(&self, namespace: &Namespace, doc: &Document) -> Result<Document, Error> {
        match self.schemas.get(namespace) {
            Some(policy) => self.encrypter.decrypt(doc, policy),
            None => self.encrypter.decrypt(doc, &FieldEncryptionPolicy::default()),
        }
    }
}

/// A collection whose documents are transparently encrypted.
pub struct EncryptedCollection<V: KeyVault, C: Collection> {
    auto: Arc<AutoEncrypter<V>>,
    namespace: Namespace,
    inner: C,
}

impl<V: KeyVault, C: Collection> EncryptedCollection<V, C> {
    /// Binds an automatic encrypter to a namespace and its storage.
    pub const fn new(auto: Arc<AutoEncrypter<V>>, namespace: Namespace, inner: C) -> Self {
        Self { auto, namespace, inner }
    }

    /// Returns the namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the raw storage, holding ciphertext.
    #[must_use]
    pub const fn inner(&self) -> &C {
        &self.inner
    }

    /// Encrypts and stores a document.
    ///
    /// # Errors
    ///
    /// Returns encryption or storage errors; nothing is stored on failure.
    pub fn insert_one(&self, doc: &Document) -> Result<(), Error> {
        let encrypted = self.auto.encrypt_for_insert(&self.namespace, doc)?;
        self.inner.insert_one(encrypted)
    }

    /// Finds documents matching a filter document and decrypts them.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFilter`, query rewrite errors, or decryption
    /// errors.
    pub fn find(&self, filter: &Document) -> Result<Vec<Document>, Error> {
        self.find_matching(&Predicate::from_document(filter)?)
    }

    /// Finds documents matching a predicate and decrypts them.
    ///
    /// # Errors
    ///
    /// See [`EncryptedCollection::find`].
    pub fn find_matching(&self, filter: &Predicate) -> Result<Vec<Document>, Error> {
        let rewritten = self.auto.rewrite_filter(&self.namespace, filter)?;
        self.inner
            .find(&rewritten)?
            .iter()
            .map(|doc| self.auto.decrypt_result(&self.namespace, doc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::MemoryKeyVault;
    use crate::store::MemoryCollection;
    use crate::test_support::{patient, patients_schema, XorKeyProvider};
    use serde_json::json;
    use std::collections::HashMap;

    fn patients_ns() -> Namespace {
        "medicalRecords.patients".parse().unwrap()
    }

    fn client() -> ClientEncryption<MemoryKeyVault> {
        let providers = KmsProviders::new().with(XorKeyProvider::new());
        ClientEncryption::new(Arc::new(MemoryKeyVault::new()), providers)
    }

    fn collection(bypass: bool) -> EncryptedCollection<MemoryKeyVault, MemoryCollection> {
        let client = client();
        client.create_data_key(MasterKeyRef::Local, ["patients-key"]).unwrap();
        let schema_map = HashMap::from([(patients_ns(), patients_schema())]);
        let schemas = SchemaMap::compile(&schema_map).unwrap();
        let auto = AutoEncrypter::new(client.encrypter().clone(), schemas)
            .bypass_auto_encryption(bypass);
        EncryptedCollection::new(Arc::new(auto), patients_ns(), MemoryCollection::new())
    }

    #[test]
    fn test_data_key_lifecycle() {
        let client = client();
        let id = client.create_data_key(MasterKeyRef::Local, ["a", "b"]).unwrap();

        let key = client.get_key(&KeyRef::alt_name("a")).unwrap();
        assert_eq!(key.id, id);
        assert_eq!(key.key_material.len(), 64);

        let duplicate = client.create_data_key(MasterKeyRef::Local, ["b"]);
        assert!(matches!(duplicate, Err(Error::DuplicateAltName(name)) if name == "b"));
        assert_eq!(client.list_keys().unwrap().len(), 1);

        client.add_key_alt_name(id, "c").unwrap();
        client.remove_key_alt_name(id, "a").unwrap();
        assert!(client.get_key(&KeyRef::alt_name("c")).is_ok());
        assert!(matches!(client.get_key(&KeyRef::alt_name("a")), Err(Error::KeyNotFound(_))));

        client.delete_key(id).unwrap();
        assert!(client.list_keys().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_encrypt_decrypt() {
        let client = client();
        let id = client.create_data_key(MasterKeyRef::Local, Vec::<String>::new()).unwrap();
        let value = Value::String("AB+".into());

        let blob = client.encrypt(&value, Algorithm::Random, &KeyRef::Id(id)).unwrap();
        assert!(blob.is_encrypted());
        assert_eq!(client.decrypt(&blob).unwrap(), value);
    }

    #[test]
    fn test_create_key_needs_provider() {
        let client = client();
        let result = client.create_data_key(MasterKeyRef::aws("us-east-1", "alias/k"), ["aws"]);
        assert!(matches!(result, Err(Error::KeyProvider(_))));
        assert!(client.list_keys().unwrap().is_empty());
    }

    #[test]
    fn test_encrypted_collection_queries() {
        let patients = collection(false);
        patients.insert_one(&patient()).unwrap();

        let stored = patients.inner().all();
        assert!(stored[0].get("ssn").unwrap().is_encrypted());

        let filter = Document::from_json(json!({"ssn": 241_014_209})).unwrap();
        let found = patients.find(&filter).unwrap();
        assert_eq!(found, vec![patient()]);

        let none = patients.find(&Document::from_json(json!({"ssn": 1})).unwrap()).unwrap();
        assert!(none.is_empty());

        let rejected = patients.find(&Document::from_json(json!({"bloodType": "AB+"})).unwrap());
        assert!(matches!(rejected, Err(Error::NonQueryableField(_))));
    }

    #[test]
    fn test_bypass_still_decrypts() {
        let patients = collection(true);
        patients.insert_one(&patient()).unwrap();
        assert_eq!(patients.inner().all()[0], patient());

        // Ciphertext written by another path is still decrypted on read
        let ns = patients_ns();
        let policy = patients.auto.policy(&ns).unwrap().clone();
        let encrypted = patients.auto.encrypter().encrypt(&patient(), &policy).unwrap();
        assert_eq!(patients.auto.decrypt_result(&ns, &encrypted).unwrap(), patient());
    }

    #[test]
    fn test_namespace_without_schema_passes_through() {
        let patients = collection(false);
        let other: Namespace = "medicalRecords.visits".parse().unwrap();
        let doc = patient();
        assert_eq!(patients.auto.encrypt_for_insert(&other, &doc).unwrap(), doc);
        let filter = Predicate::eq("bloodType", "AB+");
        assert_eq!(patients.auto.rewrite_filter(&other, &filter).unwrap(), filter);
    }
}
