//! Encryption engine: applies a field encryption policy to documents.
//!
//! The engine uses envelope encryption:
//! 1. Resolve the field's data key in the key vault
//! 2. Unwrap the DEK with the master key provider named by the key record
//! 3. Encrypt the canonical bytes of the value under the DEK
//! 4. Store the resulting blob (binary subtype 6) in place of the value
//!
//! Unwrapped DEKs live in a [`KeyCache`] scoped to a single call and are
//! zeroized when it returns.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretVec};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cipher::{decrypt_canonical, encrypt_canonical};
use crate::ciphertext::{Algorithm, CiphertextBlob};
use crate::codec::{decode_canonical, encode_canonical};
use crate::data_key::{DataKey, KeyRef};
use crate::error::{Error, SchemaError};
use crate::kdf::DEK_SIZE;
use crate::key_provider::KmsProviders;
use crate::key_vault::KeyVault;
use crate::schema::{EncryptedField, FieldEncryptionPolicy, ObjectPolicy, PolicyNode};
use crate::value::{Binary, BsonType, Document, Value};

/// Unwrapped data keys for the duration of one operation.
pub(crate) struct KeyCache<'a> {
    vault: &'a dyn KeyVault,
    providers: &'a KmsProviders,
    keys: HashMap<Uuid, SecretVec<u8>>,
    alt_names: HashMap<String, Uuid>,
}

impl<'a> KeyCache<'a> {
    fn new(vault: &'a dyn KeyVault, providers: &'a KmsProviders) -> Self {
        Self { vault, providers, keys: HashMap::new(), alt_names: HashMap::new() }
    }

    /// Resolves a key reference to its id and unwrapped DEK.
    fn resolve(&mut self, key_ref: &KeyRef) -> Result<(Uuid, &SecretVec<u8>), Error> {
        let id = match key_ref {
            KeyRef::Id(id) => *id,
            KeyRef::AltName(name) => match self.alt_names.get(name).copied() {
                Some(id) => id,
                None => {
                    let key = self.vault.get_key(key_ref)?;
                    self.alt_names.insert(name.clone(), key.id);
                    if !self.keys.contains_key(&key.id) {
                        self.unwrap_into(&key)?;
                    }
                    key.id
                }
            },
        };
        Ok((id, self.by_id(id)?))
    }

    fn by_id(&mut self, id: Uuid) -> Result<&SecretVec<u8>, Error> {
        if !self.keys.contains_key(&id) {
            let key = self.vault.get_key(&KeyRef::Id(id))?;
            self.unwrap_into(&key)?;
        }
        self.keys.get(&id).ok_or_else(|| Error::KeyNotFound(KeyRef::Id(id).to_string()))
    }

    fn unwrap_into(&mut self, key: &DataKey) -> Result<(), Error> {
        debug!(key_id = %key.id, provider = %key.master_key.kind(), "unwrapping data key");
        let dek = self.providers.unwrap_dek(&key.master_key, &key.key_material)?;
        let len = dek.expose_secret().len();
        if len != DEK_SIZE {
            return Err(Error::InvalidKeyLength { expected: DEK_SIZE, actual: len });
        }
        self.keys.insert(key.id, dek);
        Ok(())
    }
}

/// Encrypts and decrypts documents according to a [`FieldEncryptionPolicy`].
///
/// Cheap to clone; clones share the key vault and providers. All methods take
/// `&self` and may run concurrently.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use kasadb::prelude::*;
/// use kasadb_key_file::FileKeyProvider;
///
/// let providers = KmsProviders::new().with(FileKeyProvider::new("./master.key")?);
/// let encrypter = Encrypter::new(Arc::new(MemoryKeyVault::new()), providers);
///
/// let policy = FieldEncryptionPolicy::compile(&schema)?;
/// let stored = encrypter.encrypt(&doc, &policy)?;
/// assert_eq!(encrypter.decrypt(&stored, &policy)?, doc);
/// ```
pub struct Encrypter<V: KeyVault> {
    vault: Arc<V>,
    providers: Arc<KmsProviders>,
}

impl<V: KeyVault> Clone for Encrypter<V> {
    fn clone(&self) -> Self {
        Self { vault: Arc::clone(&self.vault), providers: Arc::clone(&self.providers) }
    }
}

impl<V: KeyVault> Encrypter<V> {
    /// Creates an engine over a key vault and master key providers.
    ///
    /// # Arguments
    ///
    /// * `vault` - Storage of wrapped data keys
    /// * `providers` - Master key providers able to unwrap them
    pub fn new(vault: Arc<V>, providers: KmsProviders) -> Self {
        Self { vault, providers: Arc::new(providers) }
    }

    /// Returns the key vault.
    #[must_use]
    pub const fn vault(&self) -> &Arc<V> {
        &self.vault
    }

    /// Returns the master key providers.
    #[must_use]
    pub fn providers(&self) -> &KmsProviders {
        &self.providers
    }

    pub(crate) fn key_cache(&self) -> KeyCache<'_> {
        KeyCache::new(&*self.vault, &self.providers)
    }

    /// Encrypts every policy-covered field of a document.
    ///
    /// Fields the policy does not cover are copied unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Error::TypeMismatch` if a covered value does not have its
    /// declared type (or is already encrypted), and key vault or provider
    /// errors if the field's key cannot be resolved. No partially encrypted
    /// document is ever returned.
    pub fn encrypt(
        &self,
        doc: &Document,
        policy: &FieldEncryptionPolicy,
    ) -> Result<Document, Error> {
        let mut keys = self.key_cache();
        encrypt_document(doc, policy.root(), "", &mut keys)
    }

    /// Decrypts every ciphertext blob in a document.
    ///
    /// Blobs are decrypted wherever they occur; the policy is used to check
    /// that decrypted values have their declared types.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthenticationFailed` if any blob fails verification;
    /// the whole document is rejected.
    pub fn decrypt(
        &self,
        doc: &Document,
        policy: &FieldEncryptionPolicy,
    ) -> Result<Document, Error> {
        let mut keys = self.key_cache();
        decrypt_document(doc, Some(policy.root()), "", &mut keys)
    }

    /// Encrypts a single value with an explicit algorithm and key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if deterministic encryption is requested for
    /// a type that does not support it, and `Error::TypeMismatch` if the
    /// value is already encrypted.
    pub fn encrypt_value(
        &self,
        value: &Value,
        algorithm: Algorithm,
        key: &KeyRef,
    ) -> Result<Value, Error> {
        let ty = value.bson_type();
        if algorithm == Algorithm::Deterministic && !ty.supports_deterministic() {
            return Err(SchemaError::DeterministicRequiresScalar {
                path: String::new(),
                found: ty.to_string(),
            }
            .into());
        }
        let field = EncryptedField { algorithm, value_type: None, key: key.clone() };
        let mut keys = self.key_cache();
        encrypt_field(value, &field, "", &mut keys)
    }

    /// Decrypts a single ciphertext blob.
    ///
    /// # Errors
    ///
    /// Returns `Error::TypeMismatch` if the value is not a blob, and
    /// `Error::AuthenticationFailed` if it fails verification.
    pub fn decrypt_value(&self, value: &Value) -> Result<Value, Error> {
        let bytes = value.as_encrypted().ok_or_else(|| Error::TypeMismatch {
            path: String::new(),
            expected: "encrypted binData".to_string(),
            actual: value.bson_type().to_string(),
        })?;
        let mut keys = self.key_cache();
        decrypt_blob(bytes, "", &mut keys)
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn encrypt_document(
    doc: &Document,
    policy: &ObjectPolicy,
    path: &str,
    keys: &mut KeyCache<'_>,
) -> Result<Document, Error> {
    doc.iter()
        .map(|(key, value)| {
            let value = match policy.get(key) {
                Some(node) => encrypt_node(value, node, &child_path(path, key), keys)?,
                None => value.clone(),
            };
            Ok((key.to_string(), value))
        })
        .collect()
}

fn encrypt_node(
    value: &Value,
    node: &PolicyNode,
    path: &str,
    keys: &mut KeyCache<'_>,
) -> Result<Value, Error> {
    match (node, value) {
        (PolicyNode::Encrypted(field), _) => encrypt_field(value, field, path, keys),
        (PolicyNode::Object(obj), Value::Document(doc)) => {
            Ok(Value::Document(encrypt_document(doc, obj, path, keys)?))
        }
        (PolicyNode::Array(items), Value::Array(elements)) => elements
            .iter()
            .enumerate()
            .map(|(i, element)| {
                encrypt_node(element, items, &child_path(path, &i.to_string()), keys)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (PolicyNode::Object(_), other) => {
            Err(Error::type_mismatch(path, BsonType::Object, other.bson_type()))
        }
        (PolicyNode::Array(_), other) => {
            Err(Error::type_mismatch(path, BsonType::Array, other.bson_type()))
        }
    }
}

/// Encrypts one covered value.
pub(crate) fn encrypt_field(
    value: &Value,
    field: &EncryptedField,
    path: &str,
    keys: &mut KeyCache<'_>,
) -> Result<Value, Error> {
    if value.is_encrypted() {
        return Err(Error::TypeMismatch {
            path: path.to_string(),
            expected: field.value_type.map_or_else(|| "plaintext".to_string(), |ty| ty.to_string()),
            actual: "encrypted binData".to_string(),
        });
    }
    if let Some(expected) = field.value_type {
        if value.bson_type() != expected {
            return Err(Error::type_mismatch(path, expected, value.bson_type()));
        }
    }

    let canonical = Zeroizing::new(encode_canonical(value)?);
    let (key_id, dek) = keys.resolve(&field.key)?;
    let blob = encrypt_canonical(dek, key_id, field.algorithm, &canonical)?;
    debug!(path, %key_id, algorithm = %field.algorithm, "encrypted field");
    Ok(Value::Binary(Binary::encrypted(blob.to_bytes())))
}

fn decrypt_document(
    doc: &Document,
    policy: Option<&ObjectPolicy>,
    path: &str,
    keys: &mut KeyCache<'_>,
) -> Result<Document, Error> {
    doc.iter()
        .map(|(key, value)| {
            let node = policy.and_then(|p| p.get(key));
            Ok((key.to_string(), decrypt_node(value, node, &child_path(path, key), keys)?))
        })
        .collect()
}

fn decrypt_node(
    value: &Value,
    node: Option<&PolicyNode>,
    path: &str,
    keys: &mut KeyCache<'_>,
) -> Result<Value, Error> {
    if let Some(bytes) = value.as_encrypted() {
        let plain = decrypt_blob(bytes, path, keys)?;
        let declared = match node {
            Some(PolicyNode::Encrypted(field)) => field.value_type,
            _ => None,
        };
        if let Some(expected) = declared {
            if plain.bson_type() != expected {
                return Err(Error::type_mismatch(path, expected, plain.bson_type()));
            }
        }
        return Ok(plain);
    }

    match value {
        Value::Document(doc) => {
            let obj = match node {
                Some(PolicyNode::Object(obj)) => Some(obj),
                _ => None,
            };
            Ok(Value::Document(decrypt_document(doc, obj, path, keys)?))
        }
        Value::Array(elements) => {
            let items = match node {
                Some(PolicyNode::Array(items)) => Some(items.as_ref()),
                _ => None,
            };
            elements
                .iter()
                .enumerate()
                .map(|(i, element)| {
                    decrypt_node(element, items, &child_path(path, &i.to_string()), keys)
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        other => Ok(other.clone()),
    }
}

/// Decrypts one blob. Header and key lookup failures count as tampering.
fn decrypt_blob(bytes: &[u8], path: &str, keys: &mut KeyCache<'_>) -> Result<Value, Error> {
    let blob = CiphertextBlob::from_bytes(bytes).map_err(|e| {
        warn!(path, error = %e, "rejecting malformed ciphertext");
        Error::AuthenticationFailed
    })?;

    let dek = match keys.by_id(blob.key_id()) {
        Ok(dek) => dek,
        Err(Error::KeyNotFound(_)) => {
            warn!(path, key_id = %blob.key_id(), "ciphertext names an unknown data key");
            return Err(Error::AuthenticationFailed);
        }
        Err(e) => return Err(e),
    };

    let plaintext = decrypt_canonical(dek, &blob).map_err(|e| {
        if matches!(e, Error::AuthenticationFailed) {
            warn!(path, key_id = %blob.key_id(), "ciphertext failed authentication");
        }
        e
    })?;
    decode_canonical(&plaintext)
}
