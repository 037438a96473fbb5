//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretVec};
use serde_json::json;
use uuid::Uuid;

use crate::ciphertext::Algorithm;
use crate::data_key::DataKey;
use crate::engine::Encrypter;
use crate::error::KeyProviderError;
use crate::kdf::generate_dek;
use crate::key_provider::{KeyProvider, KmsProviders, MasterKeyRef, ProviderKind};
use crate::key_vault::{KeyVault, MemoryKeyVault};
use crate::schema::FieldEncryptionPolicy;
use crate::value::Document;

/// Local provider that XORs key material with a fixed pad.
pub struct XorKeyProvider {
    pad: [u8; 64],
    unwraps: AtomicUsize,
}

impl XorKeyProvider {
    pub fn new() -> Self {
        let mut pad = [0u8; 64];
        for (i, byte) in pad.iter_mut().enumerate() {
            *byte = 0xA5 ^ u8::try_from(i).unwrap_or(0);
        }
        Self { pad, unwraps: AtomicUsize::new(0) }
    }

    /// Number of successful unwrap calls so far.
    pub fn unwrap_count(&self) -> usize {
        self.unwraps.load(Ordering::SeqCst)
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter().zip(self.pad.iter().cycle()).map(|(d, p)| d ^ p).collect()
    }
}

impl KeyProvider for XorKeyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn wrap_dek(&self, master_key: &MasterKeyRef, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        if master_key.kind() != ProviderKind::Local {
            return Err(KeyProviderError::MasterKeyMismatch(master_key.kind().to_string()));
        }
        Ok(self.apply(dek))
    }

    fn unwrap_dek(
        &self,
        master_key: &MasterKeyRef,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        if master_key.kind() != ProviderKind::Local {
            return Err(KeyProviderError::MasterKeyMismatch(master_key.kind().to_string()));
        }
        self.unwraps.fetch_add(1, Ordering::SeqCst);
        Ok(SecretVec::new(self.apply(wrapped_dek)))
    }
}

/// Stores a fresh local data key under the given alt names.
pub fn put_local_key(vault: &MemoryKeyVault, alt_names: &[&str]) -> Uuid {
    let wrapped = XorKeyProvider::new()
        .wrap_dek(&MasterKeyRef::Local, generate_dek().expose_secret())
        .unwrap();
    vault
        .put_key(DataKey::new(wrapped, MasterKeyRef::Local, alt_names.iter().copied()))
        .unwrap()
}

/// An encrypter over an in-memory vault holding one key named `patients-key`.
pub fn encrypter() -> (Encrypter<MemoryKeyVault>, Uuid) {
    let vault = MemoryKeyVault::new();
    let id = put_local_key(&vault, &["patients-key"]);
    let providers = KmsProviders::new().with(XorKeyProvider::new());
    (Encrypter::new(Arc::new(vault), providers), id)
}

/// Schema of the medical records example.
pub fn patients_schema() -> serde_json::Value {
    json!({
        "bsonType": "object",
        "encryptMetadata": { "keyId": "patients-key" },
        "properties": {
            "name": { "bsonType": "string" },
            "ssn": { "encrypt": { "bsonType": "int", "algorithm": Algorithm::DETERMINISTIC_NAME } },
            "bloodType": {
                "encrypt": { "bsonType": "string", "algorithm": Algorithm::RANDOM_NAME }
            },
            "medicalRecords": {
                "encrypt": { "bsonType": "array", "algorithm": Algorithm::RANDOM_NAME }
            },
            "insurance": {
                "bsonType": "object",
                "properties": {
                    "policyNumber": {
                        "encrypt": { "bsonType": "int", "algorithm": Algorithm::DETERMINISTIC_NAME }
                    },
                    "provider": { "bsonType": "string" }
                }
            }
        }
    })
}

pub fn patients_policy() -> FieldEncryptionPolicy {
    FieldEncryptionPolicy::compile(&patients_schema()).unwrap()
}

/// The "Jon Doe" patient record.
pub fn patient() -> Document {
    Document::from_json(json!({
        "name": "Jon Doe",
        "ssn": 241_014_209,
        "bloodType": "AB+",
        "medicalRecords": [{ "weight": 180, "bloodPressure": "120/80" }],
        "insurance": { "policyNumber": 123_142, "provider": "MaestCare" }
    }))
    .unwrap()
}
