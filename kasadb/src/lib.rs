//! # `KasaDB`
//!
//! Client-side field level encryption for document stores, using envelope
//! encryption and queryable deterministic fields.
//!
//! ## Features
//!
//! - Schema-driven encryption of individual document fields
//! - Deterministic encryption (AES-256-GCM with an HMAC-SHA-512 synthetic IV)
//!   for fields that must support equality queries
//! - Randomized encryption for everything else
//! - Envelope encryption: data keys wrapped by a local or AWS KMS master key
//! - Query rewriting that encrypts equality literals and rejects predicates
//!   encrypted fields cannot answer
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kasadb::prelude::*;
//! use kasadb_key_file::FileKeyProvider;
//!
//! let providers = KmsProviders::new().with(FileKeyProvider::new("./master.key")?);
//! let client = ClientEncryption::new(Arc::new(MemoryKeyVault::new()), providers);
//! client.create_data_key(MasterKeyRef::Local, ["patients-key"])?;
//!
//! let schemas = SchemaMap::compile(&config.schema_map)?;
//! let auto = Arc::new(AutoEncrypter::new(client.encrypter().clone(), schemas));
//! let ns = "medicalRecords.patients".parse()?;
//! let patients = EncryptedCollection::new(auto, ns, MemoryCollection::new());
//!
//! patients.insert_one(&doc)?;
//! let found = patients.find(&filter)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cipher;
pub mod ciphertext;
pub mod client;
pub mod codec;
pub mod config;
pub mod data_key;
pub mod derivation;
pub mod engine;
pub mod error;
pub mod kdf;
pub mod key_provider;
pub mod key_vault;
pub mod namespace;
pub mod query;
pub mod schema;
pub mod store;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::ciphertext::Algorithm;
    pub use crate::client::{AutoEncrypter, ClientEncryption, EncryptedCollection};
    pub use crate::config::AutoEncryptionConfig;
    pub use crate::data_key::{DataKey, KeyRef};
    pub use crate::engine::Encrypter;
    pub use crate::error::{Error, KeyProviderError, SchemaError};
    pub use crate::key_provider::{KeyProvider, KmsProviders, MasterKeyRef, ProviderKind};
    pub use crate::key_vault::{FileKeyVault, KeyVault, MemoryKeyVault};
    pub use crate::namespace::Namespace;
    pub use crate::query::{Condition, Predicate};
    pub use crate::schema::{FieldEncryptionPolicy, SchemaMap};
    pub use crate::store::{Collection, MemoryCollection};
    pub use crate::value::{Binary, BsonType, Document, Value};
}
