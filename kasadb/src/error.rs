//! Error types for `KasaDB` operations.

use std::fmt;

use crate::value::BsonType;

/// Main error type for `KasaDB` operations.
///
/// Every failure is reported to the immediate caller; nothing in the engine
/// retries or swallows an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The encryption schema is malformed or uses unsupported features
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// No data key matches the given id or alternate name
    #[error("data key not found: {0}")]
    KeyNotFound(String),

    /// Another data key already owns this alternate name
    #[error("duplicate key alt name: {0}")]
    DuplicateAltName(String),

    /// A data key with this id is already stored
    #[error("duplicate key id: {0}")]
    DuplicateKeyId(uuid::Uuid),

    /// The key vault storage could not be read or written
    #[error("key vault storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Master key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(#[from] KeyProviderError),

    /// A value does not have the type its policy declares
    #[error("type mismatch at '{path}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// Dotted path of the offending field
        path: String,
        /// Type declared by the policy
        expected: String,
        /// Type found in the document
        actual: String,
    },

    /// Authentication tag verification failed (data may be corrupted or tampered)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// The query targets a field that cannot be compared server-side
    #[error("field '{0}' is not queryable")]
    NonQueryableField(String),

    /// The query uses an operator that encrypted fields cannot support
    #[error("unsupported predicate '{operator}' on encrypted field '{path}'")]
    UnsupportedPredicate {
        /// Dotted path of the field
        path: String,
        /// The rejected operator
        operator: String,
    },

    /// The filter document cannot be parsed into a predicate
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext header parsing or serialization failed
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// A plaintext value could not be decoded from its canonical bytes
    #[error("invalid canonical encoding: {0}")]
    InvalidEncoding(String),

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,

    /// Unwrapped key material has the wrong size
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Length found
        actual: usize,
    },

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn type_mismatch(path: &str, expected: BsonType, actual: BsonType) -> Self {
        Self::TypeMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Errors raised while compiling an encryption schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// A keyword outside the encryption-specific set was found
    #[error("unsupported schema keyword '{keyword}' at '{path}'")]
    UnsupportedSchemaKeyword {
        /// Path of the schema node
        path: String,
        /// The rejected keyword
        keyword: String,
    },

    /// An `encrypt` block names no algorithm and none is inherited
    #[error("no algorithm for encrypted field '{0}'")]
    MissingAlgorithm(String),

    /// An algorithm name other than the two supported identifiers
    #[error("unknown algorithm '{algorithm}' at '{path}'")]
    UnknownAlgorithm {
        /// Path of the field
        path: String,
        /// The algorithm string found
        algorithm: String,
    },

    /// Deterministic encryption needs a concrete scalar type
    #[error("deterministic field '{path}' needs a scalar bsonType, found {found}")]
    DeterministicRequiresScalar {
        /// Path of the field
        path: String,
        /// What was declared instead
        found: String,
    },

    /// An encrypted field has no key and no inherited default
    #[error("no keyId for encrypted field '{0}'")]
    MissingKeyId(String),

    /// A `keyId` value has the wrong shape
    #[error("invalid keyId at '{path}': {reason}")]
    InvalidKeyId {
        /// Path of the schema node
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// A `bsonType` value is not recognized
    #[error("invalid bsonType '{found}' at '{path}'")]
    InvalidBsonType {
        /// Path of the schema node
        path: String,
        /// The value found
        found: String,
    },

    /// Structural problem in the schema document
    #[error("malformed schema at '{path}': {reason}")]
    Malformed {
        /// Path of the schema node
        path: String,
        /// What is wrong
        reason: String,
    },
}

/// Errors specific to master key provider operations.
#[derive(Debug)]
pub enum KeyProviderError {
    /// No provider is registered for the master key's kind
    ProviderNotConfigured(String),

    /// The master key reference does not belong to this provider
    MasterKeyMismatch(String),

    /// Master key material could not be loaded
    MasterKeyUnavailable(String),

    /// Remote KMS could not be reached or returned a server error
    KmsUnavailable(String),

    /// Remote KMS refused the request
    KmsAccessDenied(String),

    /// DEK wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed
    UnwrapFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderNotConfigured(kind) => write!(f, "no provider configured for: {kind}"),
            Self::MasterKeyMismatch(msg) => write!(f, "master key mismatch: {msg}"),
            Self::MasterKeyUnavailable(msg) => write!(f, "master key unavailable: {msg}"),
            Self::KmsUnavailable(msg) => write!(f, "KMS unavailable: {msg}"),
            Self::KmsAccessDenied(msg) => write!(f, "KMS access denied: {msg}"),
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
