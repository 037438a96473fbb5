//! Master key provider abstraction.
//!
//! Master keys never encrypt documents. They only wrap and unwrap data
//! encryption keys, and only wrapped bytes ever reach the key vault.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use secrecy::SecretVec;
use serde::{Deserialize, Serialize};

use crate::error::KeyProviderError;

/// Kind of master key backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    /// A pre-provisioned secret read from local storage
    Local,
    /// AWS Key Management Service
    Aws,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Aws => f.write_str("aws"),
        }
    }
}

/// Reference to the master key that wrapped a data key.
///
/// Stored alongside every data key so the right provider can unwrap it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum MasterKeyRef {
    /// The local master key
    Local,
    /// A KMS key identified by ARN (or alias) and region
    Aws {
        /// AWS region, e.g. `us-east-1`
        region: String,
        /// Key ARN or alias
        key: String,
        /// Custom KMS endpoint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl MasterKeyRef {
    /// Creates an AWS master key reference.
    #[must_use]
    pub fn aws(region: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Aws { region: region.into(), key: key.into(), endpoint: None }
    }

    /// Returns the provider kind that can use this master key.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Local => ProviderKind::Local,
            Self::Aws { .. } => ProviderKind::Aws,
        }
    }
}

/// Wraps and unwraps data encryption keys with a master key.
///
/// Implementations must be thread-safe (`Send + Sync`) to support
/// concurrent encryption operations. Raw key material passed in or returned
/// must never be persisted or logged.
///
/// # Example
///
/// ```rust,ignore
/// use kasadb::key_provider::{KeyProvider, MasterKeyRef, ProviderKind};
///
/// struct MyProvider;
///
/// impl KeyProvider for MyProvider {
///     fn kind(&self) -> ProviderKind {
///         ProviderKind::Local
///     }
///     // ... wrap_dek / unwrap_dek
/// }
/// ```
pub trait KeyProvider: Send + Sync {
    /// Returns the backend kind this provider serves.
    fn kind(&self) -> ProviderKind;

    /// Wraps (encrypts) a Data Encryption Key (DEK) with the given master key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::WrapFailed`, or a KMS error for remote
    /// backends.
    fn wrap_dek(&self, master_key: &MasterKeyRef, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError>;

    /// Unwraps (decrypts) a Data Encryption Key (DEK) with the given master key.
    ///
    /// # Returns
    ///
    /// Returns the plaintext DEK in a `SecretVec` for memory safety.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::UnwrapFailed`, or a KMS error for remote
    /// backends.
    fn unwrap_dek(
        &self,
        master_key: &MasterKeyRef,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError>;
}

/// Registry of the master key providers available to a client.
///
/// Data keys name their master key; the registry dispatches to the provider
/// of that kind.
#[derive(Clone, Default)]
pub struct KmsProviders {
    providers: HashMap<ProviderKind, Arc<dyn KeyProvider>>,
}

impl KmsProviders {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider, replacing any previous provider of the same kind.
    #[must_use]
    pub fn with(mut self, provider: impl KeyProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    /// Adds a shared provider, replacing any previous provider of the same kind.
    pub fn register(&mut self, provider: Arc<dyn KeyProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Returns the provider for a kind.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::ProviderNotConfigured` if none is registered.
    pub fn get(&self, kind: ProviderKind) -> Result<&dyn KeyProvider, KeyProviderError> {
        self.providers
            .get(&kind)
            .map(|provider| provider.as_ref())
            .ok_or_else(|| KeyProviderError::ProviderNotConfigured(kind.to_string()))
    }

    /// Whether a provider of this kind is registered.
    #[must_use]
    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Wraps a DEK with the provider matching `master_key`.
    ///
    /// # Errors
    ///
    /// Propagates provider errors, or `ProviderNotConfigured`.
    pub fn wrap_dek(
        &self,
        master_key: &MasterKeyRef,
        dek: &[u8],
    ) -> Result<Vec<u8>, KeyProviderError> {
        self.get(master_key.kind())?.wrap_dek(master_key, dek)
    }

    /// Unwraps a DEK with the provider matching `master_key`.
    ///
    /// # Errors
    ///
    /// Propagates provider errors, or `ProviderNotConfigured`.
    pub fn unwrap_dek(
        &self,
        master_key: &MasterKeyRef,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        self.get(master_key.kind())?.unwrap_dek(master_key, wrapped_dek)
    }
}

impl fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.providers.keys().collect();
        kinds.sort();
        f.debug_struct("KmsProviders").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::XorKeyProvider;
    use secrecy::ExposeSecret;

    #[test]
    fn test_master_key_ref_serde() {
        let local = serde_json::to_value(MasterKeyRef::Local).unwrap();
        assert_eq!(local, serde_json::json!({"provider": "local"}));

        let aws = MasterKeyRef::aws("us-east-1", "arn:aws:kms:us-east-1:123456789012:key/abc");
        let json = serde_json::to_value(&aws).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "provider": "aws",
                "region": "us-east-1",
                "key": "arn:aws:kms:us-east-1:123456789012:key/abc",
            })
        );
        assert_eq!(serde_json::from_value::<MasterKeyRef>(json).unwrap(), aws);
    }

    #[test]
    fn test_registry_dispatch() {
        let providers = KmsProviders::new().with(XorKeyProvider::new());
        assert!(providers.contains(ProviderKind::Local));

        let wrapped = providers.wrap_dek(&MasterKeyRef::Local, &[7u8; 64]).unwrap();
        assert_ne!(wrapped, vec![7u8; 64]);
        let dek = providers.unwrap_dek(&MasterKeyRef::Local, &wrapped).unwrap();
        assert_eq!(dek.expose_secret(), &vec![7u8; 64]);
    }

    #[test]
    fn test_registry_missing_provider() {
        let providers = KmsProviders::new().with(XorKeyProvider::new());
        let result = providers.wrap_dek(&MasterKeyRef::aws("eu-west-1", "alias/x"), &[0u8; 64]);
        assert!(matches!(
            result,
            Err(KeyProviderError::ProviderNotConfigured(kind)) if kind == "aws"
        ));
    }
}
