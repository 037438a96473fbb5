//! AWS KMS master key provider for `KasaDB`.
//!
//! Data keys are wrapped and unwrapped by KMS `Encrypt`/`Decrypt` calls; the
//! master key never leaves KMS. The provider owns a single-threaded Tokio
//! runtime so it can serve the synchronous [`KeyProvider`] interface. Each
//! master key is served in its own region, through its own endpoint when it
//! names one.
//!
//! # Example
//!
//! ```rust,no_run
//! use kasadb::prelude::*;
//! use kasadb_kms_aws::AwsKmsProvider;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let providers = KmsProviders::new().with(AwsKmsProvider::new("us-east-1")?);
//! let master_key = MasterKeyRef::aws(
//!     "us-east-1",
//!     "arn:aws:kms:us-east-1:123456789012:key/12345678-1234-1234-1234-123456789012",
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! The provider uses the AWS SDK's default credential chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (~/.aws/credentials)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)
//!
//! Calls block the current thread; do not call them from inside another
//! Tokio runtime.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use kasadb::error::KeyProviderError;
use kasadb::key_provider::{KeyProvider, MasterKeyRef, ProviderKind};
use parking_lot::Mutex;
use secrecy::SecretVec;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Error codes meaning the caller is not allowed to use the key.
const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDeniedException",
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "ExpiredTokenException",
];

/// Errors specific to setting up the AWS KMS provider.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// The Tokio runtime could not be started
    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// Invalid region or endpoint
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<AwsKmsError> for KeyProviderError {
    fn from(err: AwsKmsError) -> Self {
        match err {
            AwsKmsError::Runtime(e) => Self::Io(e),
            AwsKmsError::InvalidConfig(msg) => Self::KmsUnavailable(msg),
        }
    }
}

/// Maps a KMS error code to the provider error taxonomy.
///
/// Authorization failures become `KmsAccessDenied`; everything else,
/// including transport errors without a code, is `KmsUnavailable`.
#[must_use]
pub fn classify_error(code: Option<&str>, message: String) -> KeyProviderError {
    match code {
        Some(code) if ACCESS_DENIED_CODES.contains(&code) => {
            KeyProviderError::KmsAccessDenied(message)
        }
        _ => KeyProviderError::KmsUnavailable(message),
    }
}

/// Client cache key: region and optional endpoint override.
type ClientKey = (String, Option<String>);

/// AWS KMS master key provider.
///
/// Every master key names its own region and may name its own endpoint. A
/// KMS client is built the first time a `(region, endpoint)` pair is used and
/// reused afterwards. Keys without an endpoint use the provider's default
/// endpoint, if one was configured.
pub struct AwsKmsProvider {
    runtime: Runtime,
    region: String,
    endpoint: Option<String>,
    clients: Mutex<HashMap<ClientKey, KmsClient>>,
}

impl AwsKmsProvider {
    /// Creates a provider for a region using the default credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot start or the region is empty.
    pub fn new(region: impl Into<String>) -> Result<Self, AwsKmsError> {
        Self::with_endpoint(region, None)
    }

    /// Creates a provider talking to a custom endpoint, such as a local KMS
    /// emulator.
    ///
    /// # Arguments
    ///
    /// * `region` - Default AWS region; its client is built eagerly
    /// * `endpoint` - Endpoint URL override for keys that do not carry one
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot start or the region is empty.
    pub fn with_endpoint(
        region: impl Into<String>,
        endpoint: Option<String>,
    ) -> Result<Self, AwsKmsError> {
        let region = region.into();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let provider = Self {
            runtime,
            region: region.clone(),
            endpoint: endpoint.clone(),
            clients: Mutex::default(),
        };
        provider.client(&region, endpoint.as_deref())?;
        Ok(provider)
    }

    /// Returns the default region.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Number of KMS clients built so far.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Returns the client for a region and endpoint, building it on first use.
    fn client(&self, region: &str, endpoint: Option<&str>) -> Result<KmsClient, AwsKmsError> {
        if region.is_empty() {
            return Err(AwsKmsError::InvalidConfig("region must not be empty".to_string()));
        }
        let endpoint = endpoint.or(self.endpoint.as_deref()).map(str::to_string);
        let key = (region.to_string(), endpoint);

        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(key.0.clone()));
        let shared = self.runtime.block_on(loader.load());
        let mut config = aws_sdk_kms::config::Builder::from(&shared);
        if let Some(url) = &key.1 {
            config = config.endpoint_url(url);
        }
        debug!(region = %key.0, endpoint = ?key.1, "created AWS KMS client");

        let client = KmsClient::from_conf(config.build());
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn resolve<'a>(
        &self,
        master_key: &'a MasterKeyRef,
    ) -> Result<(KmsClient, &'a str), KeyProviderError> {
        match master_key {
            MasterKeyRef::Aws { region, key, endpoint } => {
                Ok((self.client(region, endpoint.as_deref())?, key))
            }
            MasterKeyRef::Local => Err(KeyProviderError::MasterKeyMismatch(
                "AWS provider cannot use a local master key".to_string(),
            )),
        }
    }
}

fn sdk_error<E>(op: &str, err: &E) -> KeyProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("KMS {op} failed: {}", DisplayErrorContext(err));
    warn!(operation = op, code = ?err.code(), "KMS request failed");
    classify_error(err.code(), message)
}

impl KeyProvider for AwsKmsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn wrap_dek(&self, master_key: &MasterKeyRef, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        let (client, key_id) = self.resolve(master_key)?;
        let request = client.encrypt().key_id(key_id).plaintext(Blob::new(dek.to_vec())).send();
        let response = self.runtime.block_on(request).map_err(|e| sdk_error("Encrypt", &e))?;

        let ciphertext = response
            .ciphertext_blob()
            .ok_or_else(|| KeyProviderError::WrapFailed("no ciphertext returned".to_string()))?;
        debug!(key_id, "wrapped data key with KMS");
        Ok(ciphertext.as_ref().to_vec())
    }

    fn unwrap_dek(
        &self,
        master_key: &MasterKeyRef,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        let (client, key_id) = self.resolve(master_key)?;
        let request =
            client.decrypt().key_id(key_id).ciphertext_blob(Blob::new(wrapped_dek.to_vec())).send();
        let response = self.runtime.block_on(request).map_err(|e| sdk_error("Decrypt", &e))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| KeyProviderError::UnwrapFailed("no plaintext returned".to_string()))?;
        let dek = Zeroizing::new(plaintext.as_ref().to_vec());
        Ok(SecretVec::new(dek.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_access_denied() {
        for code in ACCESS_DENIED_CODES {
            assert!(matches!(
                classify_error(Some(code), "denied".to_string()),
                KeyProviderError::KmsAccessDenied(_)
            ));
        }
    }

    #[test]
    fn test_classify_unavailable() {
        for code in [Some("KMSInternalException"), Some("DependencyTimeoutException"), None] {
            let err = classify_error(code, "down".to_string());
            assert!(matches!(err, KeyProviderError::KmsUnavailable(_)));
        }
    }

    #[test]
    fn test_empty_region_rejected() {
        assert!(matches!(AwsKmsProvider::new(""), Err(AwsKmsError::InvalidConfig(_))));
    }

    const EMULATOR: &str = "http://127.0.0.1:4566";

    #[test]
    fn test_local_master_key_rejected() {
        let provider = AwsKmsProvider::with_endpoint("us-east-1", Some(EMULATOR.into())).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Aws);
        assert_eq!(provider.region(), "us-east-1");
        assert!(matches!(
            provider.unwrap_dek(&MasterKeyRef::Local, &[0u8; 64]),
            Err(KeyProviderError::MasterKeyMismatch(_))
        ));
    }

    #[test]
    fn test_client_per_region_and_endpoint() {
        let provider = AwsKmsProvider::with_endpoint("us-east-1", Some(EMULATOR.into())).unwrap();
        assert_eq!(provider.client_count(), 1);

        // Keys without an endpoint fall back to the provider's
        provider.client("us-east-1", None).unwrap();
        assert_eq!(provider.client_count(), 1);

        provider.client("eu-west-1", None).unwrap();
        provider.client("eu-west-1", Some("http://127.0.0.1:4567")).unwrap();
        assert_eq!(provider.client_count(), 3);

        provider.client("eu-west-1", None).unwrap();
        assert_eq!(provider.client_count(), 3);
    }

    #[test]
    fn test_master_key_with_empty_region_rejected() {
        let provider = AwsKmsProvider::with_endpoint("us-east-1", Some(EMULATOR.into())).unwrap();
        let key = MasterKeyRef::aws("", "alias/k");
        assert!(matches!(
            provider.wrap_dek(&key, &[0u8; 64]),
            Err(KeyProviderError::KmsUnavailable(_))
        ));
        assert_eq!(provider.client_count(), 1);
    }

    #[test]
    fn test_error_conversion() {
        let io = AwsKmsError::Runtime(std::io::Error::other("no threads"));
        assert!(matches!(KeyProviderError::from(io), KeyProviderError::Io(_)));
    }
}
