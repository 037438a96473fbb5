//! Automatic encryption configuration.
//!
//! ```json
//! {
//!   "keyVaultNamespace": "keyvault.datakeys",
//!   "keyVaultPath": "./datakeys.json",
//!   "kmsProviders": {
//!     "local": { "keyPath": "./master-key.bin" },
//!     "aws": { "region": "us-east-1" }
//!   },
//!   "schemaMap": {
//!     "medicalRecords.patients": { "bsonType": "object", "properties": {} }
//!   },
//!   "bypassAutoEncryption": false
//! }
//! ```
//!
//! Master key providers live in their own crates; this module only carries
//! their settings.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::key_vault::FileKeyVault;
use crate::namespace::Namespace;
use crate::schema::SchemaMap;

/// Settings of the local master key provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalProviderConfig {
    /// File holding the 96-byte master key
    pub key_path: PathBuf,
}

/// Settings of the AWS KMS provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AwsProviderConfig {
    /// Region of the KMS endpoint
    pub region: String,
    /// Endpoint override, e.g. for a local KMS emulator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Configured master key providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KmsProvidersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsProviderConfig>,
}

/// Configuration of automatic encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AutoEncryptionConfig {
    /// Namespace of the key vault collection
    #[serde(default = "Namespace::default_key_vault")]
    pub key_vault_namespace: Namespace,
    /// File backing the key vault
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_vault_path: Option<PathBuf>,
    /// Master key providers
    #[serde(default)]
    pub kms_providers: KmsProvidersConfig,
    /// Encryption schema per namespace
    #[serde(default)]
    pub schema_map: HashMap<Namespace, serde_json::Value>,
    /// Skip encryption of writes and filters; reads are still decrypted
    #[serde(default)]
    pub bypass_auto_encryption: bool,
}

impl Default for AutoEncryptionConfig {
    fn default() -> Self {
        Self {
            key_vault_namespace: Namespace::default_key_vault(),
            key_vault_path: None,
            kms_providers: KmsProvidersConfig::default(),
            schema_map: HashMap::new(),
            bypass_auto_encryption: false,
        }
    }
}

impl AutoEncryptionConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the JSON is malformed or has unknown keys.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a configuration file.
    ///
    /// Relative paths inside the file are resolved against its directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_json_str(&contents)?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        debug!(
            path = %path.display(),
            namespaces = config.schema_map.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.key_vault_path.as_mut() {
            resolve(p);
        }
        if let Some(local) = self.kms_providers.local.as_mut() {
            resolve(&mut local.key_path);
        }
    }

    /// Compiles the schema map.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if any schema is invalid.
    pub fn compile_schema_map(&self) -> Result<SchemaMap, Error> {
        SchemaMap::compile(&self.schema_map)
    }

    /// Opens the file-backed key vault.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no `keyVaultPath` is set, and
    /// `Error::StorageUnavailable` if the file cannot be read.
    pub fn open_key_vault(&self) -> Result<FileKeyVault, Error> {
        let path = self
            .key_vault_path
            .as_ref()
            .ok_or_else(|| Error::Config("keyVaultPath is not set".to_string()))?;
        FileKeyVault::open(path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::patients_schema;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = AutoEncryptionConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AutoEncryptionConfig::default());
        assert_eq!(config.key_vault_namespace.to_string(), "keyvault.datakeys");
        assert!(!config.bypass_auto_encryption);
    }

    #[test]
    fn test_full_config() {
        let json = json!({
            "keyVaultNamespace": "encryption.__keyVault",
            "keyVaultPath": "/var/lib/kasadb/keys.json",
            "kmsProviders": {
                "local": { "keyPath": "/etc/kasadb/master.key" },
                "aws": { "region": "eu-central-1", "endpoint": "http://localhost:4566" }
            },
            "schemaMap": { "medicalRecords.patients": patients_schema() },
            "bypassAutoEncryption": true
        });
        let config = AutoEncryptionConfig::from_json_str(&json.to_string()).unwrap();

        assert_eq!(config.key_vault_namespace.db(), "encryption");
        let aws = config.kms_providers.aws.as_ref().unwrap();
        assert_eq!(aws.endpoint.as_deref(), Some("http://localhost:4566"));
        assert!(config.bypass_auto_encryption);

        let schemas = config.compile_schema_map().unwrap();
        assert!(schemas.get(&"medicalRecords.patients".parse().unwrap()).is_some());
    }

    #[test]
    fn test_invalid_configs() {
        for bad in [
            r#"{"keyVaultNamespace": "nodot"}"#,
            r#"{"unknown": 1}"#,
            r#"{"kmsProviders": {"gcp": {}}}"#,
            r#"{"schemaMap": {"bad": {}}}"#,
            "not json",
        ] {
            let result = AutoEncryptionConfig::from_json_str(bad);
            assert!(matches!(result, Err(Error::Config(_))), "{bad}");
        }
    }

    #[test]
    fn test_from_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kasadb.json");
        fs::write(
            &path,
            r#"{
                "keyVaultPath": "keys.json",
                "kmsProviders": {"local": {"keyPath": "/abs/master.key"}}
            }"#,
        )
        .unwrap();

        let config = AutoEncryptionConfig::from_file(&path).unwrap();
        assert_eq!(config.key_vault_path.as_deref(), Some(dir.path().join("keys.json").as_path()));
        assert_eq!(config.kms_providers.local.unwrap().key_path, PathBuf::from("/abs/master.key"));

        assert!(matches!(
            AutoEncryptionConfig::from_file(dir.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_open_key_vault() {
        assert!(matches!(AutoEncryptionConfig::default().open_key_vault(), Err(Error::Config(_))));

        let dir = tempfile::tempdir().unwrap();
        let config = AutoEncryptionConfig {
            key_vault_path: Some(dir.path().join("keys.json")),
            ..AutoEncryptionConfig::default()
        };
        assert!(config.open_key_vault().is_ok());
    }
}
