//! File-based master key provider for `KasaDB`.
//!
//! The master key is 96 random bytes kept in a single file with 0600
//! permissions. Data keys are wrapped with ChaCha20-Poly1305 under a wrapping
//! key derived from the master key with HKDF:
//!
//! ```text
//! wrapped = [nonce:12][ciphertext || tag:16]
//! ```
//!
//! Suitable for development and single-host deployments; production setups
//! should prefer a remote KMS.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use kasadb::error::KeyProviderError;
use kasadb::kdf::derive_key;
use kasadb::key_provider::{KeyProvider, MasterKeyRef, ProviderKind};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretVec};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Master key size in bytes.
pub const MASTER_KEY_SIZE: usize = 96;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Authentication tag size.
const TAG_SIZE: usize = 16;

/// HKDF info for the wrapping key.
const WRAP_INFO: &[u8] = b"kasadb-local-wrap";

/// Associated data bound into every wrapped DEK.
const WRAP_AAD: &[u8] = b"kasadb-local-dek";

/// Local master key provider.
///
/// # Example
///
/// ```no_run
/// use kasadb::key_provider::KmsProviders;
/// use kasadb_key_file::FileKeyProvider;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// FileKeyProvider::init("./master.key")?;
/// let providers = KmsProviders::new().with(FileKeyProvider::new("./master.key")?);
/// # Ok(())
/// # }
/// ```
pub struct FileKeyProvider {
    wrapping_key: SecretVec<u8>,
    path: Option<PathBuf>,
}

impl FileKeyProvider {
    /// Loads the master key from a file.
    ///
    /// # Arguments
    ///
    /// * `path` - File written by [`FileKeyProvider::init`]
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::MasterKeyUnavailable` if the file is
    /// missing or does not hold exactly `MASTER_KEY_SIZE` bytes.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let path = path.into();
        let bytes = Zeroizing::new(fs::read(&path).map_err(|e| {
            KeyProviderError::MasterKeyUnavailable(format!("{}: {e}", path.display()))
        })?);
        warn_if_exposed(&path);

        let mut provider = Self::from_secret(SecretVec::new(bytes.to_vec()))?;
        debug!(path = %path.display(), "loaded local master key");
        provider.path = Some(path);
        Ok(provider)
    }

    /// Generates a fresh master key and writes it to a new file.
    ///
    /// The file is created with 0600 permissions on Unix; an existing file is
    /// never overwritten.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::Io` if the file exists or cannot be written.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let path = path.into();
        let mut key = Zeroizing::new(vec![0u8; MASTER_KEY_SIZE]);
        OsRng.fill_bytes(&mut key);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(&key)?;
        file.sync_all()?;
        debug!(path = %path.display(), "created local master key");

        let mut provider = Self::from_secret(SecretVec::new(key.to_vec()))?;
        provider.path = Some(path);
        Ok(provider)
    }

    /// Creates a provider from master key bytes held in memory.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::MasterKeyUnavailable` if the key is not
    /// `MASTER_KEY_SIZE` bytes.
    pub fn from_secret(master_key: SecretVec<u8>) -> Result<Self, KeyProviderError> {
        let len = master_key.expose_secret().len();
        if len != MASTER_KEY_SIZE {
            return Err(KeyProviderError::MasterKeyUnavailable(format!(
                "master key must be {MASTER_KEY_SIZE} bytes, got {len}"
            )));
        }
        let wrapping_key = derive_key(&master_key, WRAP_INFO)
            .map_err(|e| KeyProviderError::MasterKeyUnavailable(e.to_string()))?;
        Ok(Self { wrapping_key, path: None })
    }

    /// Returns the key file this provider was loaded from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, String> {
        ChaCha20Poly1305::new_from_slice(self.wrapping_key.expose_secret())
            .map_err(|e| e.to_string())
    }
}

fn check_local(master_key: &MasterKeyRef) -> Result<(), KeyProviderError> {
    match master_key {
        MasterKeyRef::Local => Ok(()),
        other => Err(KeyProviderError::MasterKeyMismatch(format!(
            "local provider cannot use a {} master key",
            other.kind()
        ))),
    }
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        if meta.permissions().mode() & 0o077 != 0 {
            warn!(path = %path.display(), "master key file is readable by other users");
        }
    }
}

#[cfg(not(unix))]
const fn warn_if_exposed(_path: &Path) {}

impl KeyProvider for FileKeyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn wrap_dek(&self, master_key: &MasterKeyRef, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        check_local(master_key)?;
        let cipher = self.cipher().map_err(KeyProviderError::WrapFailed)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: dek, aad: WRAP_AAD })
            .map_err(|e| {
                KeyProviderError::WrapFailed(format!("ChaCha20-Poly1305 encryption failed: {e}"))
            })?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap_dek(
        &self,
        master_key: &MasterKeyRef,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        check_local(master_key)?;
        if wrapped_dek.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KeyProviderError::UnwrapFailed(format!(
                "wrapped key too short: {} bytes",
                wrapped_dek.len()
            )));
        }
        let cipher = self.cipher().map_err(KeyProviderError::UnwrapFailed)?;

        let (nonce, ciphertext) = wrapped_dek.split_at(NONCE_SIZE);
        let dek = cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: WRAP_AAD })
            .map_err(|_| {
                let reason = "authentication failed; wrong master key?";
                KeyProviderError::UnwrapFailed(reason.to_string())
            })?;
        Ok(SecretVec::new(dek))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider() -> (TempDir, FileKeyProvider) {
        let dir = TempDir::new().unwrap();
        let provider = FileKeyProvider::init(dir.path().join("master.key")).unwrap();
        (dir, provider)
    }

    #[test]
    fn test_init_writes_key_file() {
        let (dir, provider) = provider();
        let path = dir.path().join("master.key");
        assert_eq!(fs::read(&path).unwrap().len(), MASTER_KEY_SIZE);
        assert_eq!(provider.path(), Some(path.as_path()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_init_never_overwrites() {
        let (dir, _) = provider();
        let result = FileKeyProvider::init(dir.path().join("master.key"));
        assert!(matches!(result, Err(KeyProviderError::Io(_))));
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let (_dir, provider) = provider();
        let dek = [0x5Au8; 64];

        let wrapped = provider.wrap_dek(&MasterKeyRef::Local, &dek).unwrap();
        assert_eq!(wrapped.len(), NONCE_SIZE + dek.len() + TAG_SIZE);
        assert_ne!(&wrapped[NONCE_SIZE..NONCE_SIZE + 64], &dek[..]);

        let unwrapped = provider.unwrap_dek(&MasterKeyRef::Local, &wrapped).unwrap();
        assert_eq!(unwrapped.expose_secret(), &dek.to_vec());
    }

    #[test]
    fn test_reload_unwraps_existing_keys() {
        let (dir, provider) = provider();
        let wrapped = provider.wrap_dek(&MasterKeyRef::Local, &[1u8; 64]).unwrap();

        let reloaded = FileKeyProvider::new(dir.path().join("master.key")).unwrap();
        let dek = reloaded.unwrap_dek(&MasterKeyRef::Local, &wrapped).unwrap();
        assert_eq!(dek.expose_secret(), &vec![1u8; 64]);
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let (_a, first) = provider();
        let (_b, second) = provider();
        let wrapped = first.wrap_dek(&MasterKeyRef::Local, &[2u8; 64]).unwrap();
        let result = second.unwrap_dek(&MasterKeyRef::Local, &wrapped);
        assert!(matches!(result, Err(KeyProviderError::UnwrapFailed(_))));
    }

    #[test]
    fn test_tampered_wrapped_key_fails() {
        let (_dir, provider) = provider();
        let mut wrapped = provider.wrap_dek(&MasterKeyRef::Local, &[3u8; 64]).unwrap();
        wrapped[NONCE_SIZE] ^= 1;
        assert!(provider.unwrap_dek(&MasterKeyRef::Local, &wrapped).is_err());
        assert!(provider.unwrap_dek(&MasterKeyRef::Local, &wrapped[..10]).is_err());
    }

    #[test]
    fn test_rejects_remote_master_key() {
        let (_dir, provider) = provider();
        let aws = MasterKeyRef::aws("us-east-1", "alias/k");
        assert!(matches!(
            provider.wrap_dek(&aws, &[0u8; 64]),
            Err(KeyProviderError::MasterKeyMismatch(_))
        ));
    }

    #[test]
    fn test_bad_key_files() {
        let dir = TempDir::new().unwrap();
        let missing = FileKeyProvider::new(dir.path().join("missing.key"));
        assert!(matches!(missing, Err(KeyProviderError::MasterKeyUnavailable(_))));

        let short = dir.path().join("short.key");
        fs::write(&short, [0u8; 32]).unwrap();
        assert!(matches!(
            FileKeyProvider::new(&short),
            Err(KeyProviderError::MasterKeyUnavailable(_))
        ));
    }
}
