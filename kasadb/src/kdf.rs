//! Data key generation and key derivation using HKDF.
//!
//! A data encryption key (DEK) is 64 random bytes split into two halves:
//! an AES-256-GCM encryption key and an HMAC-SHA-512 key used to derive
//! deterministic IVs.

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

use crate::error::Error;

/// DEK size in bytes (512 bits).
pub const DEK_SIZE: usize = 64;

/// Size of each half of a DEK.
pub const SUBKEY_SIZE: usize = 32;

/// Generates a random DEK for envelope encryption.
///
/// This DEK must be wrapped with a master key before storage.
///
/// # Example
///
/// ```
/// use kasadb::kdf::{generate_dek, DEK_SIZE};
/// use secrecy::ExposeSecret;
///
/// let dek = generate_dek();
/// assert_eq!(dek.expose_secret().len(), DEK_SIZE);
/// ```
#[must_use]
pub fn generate_dek() -> SecretVec<u8> {
    let mut dek = vec![0u8; DEK_SIZE];
    OsRng.fill_bytes(&mut dek);
    SecretVec::new(dek)
}

/// Borrowed halves of an unwrapped DEK.
pub struct DekParts<'a> {
    /// AES-256-GCM key
    pub enc_key: &'a [u8],
    /// HMAC-SHA-512 key for IV derivation
    pub mac_key: &'a [u8],
}

/// Splits an unwrapped DEK into its encryption and MAC halves.
///
/// # Errors
///
/// Returns `Error::InvalidKeyLength` if the key is not `DEK_SIZE` bytes.
pub fn split_dek(dek: &SecretVec<u8>) -> Result<DekParts<'_>, Error> {
    let bytes = dek.expose_secret();
    if bytes.len() != DEK_SIZE {
        return Err(Error::InvalidKeyLength { expected: DEK_SIZE, actual: bytes.len() });
    }
    let (enc_key, mac_key) = bytes.split_at(SUBKEY_SIZE);
    Ok(DekParts { enc_key, mac_key })
}

/// Derives a 32-byte key from input key material with HKDF-SHA256.
///
/// The `info` string provides domain separation between uses of the same
/// master secret.
///
/// # Errors
///
/// Returns `Error::KeyDerivation` if the derivation fails.
///
/// # Example
///
/// ```
/// use kasadb::kdf::derive_key;
/// use secrecy::SecretVec;
///
/// let master = SecretVec::new(vec![0u8; 96]);
/// let key = derive_key(&master, b"kasadb-local-wrap").expect("derivation failed");
/// ```
pub fn derive_key(ikm: &SecretVec<u8>, info: &[u8]) -> Result<SecretVec<u8>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm.expose_secret());
    let mut key = vec![0u8; SUBKEY_SIZE];
    hkdf.expand(info, &mut key).map_err(|_| Error::KeyDerivation)?;
    Ok(SecretVec::new(key))
}
