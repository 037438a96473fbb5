//! Synthetic IV derivation for deterministic encryption.
//!
//! A deterministic IV is a keyed MAC over the associated data and the
//! canonical plaintext, so equal plaintexts under one key share an IV (and
//! therefore a ciphertext) while distinct plaintexts get effectively unique
//! IVs.

use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::error::Error;

type HmacSha512 = Hmac<Sha512>;

/// IV size carried in every ciphertext blob (16 bytes).
pub const IV_SIZE: usize = 16;

/// Derives the deterministic IV for a value.
///
/// Computed as `HMAC-SHA512(mac_key, aad || canonical)[..16]`.
///
/// # Arguments
///
/// * `mac_key` - The MAC half of the data key
/// * `aad` - Associated data of the blob (algorithm id and key id)
/// * `canonical` - Canonical plaintext bytes
///
/// # Errors
///
/// Returns `Error::EncryptionFailed` if the MAC key is rejected.
///
/// # Example
///
/// ```
/// use kasadb::derivation::derive_iv;
///
/// let iv1 = derive_iv(&[7u8; 32], b"aad", b"value").unwrap();
/// let iv2 = derive_iv(&[7u8; 32], b"aad", b"value").unwrap();
/// assert_eq!(iv1, iv2);
/// ```
pub fn derive_iv(mac_key: &[u8], aad: &[u8], canonical: &[u8]) -> Result<[u8; IV_SIZE], Error> {
    let mut mac = HmacSha512::new_from_slice(mac_key)
        .map_err(|e| Error::EncryptionFailed(format!("invalid MAC key: {e}")))?;
    mac.update(aad);
    mac.update(canonical);

    let tag = mac.finalize().into_bytes();
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&tag[..IV_SIZE]);
    Ok(iv)
}
