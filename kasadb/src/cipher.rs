//! Authenticated encryption of canonical field bytes.
//!
//! Both algorithms share one AEAD (AES-256-GCM with a 16-byte IV) and differ
//! only in where the IV comes from:
//!
//! - **Deterministic**: `HMAC-SHA512(mac_key, aad || plaintext)`, so equal
//!   plaintexts under one key give byte-identical blobs
//! - **Random**: 16 bytes from the OS RNG, so blobs never repeat
//!
//! # Security Warning
//!
//! Deterministic encryption reveals equality patterns. Use it only for fields
//! that must support equality queries.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use secrecy::SecretVec;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::ciphertext::{associated_data, Algorithm, CiphertextBlob};
use crate::derivation::{derive_iv, IV_SIZE};
use crate::error::Error;
use crate::kdf::split_dek;

/// AES-256-GCM with a 128-bit IV.
type FieldCipher = AesGcm<Aes256, U16>;

/// Encrypts canonical plaintext bytes under an unwrapped DEK.
///
/// # Arguments
///
/// * `dek` - The unwrapped data key
/// * `key_id` - Id of the data key, recorded in the blob
/// * `algorithm` - Deterministic or random IV selection
/// * `canonical` - Canonical bytes of the value
///
/// # Errors
///
/// Returns `Error::InvalidKeyLength` for a malformed DEK and
/// `Error::EncryptionFailed` if the cipher fails.
pub fn encrypt_canonical(
    dek: &SecretVec<u8>,
    key_id: Uuid,
    algorithm: Algorithm,
    canonical: &[u8],
) -> Result<CiphertextBlob, Error> {
    let parts = split_dek(dek)?;
    let aad = associated_data(algorithm, key_id);

    let iv = match algorithm {
        Algorithm::Deterministic => derive_iv(parts.mac_key, &aad, canonical)?,
        Algorithm::Random => {
            let mut iv = [0u8; IV_SIZE];
            OsRng.fill_bytes(&mut iv);
            iv
        }
    };

    let cipher = FieldCipher::new_from_slice(parts.enc_key)
        .map_err(|e| Error::EncryptionFailed(format!("invalid DEK: {e}")))?;
    let payload = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), Payload { msg: canonical, aad: &aad })
        .map_err(|e| Error::EncryptionFailed(format!("AES-256-GCM encryption failed: {e}")))?;

    Ok(CiphertextBlob::new(algorithm, key_id, iv, payload))
}

/// Decrypts a blob back to canonical plaintext bytes.
///
/// For deterministic blobs the IV is recomputed from the recovered plaintext
/// and must match the one carried in the blob.
///
/// # Errors
///
/// Returns `Error::AuthenticationFailed` if the tag or the synthetic IV does
/// not verify.
pub fn decrypt_canonical(
    dek: &SecretVec<u8>,
    blob: &CiphertextBlob,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let parts = split_dek(dek)?;
    let aad = blob.aad();

    let cipher = FieldCipher::new_from_slice(parts.enc_key)
        .map_err(|e| Error::EncryptionFailed(format!("invalid DEK: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(blob.iv()), Payload { msg: blob.payload(), aad: &aad })
        .map(Zeroizing::new)
        .map_err(|_| Error::AuthenticationFailed)?;

    if blob.algorithm() == Algorithm::Deterministic {
        let expected = derive_iv(parts.mac_key, &aad, &plaintext)?;
        let diff = expected.iter().zip(blob.iv()).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(Error::AuthenticationFailed);
        }
    }

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::generate_dek;

    fn key_id() -> Uuid {
        Uuid::from_bytes([0x11; 16])
    }

    #[test]
    fn test_deterministic_encryption() {
        let dek = generate_dek();
        let ct1 = encrypt_canonical(&dek, key_id(), Algorithm::Deterministic, b"alice").unwrap();
        let ct2 = encrypt_canonical(&dek, key_id(), Algorithm::Deterministic, b"alice").unwrap();

        assert_eq!(ct1.to_bytes(), ct2.to_bytes(), "Encryption must be deterministic");
        assert_eq!(&*decrypt_canonical(&dek, &ct1).unwrap(), b"alice");
    }

    #[test]
    fn test_deterministic_different_plaintexts() {
        let dek = generate_dek();
        let ct1 = encrypt_canonical(&dek, key_id(), Algorithm::Deterministic, b"alice").unwrap();
        let ct2 = encrypt_canonical(&dek, key_id(), Algorithm::Deterministic, b"bob").unwrap();
        assert_ne!(ct1.to_bytes(), ct2.to_bytes());
    }

    #[test]
    fn test_deterministic_different_keys() {
        let det = Algorithm::Deterministic;
        let ct1 = encrypt_canonical(&generate_dek(), key_id(), det, b"x").unwrap();
        let ct2 = encrypt_canonical(&generate_dek(), key_id(), det, b"x").unwrap();
        assert_ne!(ct1.payload(), ct2.payload());
    }

    #[test]
    fn test_random_encryption_never_repeats() {
        let dek = generate_dek();
        let ct1 = encrypt_canonical(&dek, key_id(), Algorithm::Random, b"AB+").unwrap();
        let ct2 = encrypt_canonical(&dek, key_id(), Algorithm::Random, b"AB+").unwrap();

        assert_ne!(ct1.iv(), ct2.iv());
        assert_ne!(ct1.to_bytes(), ct2.to_bytes());
        assert_eq!(&*decrypt_canonical(&dek, &ct1).unwrap(), b"AB+");
        assert_eq!(&*decrypt_canonical(&dek, &ct2).unwrap(), b"AB+");
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let blob = encrypt_canonical(&generate_dek(), key_id(), Algorithm::Random, b"x").unwrap();
        let result = decrypt_canonical(&generate_dek(), &blob);
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_algorithm_swap_fails_authentication() {
        let dek = generate_dek();
        let blob = encrypt_canonical(&dek, key_id(), Algorithm::Deterministic, b"x").unwrap();
        let payload = blob.payload().to_vec();
        let swapped = CiphertextBlob::new(Algorithm::Random, blob.key_id(), *blob.iv(), payload);
        assert!(matches!(decrypt_canonical(&dek, &swapped), Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let dek = generate_dek();
        let blob = encrypt_canonical(&dek, key_id(), Algorithm::Deterministic, b"secret").unwrap();
        let bytes = blob.to_bytes();

        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[i] ^= 1 << bit;
                let outcome = CiphertextBlob::from_bytes(&tampered)
                    .and_then(|b| decrypt_canonical(&dek, &b).map(|_| ()));
                assert!(outcome.is_err(), "flip at byte {i} bit {bit} went undetected");
            }
        }
    }

    #[test]
    fn test_empty_and_large_plaintext() {
        let dek = generate_dek();
        let empty = encrypt_canonical(&dek, key_id(), Algorithm::Random, b"").unwrap();
        assert!(decrypt_canonical(&dek, &empty).unwrap().is_empty());

        let large = vec![0x42; 10_000];
        let blob = encrypt_canonical(&dek, key_id(), Algorithm::Random, &large).unwrap();
        assert_eq!(&*decrypt_canonical(&dek, &blob).unwrap(), &large[..]);
    }

    #[test]
    fn test_short_dek_rejected() {
        let dek = SecretVec::new(vec![0u8; 32]);
        let result = encrypt_canonical(&dek, key_id(), Algorithm::Random, b"x");
        assert!(matches!(result, Err(Error::InvalidKeyLength { .. })));
    }
}
