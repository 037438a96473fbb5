//! Ciphertext blob format.
//!
//! Every encrypted field value is replaced by a blob carrying what is needed
//! to decrypt it:
//!
//! ```text
//! [algorithm_id:1][key_id:16][iv:16][ciphertext || tag:N]
//! ```
//!
//! The algorithm id and key id together form the AEAD associated data, so
//! neither can be altered without failing authentication.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::derivation::IV_SIZE;
use crate::error::Error;

/// Size of the fixed blob header.
pub const HEADER_SIZE: usize = 1 + 16 + IV_SIZE;

/// Size of the AEAD authentication tag.
pub const TAG_SIZE: usize = 16;

/// Size of the associated data bound into every blob.
pub const AAD_SIZE: usize = 1 + 16;

/// Field encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Same plaintext and key always give the same ciphertext; queryable by equality
    Deterministic,
    /// Fresh random IV on every encryption; not queryable
    Random,
}

impl Algorithm {
    /// Schema identifier of deterministic encryption.
    pub const DETERMINISTIC_NAME: &'static str = "AEAD_AES_256_GCM_HMAC_SHA_512-Deterministic";

    /// Schema identifier of randomized encryption.
    pub const RANDOM_NAME: &'static str = "AEAD_AES_256_GCM_HMAC_SHA_512-Random";

    /// Returns the one-byte wire identifier.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }

    /// Looks up an algorithm by wire identifier.
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Random),
            _ => None,
        }
    }

    /// Returns the schema identifier.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Deterministic => Self::DETERMINISTIC_NAME,
            Self::Random => Self::RANDOM_NAME,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::DETERMINISTIC_NAME => Ok(Self::Deterministic),
            Self::RANDOM_NAME => Ok(Self::Random),
            other => Err(other.to_string()),
        }
    }
}

/// Builds the associated data bound into a blob.
#[must_use]
pub fn associated_data(algorithm: Algorithm, key_id: Uuid) -> [u8; AAD_SIZE] {
    let mut aad = [0u8; AAD_SIZE];
    aad[0] = algorithm.id();
    aad[1..].copy_from_slice(key_id.as_bytes());
    aad
}

/// A parsed ciphertext blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextBlob {
    algorithm: Algorithm,
    key_id: Uuid,
    iv: [u8; IV_SIZE],
    payload: Vec<u8>,
}

impl CiphertextBlob {
    /// Creates a blob from its parts.
    ///
    /// # Arguments
    ///
    /// * `algorithm` - Algorithm that produced the payload
    /// * `key_id` - Id of the data key used
    /// * `iv` - Derived or random IV
    /// * `payload` - Ciphertext followed by the authentication tag
    #[must_use]
    pub fn new(algorithm: Algorithm, key_id: Uuid, iv: [u8; IV_SIZE], payload: Vec<u8>) -> Self {
        Self { algorithm, key_id, iv, payload }
    }

    /// Returns the algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the data key id.
    #[must_use]
    pub const fn key_id(&self) -> Uuid {
        self.key_id
    }

    /// Returns the IV.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Returns the ciphertext and tag.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the associated data for this blob.
    #[must_use]
    pub fn aad(&self) -> [u8; AAD_SIZE] {
        associated_data(self.algorithm, self.key_id)
    }

    /// Serializes the blob to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.push(self.algorithm.id());
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parses a blob from bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHeader` if the data is too short to hold a
    /// header and a tag, or names an unknown algorithm.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE + TAG_SIZE {
            return Err(Error::InvalidHeader(format!(
                "blob too short: {} bytes (min: {})",
                data.len(),
                HEADER_SIZE + TAG_SIZE
            )));
        }

        let algorithm = Algorithm::from_id(data[0])
            .ok_or_else(|| Error::InvalidHeader(format!("unknown algorithm id: {}", data[0])))?;

        let mut key_id = [0u8; 16];
        key_id.copy_from_slice(&data[1..17]);

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&data[17..HEADER_SIZE]);

        Ok(Self {
            algorithm,
            key_id: Uuid::from_bytes(key_id),
            iv,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CiphertextBlob {
        CiphertextBlob::new(
            Algorithm::Deterministic,
            Uuid::from_bytes([0xAB; 16]),
            [7u8; IV_SIZE],
            vec![1; 40],
        )
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(Algorithm::DETERMINISTIC_NAME.parse(), Ok(Algorithm::Deterministic));
        assert_eq!(Algorithm::RANDOM_NAME.parse(), Ok(Algorithm::Random));
        assert!("AEAD_AES_256_CBC_HMAC_SHA_512-Random".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::from_id(Algorithm::Random.id()), Some(Algorithm::Random));
        assert_eq!(Algorithm::from_id(0), None);
    }

    #[test]
    fn test_blob_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 40);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..17], &[0xAB; 16]);
        assert_eq!(&bytes[17..33], &[7u8; 16]);
    }

    #[test]
    fn test_blob_parse() {
        let blob = sample();
        let parsed = CiphertextBlob::from_bytes(&blob.to_bytes()).unwrap();
        assert_eq!(parsed, blob);
        assert_eq!(parsed.aad()[0], Algorithm::Deterministic.id());
    }

    #[test]
    fn test_blob_truncated() {
        let bytes = sample().to_bytes();
        let result = CiphertextBlob::from_bytes(&bytes[..HEADER_SIZE + TAG_SIZE - 1]);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
        assert!(CiphertextBlob::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_blob_unknown_algorithm() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 99;
        assert!(matches!(CiphertextBlob::from_bytes(&bytes), Err(Error::InvalidHeader(_))));
    }
}
