//! Cryptographic primitives for the Handle protocol.
//!
//! Implements the algorithm suite negotiated by protocol version:
//! - MD5, SHA-1 and SHA-256 request and value digests
//! - HMAC-SHA-1, HMAC-SHA-256, HKDF-SHA-256 and PBKDF2-HMAC-SHA-1
//! - DES, DESede and AES session ciphers (CBC with prepended IV, ECB legacy)
//! - RSA, DSA and SM2 signatures and RSA-wrapped session keys
//! - 1024-bit Diffie-Hellman session key agreement

mod cipher;
mod dh;
mod digest;
mod keys;
mod mac;

use thiserror::Error;

use crate::error::{ErrorKind, HandleError};

pub use cipher::{decrypt, encrypt, CipherAlgorithm};
pub use dh::{DhKeyPair, DhParams};
pub use digest::{digest, HashAlgorithm};
pub use keys::{
    generate_rsa_key, PrivateKey, PublicKey, SignatureAlgorithm, DSA_KEY_TYPE, RSA_KEY_TYPE,
    SM2_KEY_TYPE,
};
pub use mac::{hmac_sha1, hmac_sha256, pbkdf2_hmac_sha1, verify_hmac_sha1, verify_hmac_sha256};

/// Errors raised by the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key has the wrong length for the algorithm
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Ciphertext could not be decrypted or unpadded
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Ciphertext is shorter than the IV
    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// Unknown algorithm identifier or name
    #[error("Unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Key material could not be parsed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signing failed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Signature did not verify
    #[error("Signature verification failed")]
    InvalidSignature,
}

impl From<CryptoError> for HandleError {
    fn from(err: CryptoError) -> Self {
        let kind = match err {
            CryptoError::InvalidKeyLength { .. }
            | CryptoError::DecryptionFailed
            | CryptoError::CiphertextTooShort(_) => ErrorKind::EncryptionError,
            CryptoError::UnknownAlgorithm(_) => ErrorKind::UnknownAlgorithmId,
            CryptoError::InvalidKey(_) => ErrorKind::InvalidValue,
            CryptoError::SigningFailed(_) => ErrorKind::UnableToSignRequest,
            CryptoError::InvalidSignature => ErrorKind::SecurityAlert,
        };
        HandleError::new(kind, err.to_string())
    }
}
