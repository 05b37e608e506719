//! Digest algorithms selected by protocol version.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::CryptoError;

/// Hash algorithm used for request digests and value digests.
///
/// The numeric tag is the one carried on the wire in front of a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashAlgorithm {
    /// MD5 (protocol < 2.1)
    Md5 = 1,
    /// SHA-1 (protocol 2.1 to 2.6)
    Sha1 = 2,
    /// SHA-256 (protocol >= 2.7)
    Sha256 = 3,
}

impl HashAlgorithm {
    /// Parses the wire tag.
    pub fn from_u8(tag: u8) -> Result<Self, CryptoError> {
        match tag {
            1 => Ok(Self::Md5),
            2 => Ok(Self::Sha1),
            3 => Ok(Self::Sha256),
            other => Err(CryptoError::UnknownAlgorithm(format!("digest tag {other}"))),
        }
    }

    /// Canonical name, as carried in credentials and signature containers.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Parses a name, accepting the common spellings.
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA1" | "SHA-1" => Ok(Self::Sha1),
            "SHA256" | "SHA-256" => Ok(Self::Sha256),
            _ => Err(CryptoError::UnknownAlgorithm(name.to_string())),
        }
    }

    /// Digest length in bytes.
    pub const fn output_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Computes the digest of `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        digest(self, data)
    }
}

/// Computes the digest of `data` under `alg`.
pub fn digest(alg: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match alg {
        HashAlgorithm::Md5 => Md5::digest(data).to_vec(),
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
    }
}
