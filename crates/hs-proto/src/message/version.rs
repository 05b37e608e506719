//! Protocol versions and the behavior gated on them.

use std::fmt;

use hs_core::crypto::HashAlgorithm;
use hs_core::{MAJOR_VERSION, MINOR_VERSION};

/// A negotiated `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl ProtocolVersion {
    /// The highest version this implementation speaks.
    pub const CURRENT: ProtocolVersion = ProtocolVersion::new(MAJOR_VERSION, MINOR_VERSION);

    /// Creates a version.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Packs into the one-byte suggested-version field.
    pub fn to_suggested_byte(self) -> u8 {
        (self.major << 4) | (self.minor & 0x0f)
    }

    /// Unpacks the one-byte suggested-version field.
    pub fn from_suggested_byte(b: u8) -> Self {
        Self::new(b >> 4, b & 0x0f)
    }

    /// True if this version is at least `major.minor`.
    pub fn at_least(self, major: u8, minor: u8) -> bool {
        self >= Self::new(major, minor)
    }

    /// Request digest algorithm: MD5 before 2.1, SHA-1 through 2.6,
    /// SHA-256 from 2.7.
    pub fn digest_algorithm(self) -> HashAlgorithm {
        if !self.at_least(2, 1) {
            HashAlgorithm::Md5
        } else if !self.at_least(2, 7) {
            HashAlgorithm::Sha1
        } else {
            HashAlgorithm::Sha256
        }
    }

    /// Session ciphers prepend an IV from 2.4 on.
    pub fn uses_cipher_iv(self) -> bool {
        self.at_least(2, 4)
    }

    /// Non-public values must travel encrypted from 2.8 on.
    pub fn requires_private_value_encryption(self) -> bool {
        self.at_least(2, 8)
    }

    /// Version a server answers with: the lower of the client's and its own.
    pub fn negotiate(client: Self, server_max: Self) -> Self {
        client.min(server_max)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
