//! Session ciphers.
//!
//! DES, DESede and AES with PKCS#7 padding. From protocol 2.4 on, messages use
//! CBC with a random IV prepended to the ciphertext; older peers use ECB and
//! carry no IV.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use des::{Des, TdesEde3};
use rand::RngCore;

use super::CryptoError;

/// Symmetric algorithm negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CipherAlgorithm {
    /// Single DES, 8 byte key.
    Des = 1,
    /// Triple DES (EDE3), 24 byte key.
    DesEde = 2,
    /// AES-128, 16 byte key.
    #[default]
    Aes = 3,
}

impl CipherAlgorithm {
    /// Parses the wire tag.
    pub fn from_u8(tag: u8) -> Result<Self, CryptoError> {
        match tag {
            1 => Ok(Self::Des),
            2 => Ok(Self::DesEde),
            3 => Ok(Self::Aes),
            other => Err(CryptoError::UnknownAlgorithm(format!("cipher tag {other}"))),
        }
    }

    /// Required key length in bytes.
    pub const fn key_len(self) -> usize {
        match self {
            Self::Des => 8,
            Self::DesEde => 24,
            Self::Aes => 16,
        }
    }

    /// Block (and IV) length in bytes.
    pub const fn block_len(self) -> usize {
        match self {
            Self::Des | Self::DesEde => 8,
            Self::Aes => 16,
        }
    }

    fn check_key(self, key: &[u8]) -> Result<(), CryptoError> {
        if key.len() != self.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: self.key_len(),
                actual: key.len(),
            });
        }
        Ok(())
    }
}

macro_rules! cbc_encrypt {
    ($cipher:ty, $key:expr, $iv:expr, $pt:expr) => {
        cbc::Encryptor::<$cipher>::new_from_slices($key, $iv)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 0,
                actual: $key.len(),
            })?
            .encrypt_padded_vec_mut::<Pkcs7>($pt)
    };
}

macro_rules! cbc_decrypt {
    ($cipher:ty, $key:expr, $iv:expr, $ct:expr) => {
        cbc::Decryptor::<$cipher>::new_from_slices($key, $iv)
            .map_err(|_| CryptoError::DecryptionFailed)?
            .decrypt_padded_vec_mut::<Pkcs7>($ct)
            .map_err(|_| CryptoError::DecryptionFailed)?
    };
}

macro_rules! ecb_encrypt {
    ($cipher:ty, $key:expr, $pt:expr) => {
        ecb::Encryptor::<$cipher>::new_from_slice($key)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 0,
                actual: $key.len(),
            })?
            .encrypt_padded_vec_mut::<Pkcs7>($pt)
    };
}

macro_rules! ecb_decrypt {
    ($cipher:ty, $key:expr, $ct:expr) => {
        ecb::Decryptor::<$cipher>::new_from_slice($key)
            .map_err(|_| CryptoError::DecryptionFailed)?
            .decrypt_padded_vec_mut::<Pkcs7>($ct)
            .map_err(|_| CryptoError::DecryptionFailed)?
    };
}

/// Encrypts `plaintext` under `key`.
///
/// With `with_iv` a fresh IV is generated and prepended to the output.
pub fn encrypt(
    alg: CipherAlgorithm,
    key: &[u8],
    plaintext: &[u8],
    with_iv: bool,
) -> Result<Vec<u8>, CryptoError> {
    alg.check_key(key)?;

    if !with_iv {
        return Ok(match alg {
            CipherAlgorithm::Des => ecb_encrypt!(Des, key, plaintext),
            CipherAlgorithm::DesEde => ecb_encrypt!(TdesEde3, key, plaintext),
            CipherAlgorithm::Aes => ecb_encrypt!(Aes128, key, plaintext),
        });
    }

    let mut iv = vec![0u8; alg.block_len()];
    rand::thread_rng().fill_bytes(&mut iv);
    let body = match alg {
        CipherAlgorithm::Des => cbc_encrypt!(Des, key, &iv, plaintext),
        CipherAlgorithm::DesEde => cbc_encrypt!(TdesEde3, key, &iv, plaintext),
        CipherAlgorithm::Aes => cbc_encrypt!(Aes128, key, &iv, plaintext),
    };
    iv.extend_from_slice(&body);
    Ok(iv)
}

/// Decrypts the output of [`encrypt`] with the same `with_iv` setting.
pub fn decrypt(
    alg: CipherAlgorithm,
    key: &[u8],
    ciphertext: &[u8],
    with_iv: bool,
) -> Result<Vec<u8>, CryptoError> {
    alg.check_key(key)?;

    if !with_iv {
        return Ok(match alg {
            CipherAlgorithm::Des => ecb_decrypt!(Des, key, ciphertext),
            CipherAlgorithm::DesEde => ecb_decrypt!(TdesEde3, key, ciphertext),
            CipherAlgorithm::Aes => ecb_decrypt!(Aes128, key, ciphertext),
        });
    }

    let block = alg.block_len();
    if ciphertext.len() < block {
        return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
    }
    let (iv, body) = ciphertext.split_at(block);
    Ok(match alg {
        CipherAlgorithm::Des => cbc_decrypt!(Des, key, iv, body),
        CipherAlgorithm::DesEde => cbc_decrypt!(TdesEde3, key, iv, body),
        CipherAlgorithm::Aes => cbc_decrypt!(Aes128, key, iv, body),
    })
}
