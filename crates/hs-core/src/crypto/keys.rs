//! Public and private keys for signatures and key exchange.
//!
//! Keys travel inside `HS_PUBKEY` values and site records using the public key
//! record layout: key type, a u16 of flags, then the algorithm parameters as
//! length-prefixed big-endian integers.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use signature::{DigestSigner, DigestVerifier, SignatureEncoding, Signer, Verifier};
use sm2::elliptic_curve::sec1::ToEncodedPoint;

use super::CryptoError;
use crate::encoding::{read_byte_array, write_byte_array, WireDecode};

/// Key type tag of an RSA public key record.
pub const RSA_KEY_TYPE: &[u8] = b"RSA_PUB_KEY";
/// Key type tag of a DSA public key record.
pub const DSA_KEY_TYPE: &[u8] = b"DSA_PUB_KEY";
/// Key type tag of an SM2 public key record.
pub const SM2_KEY_TYPE: &[u8] = b"SM2_PUB_KEY";

/// Signature scheme, named as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    /// RSA PKCS#1 v1.5 over SHA-1
    Sha1WithRsa,
    /// RSA PKCS#1 v1.5 over SHA-256
    Sha256WithRsa,
    /// DSA over SHA-1
    Sha1WithDsa,
    /// DSA over SHA-256
    Sha256WithDsa,
    /// SM2 over the hex-encoded SM3 digest
    Sm3WithSm2,
}

impl SignatureAlgorithm {
    /// Wire name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1WithRsa => "SHA1withRSA",
            Self::Sha256WithRsa => "SHA256withRSA",
            Self::Sha1WithDsa => "SHA1withDSA",
            Self::Sha256WithDsa => "SHA256withDSA",
            Self::Sm3WithSm2 => "SM3withSM2",
        }
    }

    /// Parses a wire name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        [
            Self::Sha1WithRsa,
            Self::Sha256WithRsa,
            Self::Sha1WithDsa,
            Self::Sha256WithDsa,
            Self::Sm3WithSm2,
        ]
        .into_iter()
        .find(|alg| alg.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| CryptoError::UnknownAlgorithm(name.to_string()))
    }
}

/// Message actually signed by SM2: the hex encoding of the SM3 digest.
fn sm2_message(data: &[u8]) -> Vec<u8> {
    hex::encode(sm3::Sm3::digest(data)).into_bytes()
}

fn sm2_distid(signer_id: &[u8]) -> String {
    String::from_utf8_lossy(signer_id).into_owned()
}

/// A public key able to verify signatures.
#[derive(Clone)]
pub enum PublicKey {
    /// RSA
    Rsa(RsaPublicKey),
    /// DSA
    Dsa(dsa::VerifyingKey),
    /// SM2
    Sm2(sm2::PublicKey),
}

impl PublicKey {
    /// Signature algorithm used by default with this key.
    pub fn default_algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Rsa(_) => SignatureAlgorithm::Sha256WithRsa,
            Self::Dsa(_) => SignatureAlgorithm::Sha256WithDsa,
            Self::Sm2(_) => SignatureAlgorithm::Sm3WithSm2,
        }
    }

    /// Encodes the public key record.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Rsa(key) => {
                write_byte_array(&mut buf, RSA_KEY_TYPE);
                buf.put_u16(0);
                write_byte_array(&mut buf, &key.e().to_bytes_be());
                write_byte_array(&mut buf, &key.n().to_bytes_be());
            }
            Self::Dsa(key) => {
                let c = key.components();
                write_byte_array(&mut buf, DSA_KEY_TYPE);
                buf.put_u16(0);
                write_byte_array(&mut buf, &c.q().to_bytes_be());
                write_byte_array(&mut buf, &c.p().to_bytes_be());
                write_byte_array(&mut buf, &c.g().to_bytes_be());
                write_byte_array(&mut buf, &key.y().to_bytes_be());
            }
            Self::Sm2(key) => {
                write_byte_array(&mut buf, SM2_KEY_TYPE);
                buf.put_u16(0);
                write_byte_array(&mut buf, key.to_encoded_point(false).as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decodes a public key record.
    pub fn decode(record: &[u8]) -> Result<Self, CryptoError> {
        let bad = |e: crate::DecodeError| CryptoError::InvalidKey(e.to_string());
        let mut buf = Bytes::copy_from_slice(record);
        let key_type = read_byte_array(&mut buf).map_err(bad)?;
        let _flags = u16::decode(&mut buf).map_err(bad)?;

        match key_type.as_ref() {
            RSA_KEY_TYPE => {
                let e = read_byte_array(&mut buf).map_err(bad)?;
                let n = read_byte_array(&mut buf).map_err(bad)?;
                let key = RsaPublicKey::new(
                    rsa::BigUint::from_bytes_be(&n),
                    rsa::BigUint::from_bytes_be(&e),
                )
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                Ok(Self::Rsa(key))
            }
            DSA_KEY_TYPE => {
                let q = read_byte_array(&mut buf).map_err(bad)?;
                let p = read_byte_array(&mut buf).map_err(bad)?;
                let g = read_byte_array(&mut buf).map_err(bad)?;
                let y = read_byte_array(&mut buf).map_err(bad)?;
                let components = dsa::Components::from_components(
                    dsa::BigUint::from_bytes_be(&p),
                    dsa::BigUint::from_bytes_be(&q),
                    dsa::BigUint::from_bytes_be(&g),
                )
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                let key =
                    dsa::VerifyingKey::from_components(components, dsa::BigUint::from_bytes_be(&y))
                        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                Ok(Self::Dsa(key))
            }
            SM2_KEY_TYPE => {
                let point = read_byte_array(&mut buf).map_err(bad)?;
                let key = sm2::PublicKey::from_sec1_bytes(&point)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                Ok(Self::Sm2(key))
            }
            other => Err(CryptoError::UnknownAlgorithm(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Verifies `signature` over `data`.
    ///
    /// `signer_id` is the signer's handle; only SM2 uses it, as the
    /// distinguishing identifier.
    pub fn verify(
        &self,
        alg: SignatureAlgorithm,
        data: &[u8],
        signature: &[u8],
        signer_id: &[u8],
    ) -> Result<(), CryptoError> {
        match (self, alg) {
            (Self::Rsa(key), SignatureAlgorithm::Sha1WithRsa) => key
                .verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data), signature)
                .map_err(|_| CryptoError::InvalidSignature),
            (Self::Rsa(key), SignatureAlgorithm::Sha256WithRsa) => key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data), signature)
                .map_err(|_| CryptoError::InvalidSignature),
            (Self::Dsa(key), SignatureAlgorithm::Sha1WithDsa) => {
                let sig = dsa::Signature::try_from(signature)
                    .map_err(|_| CryptoError::InvalidSignature)?;
                key.verify_digest(Sha1::new_with_prefix(data), &sig)
                    .map_err(|_| CryptoError::InvalidSignature)
            }
            (Self::Dsa(key), SignatureAlgorithm::Sha256WithDsa) => {
                let sig = dsa::Signature::try_from(signature)
                    .map_err(|_| CryptoError::InvalidSignature)?;
                key.verify_digest(Sha256::new_with_prefix(data), &sig)
                    .map_err(|_| CryptoError::InvalidSignature)
            }
            (Self::Sm2(key), SignatureAlgorithm::Sm3WithSm2) => {
                let verifier = sm2::dsa::VerifyingKey::new(&sm2_distid(signer_id), *key)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                let sig = sm2::dsa::Signature::try_from(signature)
                    .map_err(|_| CryptoError::InvalidSignature)?;
                verifier
                    .verify(&sm2_message(data), &sig)
                    .map_err(|_| CryptoError::InvalidSignature)
            }
            (_, alg) => Err(CryptoError::UnknownAlgorithm(format!(
                "{} does not match key type",
                alg.name()
            ))),
        }
    }

    /// Encrypts a session key for the holder of this key (RSA only).
    pub fn encrypt_key(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Rsa(key) => key
                .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, data)
                .map_err(|e| CryptoError::InvalidKey(e.to_string())),
            _ => Err(CryptoError::UnknownAlgorithm(
                "key encryption requires an RSA key".into(),
            )),
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Rsa(_) => "RSA",
            Self::Dsa(_) => "DSA",
            Self::Sm2(_) => "SM2",
        };
        let digest = Sha256::digest(self.encode());
        write!(f, "PublicKey({kind}, {})", hex::encode(&digest[..8]))
    }
}

/// A private key able to sign.
#[derive(Clone)]
pub enum PrivateKey {
    /// RSA
    Rsa(RsaPrivateKey),
    /// DSA
    Dsa(dsa::SigningKey),
    /// SM2
    Sm2(sm2::SecretKey),
}

impl PrivateKey {
    /// Returns the matching public key.
    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Rsa(key) => PublicKey::Rsa(key.to_public_key()),
            Self::Dsa(key) => PublicKey::Dsa(key.verifying_key().clone()),
            Self::Sm2(key) => PublicKey::Sm2(key.public_key()),
        }
    }

    /// Generates a fresh SM2 key.
    pub fn generate_sm2() -> Self {
        Self::Sm2(sm2::SecretKey::random(&mut rand::rngs::OsRng))
    }

    /// Loads an RSA key from PKCS#8 PEM.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map(Self::Rsa)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Serializes an RSA key as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<String, CryptoError> {
        match self {
            Self::Rsa(key) => key
                .to_pkcs8_pem(LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(|e| CryptoError::InvalidKey(e.to_string())),
            _ => Err(CryptoError::UnknownAlgorithm(
                "PEM export supports RSA keys only".into(),
            )),
        }
    }

    /// Signs with the key's default algorithm.
    pub fn sign(
        &self,
        data: &[u8],
        signer_id: &[u8],
    ) -> Result<(SignatureAlgorithm, Vec<u8>), CryptoError> {
        let alg = self.public_key().default_algorithm();
        Ok((alg, self.sign_with(alg, data, signer_id)?))
    }

    /// Signs `data` with an explicit algorithm.
    pub fn sign_with(
        &self,
        alg: SignatureAlgorithm,
        data: &[u8],
        signer_id: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let failed = |e: signature::Error| CryptoError::SigningFailed(e.to_string());
        match (self, alg) {
            (Self::Rsa(key), SignatureAlgorithm::Sha1WithRsa) => key
                .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data))
                .map_err(|e| CryptoError::SigningFailed(e.to_string())),
            (Self::Rsa(key), SignatureAlgorithm::Sha256WithRsa) => key
                .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data))
                .map_err(|e| CryptoError::SigningFailed(e.to_string())),
            (Self::Dsa(key), SignatureAlgorithm::Sha1WithDsa) => {
                let sig: dsa::Signature =
                    key.try_sign_digest(Sha1::new_with_prefix(data)).map_err(failed)?;
                Ok(sig.to_vec())
            }
            (Self::Dsa(key), SignatureAlgorithm::Sha256WithDsa) => {
                let sig: dsa::Signature =
                    key.try_sign_digest(Sha256::new_with_prefix(data)).map_err(failed)?;
                Ok(sig.to_vec())
            }
            (Self::Sm2(key), SignatureAlgorithm::Sm3WithSm2) => {
                let signer = sm2::dsa::SigningKey::new(&sm2_distid(signer_id), key)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                let sig: sm2::dsa::Signature =
                    signer.try_sign(&sm2_message(data)).map_err(failed)?;
                Ok(sig.to_bytes().to_vec())
            }
            (_, alg) => Err(CryptoError::UnknownAlgorithm(format!(
                "{} does not match key type",
                alg.name()
            ))),
        }
    }

    /// Decrypts a session key encrypted with [`PublicKey::encrypt_key`].
    pub fn decrypt_key(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Rsa(key) => key
                .decrypt(Pkcs1v15Encrypt, data)
                .map_err(|_| CryptoError::DecryptionFailed),
            _ => Err(CryptoError::UnknownAlgorithm(
                "key decryption requires an RSA key".into(),
            )),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(<redacted>, {:?})", self.public_key())
    }
}

/// Generates an RSA key of `bits` bits.
pub fn generate_rsa_key(bits: usize) -> Result<PrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map(PrivateKey::Rsa)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}
