//! Message credentials: signatures and session MACs.
//!
//! The credential section follows the body. It covers the header and body
//! bytes of the message. `HS_SIGNED` credentials are public-key signatures by
//! the signer named in the credential; `HS_MAC` credentials are HMAC-SHA-256
//! tags under the session key and carry the session counter used for replay
//! protection.

use bytes::{BufMut, Bytes, BytesMut};
use hs_core::crypto::{hmac_sha256, verify_hmac_sha256, CryptoError, PrivateKey, PublicKey, SignatureAlgorithm};
use hs_core::encoding::{read_byte_array, write_byte_array};
use hs_core::{DecodeError, WireDecode, WireEncode};

use crate::value::ValueReference;

/// Credential type of a public-key signature.
pub const CREDENTIAL_TYPE_SIGNED: &str = "HS_SIGNED";
/// Credential type of a session MAC.
pub const CREDENTIAL_TYPE_MAC: &str = "HS_MAC";
/// Algorithm name carried by session MACs.
pub const MAC_ALGORITHM: &str = "HmacSHA256";

const CREDENTIAL_VERSION: u8 = 0;

/// What kind of credential this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Public-key signature.
    Signed,
    /// Session MAC with the per-session counter.
    Mac {
        /// Strictly increasing per session.
        session_counter: u32,
    },
}

/// A credential attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Format version.
    pub version: u8,
    /// Reserved options.
    pub options: u16,
    /// Signer identity.
    pub signer: ValueReference,
    /// Signature or MAC.
    pub kind: CredentialKind,
    /// Algorithm name.
    pub algorithm: String,
    /// Signature or MAC bytes.
    pub signature: Bytes,
}

fn mac_input(data: &[u8], counter: u32) -> Vec<u8> {
    let mut input = Vec::with_capacity(data.len() + 4);
    input.extend_from_slice(data);
    input.extend_from_slice(&counter.to_be_bytes());
    input
}

impl Credential {
    /// Signs `data` with `key` on behalf of `signer`.
    pub fn sign(key: &PrivateKey, signer: ValueReference, data: &[u8]) -> Result<Self, CryptoError> {
        let (alg, signature) = key.sign(data, signer.handle.as_bytes())?;
        Ok(Self {
            version: CREDENTIAL_VERSION,
            options: 0,
            signer,
            kind: CredentialKind::Signed,
            algorithm: alg.name().to_string(),
            signature: Bytes::from(signature),
        })
    }

    /// Computes a session MAC over `data` and the counter.
    pub fn mac(session_key: &[u8], signer: ValueReference, session_counter: u32, data: &[u8]) -> Self {
        let tag = hmac_sha256(session_key, &mac_input(data, session_counter));
        Self {
            version: CREDENTIAL_VERSION,
            options: 0,
            signer,
            kind: CredentialKind::Mac { session_counter },
            algorithm: MAC_ALGORITHM.to_string(),
            signature: Bytes::copy_from_slice(&tag),
        }
    }

    /// Verifies a signed credential.
    pub fn verify_signature(&self, key: &PublicKey, data: &[u8]) -> Result<(), CryptoError> {
        if self.kind != CredentialKind::Signed {
            return Err(CryptoError::InvalidSignature);
        }
        let alg = SignatureAlgorithm::from_name(&self.algorithm)?;
        key.verify(alg, data, &self.signature, self.signer.handle.as_bytes())
    }

    /// Verifies a MAC credential, returning its session counter.
    pub fn verify_mac(&self, session_key: &[u8], data: &[u8]) -> Result<u32, CryptoError> {
        let CredentialKind::Mac { session_counter } = self.kind else {
            return Err(CryptoError::InvalidSignature);
        };
        if !verify_hmac_sha256(session_key, &mac_input(data, session_counter), &self.signature) {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(session_counter)
    }

    /// Session counter, for MAC credentials.
    pub fn session_counter(&self) -> Option<u32> {
        match self.kind {
            CredentialKind::Mac { session_counter } => Some(session_counter),
            CredentialKind::Signed => None,
        }
    }
}

impl WireEncode for Credential {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u16(self.options);
        self.signer.encode(buf);
        let type_name = match self.kind {
            CredentialKind::Signed => CREDENTIAL_TYPE_SIGNED,
            CredentialKind::Mac { .. } => CREDENTIAL_TYPE_MAC,
        };
        type_name.encode(buf);

        let mut signed_info = BytesMut::new();
        self.algorithm.as_str().encode(&mut signed_info);
        if let CredentialKind::Mac { session_counter } = self.kind {
            signed_info.put_u32(session_counter);
        }
        write_byte_array(&mut signed_info, &self.signature);
        write_byte_array(buf, &signed_info);
    }
}

impl WireDecode for Credential {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let version = u8::decode(buf)?;
        let _reserved = u8::decode(buf)?;
        let options = u16::decode(buf)?;
        let signer = ValueReference::decode(buf)?;
        let type_name = String::decode(buf)?;

        let mut signed_info = read_byte_array(buf)?;
        let algorithm = String::decode(&mut signed_info)?;
        let kind = match type_name.as_str() {
            CREDENTIAL_TYPE_SIGNED => CredentialKind::Signed,
            CREDENTIAL_TYPE_MAC => CredentialKind::Mac {
                session_counter: u32::decode(&mut signed_info)?,
            },
            other => return Err(DecodeError::Custom(format!("unknown credential type {other}"))),
        };
        let signature = read_byte_array(&mut signed_info)?;

        Ok(Self {
            version,
            options,
            signer,
            kind,
            algorithm,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_core::crypto::generate_rsa_key;

    #[test]
    fn test_signed_credential() {
        let key = generate_rsa_key(1024).unwrap();
        let signer = ValueReference::new("0.NA/10.1000", 300);
        let cred = Credential::sign(&key, signer, b"header+body").unwrap();
        let decoded = Credential::from_bytes(&cred.to_bytes().to_vec()).unwrap();
        assert_eq!(decoded, cred);
        decoded.verify_signature(&key.public_key(), b"header+body").unwrap();
        assert!(decoded.verify_signature(&key.public_key(), b"other").is_err());
        assert!(decoded.verify_mac(b"k", b"header+body").is_err());
    }

    #[test]
    fn test_mac_credential() {
        let key = [3u8; 16];
        let cred = Credential::mac(&key, ValueReference::new("", 0), 42, b"msg");
        let decoded = Credential::from_bytes(&cred.to_bytes().to_vec()).unwrap();
        assert_eq!(decoded.session_counter(), Some(42));
        assert_eq!(decoded.verify_mac(&key, b"msg").unwrap(), 42);
        assert!(decoded.verify_mac(&[4u8; 16], b"msg").is_err());

        // A counter changed in transit breaks the tag.
        let mut tampered = decoded.clone();
        tampered.kind = CredentialKind::Mac { session_counter: 43 };
        assert!(tampered.verify_mac(&key, b"msg").is_err());
    }
}
