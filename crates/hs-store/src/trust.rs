//! Per-value signatures.
//!
//! An `HS_SIGNATURE` value holds a digest container: for each covered value
//! its index and one or more digests of the value encoding past the index
//! and timestamp, signed by a `(handle, index)` key reference. A value set
//! is trusted when every public value is covered by a valid signature from
//! a trusted key.
//!
//! Container layout: version u8, signer reference, handle, digest count
//! u32 + (index u32, count u32 + (algorithm u8, digest bytes)*)*, then the
//! signature algorithm name and signature bytes. The signature covers
//! everything before the algorithm name.

use std::collections::{BTreeSet, HashMap};

use bytes::{BufMut, Bytes, BytesMut};
use hs_core::crypto::{CryptoError, HashAlgorithm, PrivateKey, PublicKey, SignatureAlgorithm};
use hs_core::encoding::{read_byte_array, read_count, write_byte_array};
use hs_core::{DecodeError, ErrorKind, Handle, HandleError, WireDecode, WireEncode};
use hs_proto::value::types;
use hs_proto::{HandleValue, ValueReference};
use thiserror::Error;
use tracing::{debug, warn};

const CONTAINER_VERSION: u8 = 1;

/// Errors from value trust checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// Container failed to decode
    #[error("malformed signature value: {0}")]
    Malformed(String),

    /// Signature is for another handle
    #[error("signature covers {0}, not this handle")]
    WrongHandle(Handle),

    /// Signer is not in the trusted set
    #[error("signer {0} is not trusted")]
    UntrustedSigner(ValueReference),

    /// Signature does not verify
    #[error("signature by {0} does not verify")]
    BadSignature(ValueReference),

    /// A digest does not match its value
    #[error("digest mismatch for value {0}")]
    DigestMismatch(u32),

    /// Only weak digests present
    #[error("value {0} has no SHA digest")]
    NoShaDigest(u32),

    /// Signature covers a value that is not present
    #[error("signed value {0} is missing")]
    MissingValue(u32),

    /// Values not covered by any valid signature
    #[error("unsigned values: {0:?}")]
    UnsignedValues(Vec<u32>),

    /// Crypto failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<DecodeError> for TrustError {
    fn from(err: DecodeError) -> Self {
        TrustError::Malformed(err.to_string())
    }
}

impl From<TrustError> for HandleError {
    fn from(err: TrustError) -> Self {
        let kind = match err {
            TrustError::UnsignedValues(_) => ErrorKind::MissingOrInvalidSignature,
            _ => ErrorKind::SecurityAlert,
        };
        HandleError::new(kind, err.to_string())
    }
}

/// Digests of one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDigests {
    /// Index of the value.
    pub index: u32,
    /// Digests by algorithm.
    pub digests: Vec<(HashAlgorithm, Bytes)>,
}

impl ValueDigests {
    /// Computes SHA-1 and SHA-256 digests of a value.
    pub fn of(value: &HandleValue) -> Self {
        Self {
            index: value.index,
            digests: [HashAlgorithm::Sha1, HashAlgorithm::Sha256]
                .into_iter()
                .map(|alg| (alg, Bytes::from(value.digest(alg))))
                .collect(),
        }
    }

    /// Checks the digests against `value`. At least one SHA digest must be
    /// present; MD5 alone is not enough.
    pub fn check(&self, value: &HandleValue) -> Result<(), TrustError> {
        let mut found_sha = false;
        for (alg, digest) in &self.digests {
            if value.digest(*alg) != digest.as_ref() {
                return Err(TrustError::DigestMismatch(self.index));
            }
            found_sha |= matches!(alg, HashAlgorithm::Sha1 | HashAlgorithm::Sha256);
        }
        if !found_sha {
            return Err(TrustError::NoShaDigest(self.index));
        }
        Ok(())
    }
}

/// A signed digest container, the data of an `HS_SIGNATURE` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDigests {
    /// Key that signed.
    pub signer: ValueReference,
    /// Handle whose values are covered.
    pub handle: Handle,
    /// Covered values.
    pub values: Vec<ValueDigests>,
    /// Signature algorithm name.
    pub algorithm: String,
    /// Signature over the container.
    pub signature: Bytes,
}

impl SignedDigests {
    /// Signs digests of `values`. Existing `HS_SIGNATURE` values are skipped.
    pub fn create(
        handle: &Handle,
        values: &[HandleValue],
        signer: ValueReference,
        key: &PrivateKey,
    ) -> Result<Self, TrustError> {
        let mut container = Self {
            signer,
            handle: handle.clone(),
            values: values
                .iter()
                .filter(|v| !v.has_type(types::HS_SIGNATURE))
                .map(ValueDigests::of)
                .collect(),
            algorithm: String::new(),
            signature: Bytes::new(),
        };
        let (alg, signature) =
            key.sign(&container.signed_bytes(), container.signer.handle.as_bytes())?;
        container.algorithm = alg.name().to_string();
        container.signature = Bytes::from(signature);
        Ok(container)
    }

    /// Parses an `HS_SIGNATURE` value.
    pub fn from_value(value: &HandleValue) -> Result<Self, TrustError> {
        Ok(Self::from_bytes(&value.data)?)
    }

    /// Wraps the container in an `HS_SIGNATURE` value.
    pub fn to_value(&self, index: u32) -> HandleValue {
        HandleValue::new(index, types::HS_SIGNATURE, self.to_bytes())
    }

    fn signed_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(CONTAINER_VERSION);
        self.signer.encode(&mut buf);
        self.handle.encode(&mut buf);
        buf.put_u32(self.values.len() as u32);
        for v in &self.values {
            buf.put_u32(v.index);
            buf.put_u32(v.digests.len() as u32);
            for (alg, digest) in &v.digests {
                buf.put_u8(*alg as u8);
                write_byte_array(&mut buf, digest);
            }
        }
        buf.freeze()
    }

    /// Verifies the signature under `key`.
    pub fn verify(&self, key: &PublicKey) -> Result<(), TrustError> {
        let alg = SignatureAlgorithm::from_name(&self.algorithm)?;
        key.verify(
            alg,
            &self.signed_bytes(),
            &self.signature,
            self.signer.handle.as_bytes(),
        )
        .map_err(|_| TrustError::BadSignature(self.signer.clone()))
    }
}

impl WireEncode for SignedDigests {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.signed_bytes());
        self.algorithm.encode(buf);
        write_byte_array(buf, &self.signature);
    }
}

impl WireDecode for SignedDigests {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let version = u8::decode(buf)?;
        if version != CONTAINER_VERSION {
            return Err(DecodeError::Custom(format!(
                "unsupported signature container version {version}"
            )));
        }
        let signer = ValueReference::decode(buf)?;
        let handle = Handle::decode(buf)?;
        let count = read_count(buf)?;
        let mut values = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let index = u32::decode(buf)?;
            let n = read_count(buf)?;
            let mut digests = Vec::with_capacity(n.min(4));
            for _ in 0..n {
                let alg = HashAlgorithm::from_u8(u8::decode(buf)?)
                    .map_err(|e| DecodeError::Custom(e.to_string()))?;
                digests.push((alg, read_byte_array(buf)?));
            }
            values.push(ValueDigests { index, digests });
        }
        Ok(Self {
            signer,
            handle,
            values,
            algorithm: String::decode(buf)?,
            signature: read_byte_array(buf)?,
        })
    }
}

/// Public keys trusted to sign values.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: HashMap<ValueReference, PublicKey>,
}

impl TrustedKeys {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts `key` under `reference`.
    pub fn add(&mut self, reference: ValueReference, key: PublicKey) {
        self.keys.insert(reference, key);
    }

    /// Key for `reference`, if trusted.
    pub fn get(&self, reference: &ValueReference) -> Option<&PublicKey> {
        self.keys.get(reference)
    }

    /// Number of trusted keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if no keys are trusted.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<(ValueReference, PublicKey)> for TrustedKeys {
    fn from_iter<I: IntoIterator<Item = (ValueReference, PublicKey)>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

/// Leniency switches for [`verify_values`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustPolicy {
    /// Skip signatures that fail instead of failing the whole set.
    pub ignore_invalid_signatures: bool,
    /// Accept public values no valid signature covers.
    pub ignore_unsigned_values: bool,
    /// Fail when a signature covers an index absent from the value set.
    pub report_missing_values: bool,
}

/// Outcome of a successful trust check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustReport {
    /// Indexes covered by at least one valid signature.
    pub signed: BTreeSet<u32>,
    /// Indexes of `HS_SIGNATURE` values that verified.
    pub valid_signatures: Vec<u32>,
    /// Indexes of `HS_SIGNATURE` values that failed (lenient mode only).
    pub invalid_signatures: Vec<u32>,
    /// Public values left unsigned (lenient mode only).
    pub unsigned: Vec<u32>,
}

fn check_signature(
    handle: &Handle,
    signature: &HandleValue,
    values: &[HandleValue],
    trusted: &TrustedKeys,
    policy: &TrustPolicy,
) -> Result<Vec<u32>, TrustError> {
    let container = SignedDigests::from_value(signature)?;
    if container.handle != *handle {
        return Err(TrustError::WrongHandle(container.handle));
    }
    let key = trusted
        .get(&container.signer)
        .ok_or_else(|| TrustError::UntrustedSigner(container.signer.clone()))?;
    container.verify(key)?;

    let mut covered = Vec::with_capacity(container.values.len());
    for digests in &container.values {
        match values.iter().find(|v| v.index == digests.index) {
            Some(value) => {
                digests.check(value)?;
                covered.push(digests.index);
            }
            None if policy.report_missing_values => {
                return Err(TrustError::MissingValue(digests.index));
            }
            None => {}
        }
    }
    Ok(covered)
}

/// Checks that `values` of `handle` are covered by trusted signatures.
pub fn verify_values(
    handle: &Handle,
    values: &[HandleValue],
    trusted: &TrustedKeys,
    policy: &TrustPolicy,
) -> Result<TrustReport, TrustError> {
    let mut report = TrustReport::default();

    for signature in values.iter().filter(|v| v.has_type(types::HS_SIGNATURE)) {
        match check_signature(handle, signature, values, trusted, policy) {
            Ok(covered) => {
                report.signed.extend(covered);
                report.valid_signatures.push(signature.index);
            }
            Err(err) if policy.ignore_invalid_signatures => {
                warn!(handle = %handle, index = signature.index, error = %err, "ignoring invalid signature");
                report.invalid_signatures.push(signature.index);
            }
            Err(err) => return Err(err),
        }
    }

    report.unsigned = values
        .iter()
        .filter(|v| v.public_read && !v.has_type(types::HS_SIGNATURE))
        .map(|v| v.index)
        .filter(|index| !report.signed.contains(index))
        .collect();
    if !report.unsigned.is_empty() && !policy.ignore_unsigned_values {
        return Err(TrustError::UnsignedValues(report.unsigned));
    }
    debug!(handle = %handle, signed = report.signed.len(), "values verified");
    Ok(report)
}
