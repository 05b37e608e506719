//! Challenge-response authentication.
//!
//! A server that needs to know who is asking answers a request with a
//! [`Challenge`]: a random nonce and a digest of the request body. The client
//! proves an identity by answering over `nonce || digest` with either a
//! shared secret (`HS_SECKEY`) or a private key (`HS_PUBKEY`).
//!
//! Secret-key answers depend on the negotiated version:
//!
//! | version   | answer                                                       |
//! |-----------|--------------------------------------------------------------|
//! | < 2.1     | `MD5(secret \|\| nonce \|\| digest \|\| secret)`             |
//! | 2.1 - 2.6 | `0x12 \|\| HMAC-SHA1(secret, nonce \|\| digest)`             |
//! | >= 2.7    | `0x22 \|\| HMAC-SHA1(PBKDF2(secret, nonce), nonce \|\| digest)` |

use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hs_core::crypto::{
    hmac_sha1, pbkdf2_hmac_sha1, verify_hmac_sha1, HashAlgorithm, PrivateKey, PublicKey,
    SignatureAlgorithm,
};
use hs_core::{ErrorKind, HandleError, HandleResult};
use hs_proto::{types, Body, HandleValue, Message, Opcode, ProtocolVersion, ResponseCode, ValueReference};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

/// Tag of HMAC-SHA1 secret-key answers.
pub const SECRET_KEY_HMAC_SHA1: u8 = 0x12;
/// Tag of PBKDF2 secret-key answers.
pub const SECRET_KEY_PBKDF2: u8 = 0x22;
/// PBKDF2 iterations for secret-key answers.
pub const PBKDF2_ITERATIONS: u32 = 1000;
/// Nonce length of server challenges.
pub const NONCE_LEN: usize = 16;

fn challenge_input(nonce: &[u8], digest: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(nonce.len() + digest.len());
    input.extend_from_slice(nonce);
    input.extend_from_slice(digest);
    input
}

/// Computes a secret-key answer as a peer at `version` expects it.
pub fn secret_key_answer(version: ProtocolVersion, secret: &[u8], nonce: &[u8], digest: &[u8]) -> Vec<u8> {
    let input = challenge_input(nonce, digest);
    if version.at_least(2, 7) {
        let key = Zeroizing::new(pbkdf2_hmac_sha1(secret, nonce, PBKDF2_ITERATIONS, 20));
        let mut out = vec![SECRET_KEY_PBKDF2];
        out.extend_from_slice(&hmac_sha1(&key, &input));
        out
    } else if version.at_least(2, 1) {
        let mut out = vec![SECRET_KEY_HMAC_SHA1];
        out.extend_from_slice(&hmac_sha1(secret, &input));
        out
    } else {
        let mut data = Vec::with_capacity(secret.len() * 2 + input.len());
        data.extend_from_slice(secret);
        data.extend_from_slice(&input);
        data.extend_from_slice(secret);
        HashAlgorithm::Md5.digest(&data)
    }
}

/// Checks a secret-key answer of any generation.
pub fn verify_secret_key_answer(secret: &[u8], nonce: &[u8], digest: &[u8], response: &[u8]) -> bool {
    let input = challenge_input(nonce, digest);
    match (response.len(), response.first()) {
        (21, Some(&SECRET_KEY_PBKDF2)) => {
            let key = Zeroizing::new(pbkdf2_hmac_sha1(secret, nonce, PBKDF2_ITERATIONS, 20));
            verify_hmac_sha1(&key, &input, &response[1..])
        }
        (21, Some(&SECRET_KEY_HMAC_SHA1)) => verify_hmac_sha1(secret, &input, &response[1..]),
        (16, _) => {
            let expected = secret_key_answer(ProtocolVersion::new(2, 0), secret, nonce, digest);
            expected.ct_eq(response).into()
        }
        _ => false,
    }
}

/// Signs a challenge: the algorithm name then the signature, both length
/// prefixed.
pub fn public_key_answer(
    key: &PrivateKey,
    identity: &ValueReference,
    nonce: &[u8],
    digest: &[u8],
) -> HandleResult<Bytes> {
    let (alg, signature) = key.sign(&challenge_input(nonce, digest), identity.handle.as_bytes())?;
    let name = alg.name().as_bytes();
    let mut out = BytesMut::with_capacity(8 + name.len() + signature.len());
    out.put_u32(name.len() as u32);
    out.put_slice(name);
    out.put_u32(signature.len() as u32);
    out.put_slice(&signature);
    Ok(out.freeze())
}

/// Checks a public-key answer.
pub fn verify_public_key_answer(
    key: &PublicKey,
    identity: &ValueReference,
    nonce: &[u8],
    digest: &[u8],
    response: &[u8],
) -> HandleResult<()> {
    let malformed = || HandleError::new(ErrorKind::UnableToAuthenticate, "malformed signature answer");
    let mut buf = response;
    let mut field = || -> HandleResult<Vec<u8>> {
        if buf.remaining() < 4 {
            return Err(malformed());
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(malformed());
        }
        let out = buf[..len].to_vec();
        buf.advance(len);
        Ok(out)
    };
    let name = field()?;
    let signature = field()?;
    let alg = SignatureAlgorithm::from_name(&String::from_utf8_lossy(&name))?;
    key.verify(
        alg,
        &challenge_input(nonce, digest),
        &signature,
        identity.handle.as_bytes(),
    )
    .map_err(|_| {
        HandleError::new(
            ErrorKind::UnableToAuthenticate,
            format!("signature by {identity} did not verify"),
        )
    })
}

/// Credentials a client authenticates with.
#[derive(Clone)]
pub enum AuthenticationInfo {
    /// Shared secret stored in an `HS_SECKEY` value.
    SecretKey {
        /// Identity holding the secret.
        identity: ValueReference,
        /// The secret.
        secret: Zeroizing<Vec<u8>>,
    },
    /// Private key matching an `HS_PUBKEY` value.
    PublicKey {
        /// Identity holding the public key.
        identity: ValueReference,
        /// The private key.
        key: PrivateKey,
    },
}

impl std::fmt::Debug for AuthenticationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationInfo")
            .field("auth_type", &String::from_utf8_lossy(self.auth_type()))
            .field("identity", self.identity())
            .finish_non_exhaustive()
    }
}

impl AuthenticationInfo {
    /// Secret-key credentials.
    pub fn secret_key(identity: ValueReference, secret: impl Into<Vec<u8>>) -> Self {
        Self::SecretKey {
            identity,
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Public-key credentials.
    pub fn public_key(identity: ValueReference, key: PrivateKey) -> Self {
        Self::PublicKey { identity, key }
    }

    /// Identity authenticated as.
    pub fn identity(&self) -> &ValueReference {
        match self {
            Self::SecretKey { identity, .. } | Self::PublicKey { identity, .. } => identity,
        }
    }

    /// `HS_SECKEY` or `HS_PUBKEY`.
    pub fn auth_type(&self) -> &'static [u8] {
        match self {
            Self::SecretKey { .. } => types::HS_SECKEY,
            Self::PublicKey { .. } => types::HS_PUBKEY,
        }
    }

    /// Answers a challenge.
    pub fn answer(&self, version: ProtocolVersion, nonce: &[u8], digest: &[u8]) -> HandleResult<Bytes> {
        match self {
            Self::SecretKey { secret, .. } => {
                Ok(Bytes::from(secret_key_answer(version, secret, nonce, digest)))
            }
            Self::PublicKey { identity, key } => public_key_answer(key, identity, nonce, digest),
        }
    }
}

/// Builds the answer to `challenge`, which the server sent for `request`.
///
/// Fails with `SECURITY_ALERT` when the challenge covers a different request
/// body than the one sent.
pub fn answer_challenge(
    auth: &AuthenticationInfo,
    request: &Message,
    challenge: &Message,
) -> HandleResult<Message> {
    let Body::Challenge {
        nonce,
        digest_alg,
        request_digest,
    } = &challenge.body
    else {
        return Err(HandleError::new(
            ErrorKind::MessageFormatError,
            "authentication needed without a challenge",
        ));
    };
    if request.body_digest(*digest_alg) != request_digest.as_ref() {
        return Err(HandleError::security_alert(
            "challenge digest does not match the request",
        ));
    }
    let response = auth.answer(challenge.version, nonce, request_digest)?;

    let mut answer = Message::request(
        Opcode::ChallengeResponse,
        Body::ChallengeAnswer {
            auth_type: Bytes::from_static(auth.auth_type()),
            identity: auth.identity().clone(),
            response,
        },
    );
    answer.version = challenge.version;
    answer.request_id = request.request_id;
    answer.session_id = challenge.session_id;
    answer.flags = request.flags;
    Ok(answer)
}

/// A challenge a server issued and is waiting on.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Random nonce.
    pub nonce: Bytes,
    /// Digest algorithm of the challenged request's version.
    pub digest_alg: HashAlgorithm,
    /// Digest of the challenged request body.
    pub request_digest: Bytes,
    issued: Instant,
}

impl Challenge {
    /// Challenges `request`.
    pub fn issue(request: &Message) -> Self {
        let mut nonce = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let digest_alg = request.version.digest_algorithm();
        Self {
            nonce: Bytes::from(nonce),
            digest_alg,
            request_digest: Bytes::from(request.body_digest(digest_alg)),
            issued: Instant::now(),
        }
    }

    /// The `AUTHENTICATION_NEEDED` response carrying this challenge.
    pub fn to_response(&self, request: &Message) -> Message {
        Message::response_to(
            request,
            ResponseCode::AuthenticationNeeded,
            Body::Challenge {
                nonce: self.nonce.clone(),
                digest_alg: self.digest_alg,
                request_digest: self.request_digest.clone(),
            },
        )
    }

    /// True if older than `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued.elapsed() > ttl
    }

    /// Verifies an answer against the identity's stored key value.
    ///
    /// `original` is the challenged request; its digest is recomputed so an
    /// answer can never authorize a different body.
    pub fn verify_answer(
        &self,
        original: &Message,
        auth_type: &[u8],
        identity: &ValueReference,
        response: &[u8],
        stored: &HandleValue,
    ) -> HandleResult<()> {
        if original.body_digest(self.digest_alg) != self.request_digest.as_ref() {
            return Err(HandleError::security_alert(
                "challenged request changed before the answer",
            ));
        }
        if !stored.has_type(auth_type) {
            return Err(HandleError::new(
                ErrorKind::UnableToAuthenticate,
                format!(
                    "{identity} holds {} but the answer uses {}",
                    stored.type_str(),
                    String::from_utf8_lossy(auth_type)
                ),
            ));
        }
        if auth_type == types::HS_SECKEY {
            if !verify_secret_key_answer(&stored.data, &self.nonce, &self.request_digest, response) {
                debug!(%identity, "secret key answer rejected");
                return Err(HandleError::new(
                    ErrorKind::UnableToAuthenticate,
                    format!("secret key answer for {identity} is wrong"),
                ));
            }
            Ok(())
        } else if auth_type == types::HS_PUBKEY {
            let key = PublicKey::decode(&stored.data)?;
            verify_public_key_answer(&key, identity, &self.nonce, &self.request_digest, response)
        } else {
            Err(HandleError::new(
                ErrorKind::UnableToAuthenticate,
                format!("unknown authentication type {}", String::from_utf8_lossy(auth_type)),
            ))
        }
    }
}
