//! Protocol messages.
//!
//! A [`Message`] is one tagged union over every opcode: shared header fields
//! plus a [`Body`] variant chosen by opcode and response code. On the wire a
//! message is
//!
//! ```text
//! header (24) | [digest alg u8 | digest] body | credential length u32 | credential
//! ```
//!
//! preceded on every transport by an [`Envelope`]. Signatures and MACs cover
//! the header and body section.

mod body;
mod credential;
mod envelope;
mod flags;
mod header;
mod opcode;
mod response_code;
mod state;
mod version;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hs_core::crypto::{CryptoError, HashAlgorithm, PrivateKey, PublicKey};
use hs_core::time::{epoch_secs, message_expired};
use hs_core::{
    DecodeError, ErrorKind, HandleError, HandleResult, WireDecode, WireEncode,
    MAX_MESSAGE_LENGTH, MESSAGE_HEADER_SIZE,
};

pub use body::{
    Body, DhExchange, DumpHandlesRequest, DumpResume, KeyExchangeMode, ReplicaShard,
    ReplicationPosition, ResumeKind, RetrieveTxnRequest, RetrieveTxnStatus, SessionSetupRequest,
};
pub use credential::{
    Credential, CredentialKind, CREDENTIAL_TYPE_MAC, CREDENTIAL_TYPE_SIGNED, MAC_ALGORITHM,
};
pub use envelope::Envelope;
pub use flags::{OpFlags, ENVELOPE_COMPRESSED, ENVELOPE_ENCRYPTED, ENVELOPE_TRUNCATED};
pub use header::MessageHeader;
pub use opcode::Opcode;
pub use response_code::ResponseCode;
pub use state::{RequestState, RequestTracker};
pub use version::ProtocolVersion;

use crate::value::ValueReference;

/// Default lifetime of a request, in seconds.
pub const DEFAULT_EXPIRATION_SECS: u32 = 12 * 60 * 60;

/// Default recursion allowance for a new request.
pub const DEFAULT_RECURSION_COUNT: u8 = 4;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol version of this message.
    pub version: ProtocolVersion,
    /// Highest version the sender supports.
    pub suggested: ProtocolVersion,
    /// Session id, 0 outside a session.
    pub session_id: u32,
    /// Request id.
    pub request_id: u32,
    /// Operation.
    pub opcode: Opcode,
    /// Outcome; [`ResponseCode::Reserved`] on requests.
    pub response_code: ResponseCode,
    /// Header flags.
    pub flags: OpFlags,
    /// Serial of the site info the sender used.
    pub site_info_serial: u16,
    /// Remaining recursion allowance.
    pub recursion_count: u8,
    /// Expiration in epoch seconds; 0 never expires.
    pub expiration: u32,
    /// Digest of the request this responds to.
    pub request_digest: Option<(HashAlgorithm, Bytes)>,
    /// Body.
    pub body: Body,
    /// Signature or MAC over header and body.
    pub credential: Option<Credential>,
}

impl Message {
    /// Builds a request at the current protocol version.
    pub fn request(opcode: Opcode, body: Body) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            suggested: ProtocolVersion::CURRENT,
            session_id: 0,
            request_id: 0,
            opcode,
            response_code: ResponseCode::Reserved,
            flags: OpFlags::default(),
            site_info_serial: 0,
            recursion_count: DEFAULT_RECURSION_COUNT,
            expiration: epoch_secs().saturating_add(DEFAULT_EXPIRATION_SECS),
            request_digest: None,
            body,
            credential: None,
        }
    }

    /// Builds the response to `request`.
    ///
    /// The version is the lower of the request's version and ours. When the
    /// request asked for it, the response carries a digest of the request
    /// body hashed with the algorithm of the negotiated version.
    pub fn response_to(request: &Message, response_code: ResponseCode, body: Body) -> Self {
        let version = ProtocolVersion::negotiate(request.version, ProtocolVersion::CURRENT);
        let mut flags = OpFlags::default();
        for flag in [
            OpFlags::CERTIFY,
            OpFlags::ENCRYPT,
            OpFlags::RETURN_REQUEST_DIGEST,
            OpFlags::PUBLIC_ONLY,
        ] {
            flags.set(flag, request.flags.has(flag));
        }
        let request_digest = flags.has(OpFlags::RETURN_REQUEST_DIGEST).then(|| {
            let alg = version.digest_algorithm();
            (alg, Bytes::from(request.body_digest(alg)))
        });
        Self {
            version,
            suggested: ProtocolVersion::CURRENT,
            session_id: request.session_id,
            request_id: request.request_id,
            opcode: request.opcode,
            response_code,
            flags,
            site_info_serial: request.site_info_serial,
            recursion_count: request.recursion_count,
            expiration: epoch_secs().saturating_add(DEFAULT_EXPIRATION_SECS),
            request_digest,
            body,
            credential: None,
        }
    }

    /// Builds an error response carrying a code derived from `error`.
    pub fn error_response(request: &Message, error: &HandleError) -> Self {
        Self::response_to(
            request,
            ResponseCode::for_error(error.kind()),
            Body::error(error.message.clone()),
        )
    }

    /// Returns a copy with `flag` set.
    pub fn with_flag(mut self, flag: u32) -> Self {
        self.flags.set(flag, true);
        self
    }

    /// True for requests.
    pub fn is_request(&self) -> bool {
        self.response_code == ResponseCode::Reserved
    }

    /// True if the expiration has passed.
    pub fn is_expired(&self) -> bool {
        message_expired(self.expiration, epoch_secs())
    }

    /// Encoded body, without the request digest prefix.
    pub fn body_bytes(&self) -> Bytes {
        self.body.to_bytes()
    }

    /// Digest of the encoded body.
    pub fn body_digest(&self, alg: HashAlgorithm) -> Vec<u8> {
        alg.digest(&self.body_bytes())
    }

    /// True if this response's request digest matches `request`.
    pub fn matches_request(&self, request: &Message) -> bool {
        match &self.request_digest {
            Some((alg, digest)) => request.body_digest(*alg) == digest.as_ref(),
            None => false,
        }
    }

    /// True if private values must travel encrypted.
    pub fn should_encrypt(&self) -> bool {
        self.version.requires_private_value_encryption()
            && self.body.values().iter().any(|v| !v.public_read)
    }

    fn header(&self, body_length: usize) -> MessageHeader {
        MessageHeader {
            opcode: self.opcode,
            response_code: self.response_code,
            flags: self.flags,
            site_info_serial: self.site_info_serial,
            recursion_count: self.recursion_count,
            expiration: self.expiration,
            body_length: body_length as u32,
        }
    }

    fn encode_body_section(&self, buf: &mut BytesMut) {
        if self.flags.has(OpFlags::RETURN_REQUEST_DIGEST) && !self.is_request() {
            if let Some((alg, digest)) = &self.request_digest {
                buf.put_u8(*alg as u8);
                buf.put_slice(digest);
            }
        }
        self.body.encode(buf);
    }

    /// Header and body bytes: the data signatures and MACs cover.
    pub fn signed_bytes(&self) -> Bytes {
        let mut section = BytesMut::new();
        self.encode_body_section(&mut section);
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + section.len());
        self.header(section.len()).encode(&mut buf);
        buf.extend_from_slice(&section);
        buf.freeze()
    }

    /// Signs the message with a private key.
    pub fn sign(&mut self, key: &PrivateKey, signer: ValueReference) -> Result<(), CryptoError> {
        self.credential = Some(Credential::sign(key, signer, &self.signed_bytes())?);
        Ok(())
    }

    /// Attaches a session MAC.
    pub fn mac(&mut self, session_key: &[u8], signer: ValueReference, session_counter: u32) {
        self.credential = Some(Credential::mac(
            session_key,
            signer,
            session_counter,
            &self.signed_bytes(),
        ));
    }

    /// Verifies a signed credential against `key`.
    pub fn verify_signature(&self, key: &PublicKey) -> HandleResult<()> {
        let credential = self.credential.as_ref().ok_or_else(|| {
            HandleError::new(ErrorKind::MissingOrInvalidSignature, "message is not signed")
        })?;
        credential
            .verify_signature(key, &self.signed_bytes())
            .map_err(|_| HandleError::security_alert("message signature does not verify"))
    }

    /// Verifies a session MAC, returning the session counter it covers.
    pub fn verify_mac(&self, session_key: &[u8]) -> HandleResult<u32> {
        let credential = self.credential.as_ref().ok_or_else(|| {
            HandleError::new(ErrorKind::MissingOrInvalidSignature, "message has no MAC")
        })?;
        credential
            .verify_mac(session_key, &self.signed_bytes())
            .map_err(|_| HandleError::security_alert("session MAC does not verify"))
    }

    /// Envelope for these message bytes.
    pub fn envelope(&self, message_length: usize) -> Envelope {
        Envelope {
            version: self.version,
            suggested: self.suggested,
            flags: 0,
            session_id: self.session_id,
            request_id: self.request_id,
            sequence: 0,
            message_length: message_length as u32,
        }
    }

    /// Encodes header, body and credential.
    pub fn encode_message(&self) -> Bytes {
        let signed = self.signed_bytes();
        let mut buf = BytesMut::with_capacity(signed.len() + 4);
        buf.extend_from_slice(&signed);
        match &self.credential {
            Some(credential) => {
                let cred = credential.to_bytes();
                buf.put_u32(cred.len() as u32);
                buf.extend_from_slice(&cred);
            }
            None => buf.put_u32(0),
        }
        buf.freeze()
    }

    /// Decodes message bytes that arrived under `envelope`.
    pub fn decode_message(envelope: &Envelope, mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.len() > MAX_MESSAGE_LENGTH {
            return Err(DecodeError::MessageTooLong(buf.len()));
        }
        let header = MessageHeader::decode(&mut buf)?;
        hs_core::encoding::ensure_remaining(&buf, header.body_length as usize)?;
        let mut section = buf.split_to(header.body_length as usize);

        let mut request_digest = None;
        if header.flags.has(OpFlags::RETURN_REQUEST_DIGEST)
            && header.response_code != ResponseCode::Reserved
        {
            let alg = HashAlgorithm::from_u8(u8::decode(&mut section)?)
                .map_err(|e| DecodeError::Custom(e.to_string()))?;
            hs_core::encoding::ensure_remaining(&section, alg.output_len())?;
            request_digest = Some((alg, section.split_to(alg.output_len())));
        }
        let body = Body::decode_for(header.opcode, header.response_code, &mut section)?;

        let credential = if buf.remaining() >= 4 {
            let len = buf.get_u32() as usize;
            if len == 0 {
                None
            } else {
                hs_core::encoding::ensure_remaining(&buf, len)?;
                let mut cred = buf.split_to(len);
                Some(Credential::decode(&mut cred)?)
            }
        } else {
            None
        };

        Ok(Self {
            version: envelope.version,
            suggested: envelope.suggested,
            session_id: envelope.session_id,
            request_id: envelope.request_id,
            opcode: header.opcode,
            response_code: header.response_code,
            flags: header.flags,
            site_info_serial: header.site_info_serial,
            recursion_count: header.recursion_count,
            expiration: header.expiration,
            request_digest,
            body,
            credential,
        })
    }

    /// Converts an error response into a [`HandleError`].
    pub fn into_result(self) -> HandleResult<Message> {
        if self.response_code.is_success()
            || self.response_code.is_referral()
            || self.response_code == ResponseCode::AuthenticationNeeded
            || self.is_request()
        {
            return Ok(self);
        }
        let message = match &self.body {
            Body::Error { message } => String::from_utf8_lossy(message).into_owned(),
            _ => String::new(),
        };
        Err(self.response_code.into_error(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HandleValue;
    use hs_core::crypto::generate_rsa_key;
    use hs_core::Handle;

    fn resolution() -> Message {
        let mut msg = Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: Handle::from("10.1000/1"),
                indexes: vec![],
                types: vec![],
            },
        );
        msg.request_id = 77;
        msg
    }

    fn roundtrip(msg: &Message) -> Message {
        let bytes = msg.encode_message();
        Message::decode_message(&msg.envelope(bytes.len()), bytes).unwrap()
    }

    #[test]
    fn test_request_roundtrip() {
        let msg = resolution().with_flag(OpFlags::RECURSIVE);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_response_digest_follows_version() {
        let mut req = resolution().with_flag(OpFlags::RETURN_REQUEST_DIGEST);
        for (minor, alg) in [
            (0, HashAlgorithm::Md5),
            (1, HashAlgorithm::Sha1),
            (6, HashAlgorithm::Sha1),
            (7, HashAlgorithm::Sha256),
            (11, HashAlgorithm::Sha256),
        ] {
            req.version = ProtocolVersion::new(2, minor);
            let resp = Message::response_to(
                &req,
                ResponseCode::Success,
                Body::Values {
                    handle: Handle::from("10.1000/1"),
                    values: vec![HandleValue::new(1, "URL", "http://a")],
                },
            );
            assert_eq!(resp.version, ProtocolVersion::new(2, minor));
            let (got, _) = resp.request_digest.clone().unwrap();
            assert_eq!(got, alg);
            let decoded = roundtrip(&resp);
            assert!(decoded.matches_request(&req));
            assert_eq!(decoded, resp);
        }
    }

    #[test]
    fn test_signed_message() {
        let key = generate_rsa_key(1024).unwrap();
        let mut msg = resolution();
        msg.sign(&key, ValueReference::new("0.NA/10.1000", 300)).unwrap();
        let decoded = roundtrip(&msg);
        decoded.verify_signature(&key.public_key()).unwrap();

        let mut tampered = decoded.clone();
        tampered.recursion_count += 1;
        assert_eq!(
            tampered.verify_signature(&key.public_key()).unwrap_err().kind(),
            ErrorKind::SecurityAlert
        );
    }

    #[test]
    fn test_mac_message() {
        let mut msg = resolution();
        msg.mac(&[9u8; 16], ValueReference::new("", 0), 5);
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.verify_mac(&[9u8; 16]).unwrap(), 5);
        assert!(decoded.verify_mac(&[8u8; 16]).is_err());
    }

    #[test]
    fn test_should_encrypt() {
        let req = resolution();
        let values = vec![
            HandleValue::new(1, "URL", "http://a"),
            HandleValue::new(2, "HS_SECKEY", "secret").private(),
        ];
        let body = Body::Values {
            handle: Handle::from("10.1000/1"),
            values,
        };
        let mut resp = Message::response_to(&req, ResponseCode::Success, body.clone());
        assert!(resp.should_encrypt());
        resp.version = ProtocolVersion::new(2, 7);
        assert!(!resp.should_encrypt());

        let public = Message::response_to(
            &req,
            ResponseCode::Success,
            Body::Values {
                handle: Handle::from("10.1000/1"),
                values: vec![HandleValue::new(1, "URL", "http://a")],
            },
        );
        assert!(!public.should_encrypt());
    }

    #[test]
    fn test_error_response() {
        let req = resolution();
        let err = HandleError::new(ErrorKind::ServiceNotFound, "no such prefix");
        let resp = Message::error_response(&req, &err);
        assert_eq!(resp.response_code, ResponseCode::HandleNotFound);
        let decoded = roundtrip(&resp);
        let err = decoded.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandleDoesNotExist);
        assert!(err.to_string().contains("no such prefix"));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let msg = resolution();
        let bytes = msg.encode_message();
        let short = bytes.slice(..bytes.len() - 8);
        assert!(Message::decode_message(&msg.envelope(short.len()), short).is_err());
    }
}
