//! Message bodies, one variant per opcode and outcome.
//!
//! The body layout is a function of the opcode and the response code, so
//! [`Body::decode_for`] takes both. Requests carry
//! [`ResponseCode::Reserved`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hs_core::crypto::{CipherAlgorithm, HashAlgorithm};
use hs_core::encoding::{read_byte_array, read_count, write_byte_array};
use hs_core::{DecodeError, Handle, HashOption, Timestamp, WireDecode, WireEncode};

use super::opcode::Opcode;
use super::response_code::ResponseCode;
use crate::site::SiteInfo;
use crate::value::{HandleValue, ValueReference};

/// How the session key is agreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum KeyExchangeMode {
    /// No key; session without encryption.
    None = 0,
    /// Server encrypts the key with the client's public key.
    ClientCipher = 1,
    /// Client encrypts the key with the server's public key.
    ServerCipher = 2,
    /// Server encrypts the key with a public key looked up by handle.
    HandleRef = 3,
    /// Diffie-Hellman.
    #[default]
    DiffieHellman = 4,
}

impl KeyExchangeMode {
    fn from_u16(tag: u16) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::ClientCipher),
            2 => Ok(Self::ServerCipher),
            3 => Ok(Self::HandleRef),
            4 => Ok(Self::DiffieHellman),
            _ => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

/// Diffie-Hellman parameters and public value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhExchange {
    /// Prime.
    pub p: Bytes,
    /// Generator.
    pub g: Bytes,
    /// Sender's public value.
    pub public: Bytes,
}

impl WireEncode for DhExchange {
    fn encode(&self, buf: &mut BytesMut) {
        write_byte_array(buf, &self.p);
        write_byte_array(buf, &self.g);
        write_byte_array(buf, &self.public);
    }
}

impl WireDecode for DhExchange {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            p: read_byte_array(buf)?,
            g: read_byte_array(buf)?,
            public: read_byte_array(buf)?,
        })
    }
}

/// Session setup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupRequest {
    /// Key agreement mode.
    pub mode: KeyExchangeMode,
    /// Key handle for [`KeyExchangeMode::HandleRef`].
    pub key_ref: Option<ValueReference>,
    /// Mode-specific data: the client public key record for
    /// [`KeyExchangeMode::ClientCipher`], an encoded [`DhExchange`] for
    /// Diffie-Hellman.
    pub exchange_data: Bytes,
    /// Requested idle timeout in seconds.
    pub timeout_secs: u32,
    /// Symmetric algorithm.
    pub cipher: CipherAlgorithm,
    /// Identity to authenticate the session as.
    pub identity: Option<ValueReference>,
    /// Encrypt every message in the session.
    pub encrypt_all: bool,
    /// MAC every message in the session.
    pub authenticate_all: bool,
}

const SETUP_ENCRYPT: u8 = 0x1;
const SETUP_AUTHENTICATE: u8 = 0x2;

fn encode_optional_ref(r: &Option<ValueReference>, buf: &mut BytesMut) {
    match r {
        Some(r) => {
            buf.put_u8(1);
            r.encode(buf);
        }
        None => buf.put_u8(0),
    }
}

fn decode_optional_ref(buf: &mut Bytes) -> Result<Option<ValueReference>, DecodeError> {
    Ok(match bool::decode(buf)? {
        true => Some(ValueReference::decode(buf)?),
        false => None,
    })
}

impl WireEncode for SessionSetupRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.mode as u16);
        encode_optional_ref(&self.key_ref, buf);
        write_byte_array(buf, &self.exchange_data);
        buf.put_u32(self.timeout_secs);
        buf.put_u8(self.cipher as u8);
        encode_optional_ref(&self.identity, buf);
        let mut flags = 0;
        if self.encrypt_all {
            flags |= SETUP_ENCRYPT;
        }
        if self.authenticate_all {
            flags |= SETUP_AUTHENTICATE;
        }
        buf.put_u8(flags);
    }
}

impl WireDecode for SessionSetupRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let mode = KeyExchangeMode::from_u16(u16::decode(buf)?)?;
        let key_ref = decode_optional_ref(buf)?;
        let exchange_data = read_byte_array(buf)?;
        let timeout_secs = u32::decode(buf)?;
        let cipher = CipherAlgorithm::from_u8(u8::decode(buf)?)
            .map_err(|e| DecodeError::Custom(e.to_string()))?;
        let identity = decode_optional_ref(buf)?;
        let flags = u8::decode(buf)?;
        Ok(Self {
            mode,
            key_ref,
            exchange_data,
            timeout_secs,
            cipher,
            identity,
            encrypt_all: flags & SETUP_ENCRYPT != 0,
            authenticate_all: flags & SETUP_AUTHENTICATE != 0,
        })
    }
}

/// Where a replica stands in one source's transaction queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPosition {
    /// Queue (source site) name; empty for single-primary setups.
    pub queue: String,
    /// Last transaction id applied.
    pub last_txn_id: u64,
    /// Time of the last successful retrieval.
    pub last_timestamp: Timestamp,
}

impl WireEncode for ReplicationPosition {
    fn encode(&self, buf: &mut BytesMut) {
        self.queue.encode(buf);
        buf.put_u64(self.last_txn_id);
        self.last_timestamp.encode(buf);
    }
}

impl WireDecode for ReplicationPosition {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            queue: String::decode(buf)?,
            last_txn_id: u64::decode(buf)?,
            last_timestamp: Timestamp::decode(buf)?,
        })
    }
}

/// Which handles a replica is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaShard {
    /// Hash option of the replica's site.
    pub hash_option: HashOption,
    /// Servers in the replica's site.
    pub num_servers: u32,
    /// The replica's server number.
    pub server_num: u32,
}

impl WireEncode for ReplicaShard {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.hash_option as u8);
        buf.put_u32(self.num_servers);
        buf.put_u32(self.server_num);
    }
}

impl WireDecode for ReplicaShard {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            hash_option: HashOption::from_u8(u8::decode(buf)?)?,
            num_servers: u32::decode(buf)?,
            server_num: u32::decode(buf)?,
        })
    }
}

/// Retrieve-transactions request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveTxnRequest {
    /// Requesting replica.
    pub shard: ReplicaShard,
    /// One position per source queue.
    pub positions: Vec<ReplicationPosition>,
}

/// Server's answer to a retrieve-transactions request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RetrieveTxnStatus {
    /// History is gone; run the dump protocol.
    NeedToRedump = 1,
    /// Transactions follow on the stream.
    SendingTransactions = 2,
}

/// Starting point kinds for a resumed dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResumeKind {
    /// Resume within the handle replication records.
    HandleReplicationDb = 0,
    /// Resume within the NA replication records.
    NaReplicationDb = 1,
    /// Resume within handles.
    Handle = 2,
    /// Resume within homed NAs.
    Na = 3,
}

impl ResumeKind {
    fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::HandleReplicationDb),
            1 => Ok(Self::NaReplicationDb),
            2 => Ok(Self::Handle),
            3 => Ok(Self::Na),
            _ => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

/// Point from which a dump resumes (exclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpResume {
    /// Section of the dump.
    pub kind: ResumeKind,
    /// Last key already received in that section.
    pub after: Bytes,
}

/// Dump request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHandlesRequest {
    /// Requesting replica.
    pub shard: ReplicaShard,
    /// Resume point, if any.
    pub resume: Option<DumpResume>,
}

/// A message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// No body (generic success).
    Empty,
    /// A request naming only a handle.
    Handle {
        /// Target handle.
        handle: Handle,
    },
    /// Resolution request.
    Resolution {
        /// Target handle.
        handle: Handle,
        /// Requested indexes; empty means all.
        indexes: Vec<u32>,
        /// Requested types; empty means all.
        types: Vec<Bytes>,
    },
    /// A handle and values: create/add/modify requests and resolution
    /// responses.
    Values {
        /// Handle.
        handle: Handle,
        /// Values.
        values: Vec<HandleValue>,
    },
    /// Remove-value request.
    RemoveValues {
        /// Handle.
        handle: Handle,
        /// Indexes to remove.
        indexes: Vec<u32>,
    },
    /// Get-site-info response.
    SiteInfo(SiteInfo),
    /// List responses.
    HandleList {
        /// Handles.
        handles: Vec<Handle>,
    },
    /// Session setup request.
    SessionSetup(SessionSetupRequest),
    /// Session setup response.
    SessionSetupResponse {
        /// Mode accepted by the server.
        mode: KeyExchangeMode,
        /// Mode-specific data: the server's DH public value, its public key
        /// record, or an encrypted session key.
        data: Bytes,
    },
    /// Client-encrypted session key.
    ExchangeKey {
        /// Session key encrypted with the server's public key.
        encrypted_key: Bytes,
    },
    /// Server challenge (`AUTHENTICATION_NEEDED`).
    Challenge {
        /// Random nonce.
        nonce: Bytes,
        /// Algorithm of the request digest.
        digest_alg: HashAlgorithm,
        /// Digest of the challenged request body.
        request_digest: Bytes,
    },
    /// Client answer to a challenge.
    ChallengeAnswer {
        /// `HS_SECKEY` or `HS_PUBKEY`.
        auth_type: Bytes,
        /// Identity answering.
        identity: ValueReference,
        /// Authenticator over nonce and digest.
        response: Bytes,
    },
    /// Ask the identity's home server to verify a secret-key answer.
    VerifyChallenge {
        /// Identity whose secret key is used.
        identity: ValueReference,
        /// Challenge nonce.
        nonce: Bytes,
        /// Request digest the answer covers.
        request_digest: Bytes,
        /// The client's answer.
        response: Bytes,
    },
    /// Verification result.
    VerifyChallengeResponse {
        /// True if the answer verified.
        valid: bool,
    },
    /// Next transaction id.
    NextTxnId {
        /// Id the next transaction will get.
        txn_id: u64,
    },
    /// Retrieve-transactions request.
    RetrieveTxn(RetrieveTxnRequest),
    /// Retrieve-transactions response header.
    RetrieveTxnResponse {
        /// Redump or sending.
        status: RetrieveTxnStatus,
    },
    /// Dump request.
    DumpHandles(DumpHandlesRequest),
    /// Service or prefix referral.
    Referral {
        /// Handle holding the service description.
        handle: Handle,
        /// `HS_SITE` / `HS_SERV` values.
        values: Vec<HandleValue>,
    },
    /// Error response.
    Error {
        /// Human readable message.
        message: Bytes,
    },
}

impl Body {
    /// Creates an error body.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: Bytes::from(message.into()),
        }
    }

    /// Handle targeted by the body, if any.
    pub fn handle(&self) -> Option<&Handle> {
        match self {
            Self::Handle { handle }
            | Self::Resolution { handle, .. }
            | Self::Values { handle, .. }
            | Self::RemoveValues { handle, .. }
            | Self::Referral { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Values carried by the body.
    pub fn values(&self) -> &[HandleValue] {
        match self {
            Self::Values { values, .. } | Self::Referral { values, .. } => values,
            _ => &[],
        }
    }

    /// Decodes a body for the given opcode and response code.
    pub fn decode_for(
        opcode: Opcode,
        rc: ResponseCode,
        buf: &mut Bytes,
    ) -> Result<Self, DecodeError> {
        if rc == ResponseCode::Reserved {
            return Self::decode_request(opcode, buf);
        }
        match rc {
            ResponseCode::Success => Self::decode_success(opcode, buf),
            ResponseCode::AuthenticationNeeded => {
                let nonce = read_byte_array(buf)?;
                let digest_alg = HashAlgorithm::from_u8(u8::decode(buf)?)
                    .map_err(|e| DecodeError::Custom(e.to_string()))?;
                let request_digest = read_byte_array(buf)?;
                Ok(Self::Challenge {
                    nonce,
                    digest_alg,
                    request_digest,
                })
            }
            ResponseCode::ServiceReferral | ResponseCode::PrefixReferral => Ok(Self::Referral {
                handle: Handle::decode(buf)?,
                values: Vec::<HandleValue>::decode(buf)?,
            }),
            _ => {
                // Some servers send error responses with no body.
                let message = if buf.has_remaining() {
                    read_byte_array(buf)?
                } else {
                    Bytes::new()
                };
                Ok(Self::Error { message })
            }
        }
    }

    fn decode_request(opcode: Opcode, buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(match opcode {
            Opcode::Resolution => {
                let handle = Handle::decode(buf)?;
                // A bare handle asks for every value.
                if !buf.has_remaining() {
                    return Ok(Self::Handle { handle });
                }
                let indexes = Vec::<u32>::decode(buf)?;
                let count = read_count(buf)?;
                let mut types = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    types.push(read_byte_array(buf)?);
                }
                Self::Resolution {
                    handle,
                    indexes,
                    types,
                }
            }
            Opcode::CreateHandle | Opcode::AddValue | Opcode::ModifyValue => Self::Values {
                handle: Handle::decode(buf)?,
                values: Vec::<HandleValue>::decode(buf)?,
            },
            Opcode::RemoveValue => Self::RemoveValues {
                handle: Handle::decode(buf)?,
                indexes: Vec::<u32>::decode(buf)?,
            },
            Opcode::SessionSetup => Self::SessionSetup(SessionSetupRequest::decode(buf)?),
            Opcode::SessionExchangeKey => Self::ExchangeKey {
                encrypted_key: read_byte_array(buf)?,
            },
            Opcode::ChallengeResponse => Self::ChallengeAnswer {
                auth_type: read_byte_array(buf)?,
                identity: ValueReference::decode(buf)?,
                response: read_byte_array(buf)?,
            },
            Opcode::VerifyChallenge => Self::VerifyChallenge {
                identity: ValueReference::decode(buf)?,
                nonce: read_byte_array(buf)?,
                request_digest: read_byte_array(buf)?,
                response: read_byte_array(buf)?,
            },
            Opcode::RetrieveTxnLog => Self::RetrieveTxn(RetrieveTxnRequest {
                shard: ReplicaShard::decode(buf)?,
                positions: Vec::<ReplicationPosition>::decode(buf)?,
            }),
            Opcode::DumpHandles => {
                let shard = ReplicaShard::decode(buf)?;
                let resume = match bool::decode(buf)? {
                    true => Some(DumpResume {
                        kind: ResumeKind::from_u8(u8::decode(buf)?)?,
                        after: read_byte_array(buf)?,
                    }),
                    false => None,
                };
                Self::DumpHandles(DumpHandlesRequest { shard, resume })
            }
            Opcode::Reserved => return Err(DecodeError::InvalidEnumTag(0)),
            Opcode::GetSiteInfo | Opcode::SessionTerminate if !buf.has_remaining() => Self::Empty,
            Opcode::GetSiteInfo
            | Opcode::DeleteHandle
            | Opcode::ListHandles
            | Opcode::ListNas
            | Opcode::HomeNa
            | Opcode::UnhomeNa
            | Opcode::ListHomedNas
            | Opcode::SessionTerminate
            | Opcode::LoginIdSystem
            | Opcode::GetNextTxnId => Self::Handle {
                handle: Handle::decode(buf)?,
            },
        })
    }

    fn decode_success(opcode: Opcode, buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(match opcode {
            Opcode::Resolution => Self::Values {
                handle: Handle::decode(buf)?,
                values: Vec::<HandleValue>::decode(buf)?,
            },
            Opcode::GetSiteInfo => Self::SiteInfo(SiteInfo::decode(buf)?),
            Opcode::ListHandles | Opcode::ListNas | Opcode::ListHomedNas => Self::HandleList {
                handles: Vec::<Handle>::decode(buf)?,
            },
            Opcode::SessionSetup => Self::SessionSetupResponse {
                mode: KeyExchangeMode::from_u16(u16::decode(buf)?)?,
                data: read_byte_array(buf)?,
            },
            Opcode::VerifyChallenge => Self::VerifyChallengeResponse {
                valid: bool::decode(buf)?,
            },
            Opcode::GetNextTxnId => Self::NextTxnId {
                txn_id: u64::decode(buf)?,
            },
            Opcode::RetrieveTxnLog => Self::RetrieveTxnResponse {
                status: match u8::decode(buf)? {
                    1 => RetrieveTxnStatus::NeedToRedump,
                    2 => RetrieveTxnStatus::SendingTransactions,
                    tag => return Err(DecodeError::InvalidEnumTag(tag as u32)),
                },
            },
            _ => Self::Empty,
        })
    }
}

impl WireEncode for Body {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Empty => {}
            Self::Handle { handle } => handle.encode(buf),
            Self::Resolution {
                handle,
                indexes,
                types,
            } => {
                handle.encode(buf);
                indexes.encode(buf);
                buf.put_u32(types.len() as u32);
                for t in types {
                    write_byte_array(buf, t);
                }
            }
            Self::Values { handle, values } | Self::Referral { handle, values } => {
                handle.encode(buf);
                values.encode(buf);
            }
            Self::RemoveValues { handle, indexes } => {
                handle.encode(buf);
                indexes.encode(buf);
            }
            Self::SiteInfo(site) => site.encode(buf),
            Self::HandleList { handles } => handles.encode(buf),
            Self::SessionSetup(req) => req.encode(buf),
            Self::SessionSetupResponse { mode, data } => {
                buf.put_u16(*mode as u16);
                write_byte_array(buf, data);
            }
            Self::ExchangeKey { encrypted_key } => write_byte_array(buf, encrypted_key),
            Self::Challenge {
                nonce,
                digest_alg,
                request_digest,
            } => {
                write_byte_array(buf, nonce);
                buf.put_u8(*digest_alg as u8);
                write_byte_array(buf, request_digest);
            }
            Self::ChallengeAnswer {
                auth_type,
                identity,
                response,
            } => {
                write_byte_array(buf, auth_type);
                identity.encode(buf);
                write_byte_array(buf, response);
            }
            Self::VerifyChallenge {
                identity,
                nonce,
                request_digest,
                response,
            } => {
                identity.encode(buf);
                write_byte_array(buf, nonce);
                write_byte_array(buf, request_digest);
                write_byte_array(buf, response);
            }
            Self::VerifyChallengeResponse { valid } => valid.encode(buf),
            Self::NextTxnId { txn_id } => buf.put_u64(*txn_id),
            Self::RetrieveTxn(req) => {
                req.shard.encode(buf);
                req.positions.encode(buf);
            }
            Self::RetrieveTxnResponse { status } => buf.put_u8(*status as u8),
            Self::DumpHandles(req) => {
                req.shard.encode(buf);
                match &req.resume {
                    Some(resume) => {
                        buf.put_u8(1);
                        buf.put_u8(resume.kind as u8);
                        write_byte_array(buf, &resume.after);
                    }
                    None => buf.put_u8(0),
                }
            }
            Self::Error { message } => write_byte_array(buf, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(opcode: Opcode, rc: ResponseCode, body: Body) {
        let mut bytes = body.to_bytes();
        let decoded = Body::decode_for(opcode, rc, &mut bytes).unwrap();
        assert_eq!(decoded, body);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_short_request_forms() {
        roundtrip(
            Opcode::Resolution,
            ResponseCode::Reserved,
            Body::Handle {
                handle: Handle::from("10.1000/1"),
            },
        );
        roundtrip(Opcode::GetSiteInfo, ResponseCode::Reserved, Body::Empty);
        roundtrip(Opcode::SessionTerminate, ResponseCode::Reserved, Body::Empty);
        roundtrip(
            Opcode::GetSiteInfo,
            ResponseCode::Reserved,
            Body::Handle {
                handle: Handle::default(),
            },
        );

        // Everything else still needs its full body.
        let mut empty = Bytes::new();
        assert!(Body::decode_for(Opcode::DeleteHandle, ResponseCode::Reserved, &mut empty).is_err());
        let mut truncated = Body::Handle {
            handle: Handle::from("10.1000/1"),
        }
        .to_bytes();
        assert!(Body::decode_for(Opcode::CreateHandle, ResponseCode::Reserved, &mut truncated).is_err());
    }

    #[test]
    fn test_request_bodies() {
        roundtrip(
            Opcode::Resolution,
            ResponseCode::Reserved,
            Body::Resolution {
                handle: Handle::from("10.1000/1"),
                indexes: vec![1, 2],
                types: vec![Bytes::from_static(b"URL")],
            },
        );
        roundtrip(
            Opcode::CreateHandle,
            ResponseCode::Reserved,
            Body::Values {
                handle: Handle::from("10.1000/1"),
                values: vec![HandleValue::new(1, "URL", "http://x")],
            },
        );
        roundtrip(
            Opcode::SessionSetup,
            ResponseCode::Reserved,
            Body::SessionSetup(SessionSetupRequest {
                mode: KeyExchangeMode::DiffieHellman,
                key_ref: None,
                exchange_data: Bytes::from_static(b"dh"),
                timeout_secs: 600,
                cipher: CipherAlgorithm::Aes,
                identity: Some(ValueReference::new("0.NA/10.1000", 300)),
                encrypt_all: true,
                authenticate_all: false,
            }),
        );
        roundtrip(
            Opcode::DumpHandles,
            ResponseCode::Reserved,
            Body::DumpHandles(DumpHandlesRequest {
                shard: ReplicaShard {
                    hash_option: HashOption::ByAll,
                    num_servers: 4,
                    server_num: 2,
                },
                resume: Some(DumpResume {
                    kind: ResumeKind::Handle,
                    after: Bytes::from_static(b"10.1000/5"),
                }),
            }),
        );
        roundtrip(
            Opcode::HomeNa,
            ResponseCode::Reserved,
            Body::Handle {
                handle: Handle::from("0.NA/10.1000"),
            },
        );
    }

    #[test]
    fn test_response_bodies() {
        roundtrip(
            Opcode::Resolution,
            ResponseCode::AuthenticationNeeded,
            Body::Challenge {
                nonce: Bytes::from_static(&[1; 16]),
                digest_alg: HashAlgorithm::Sha256,
                request_digest: Bytes::from_static(&[2; 32]),
            },
        );
        roundtrip(
            Opcode::Resolution,
            ResponseCode::ServiceReferral,
            Body::Referral {
                handle: Handle::from("0.NA/10.1000"),
                values: vec![HandleValue::new(1, "HS_SERV", "0.SERV/1")],
            },
        );
        roundtrip(
            Opcode::RetrieveTxnLog,
            ResponseCode::Success,
            Body::RetrieveTxnResponse {
                status: RetrieveTxnStatus::NeedToRedump,
            },
        );
        roundtrip(Opcode::CreateHandle, ResponseCode::Success, Body::Empty);
        roundtrip(
            Opcode::CreateHandle,
            ResponseCode::HandleAlreadyExists,
            Body::error("exists"),
        );
    }

    #[test]
    fn test_error_without_body() {
        let mut empty = Bytes::new();
        assert_eq!(
            Body::decode_for(Opcode::Resolution, ResponseCode::HandleNotFound, &mut empty).unwrap(),
            Body::Error {
                message: Bytes::new()
            }
        );
    }
}
