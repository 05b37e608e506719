//! Handle values and value references.
//!
//! A [`HandleValue`] is one typed, timestamped, permission-tagged record in a
//! handle's value set. The first eight bytes of its encoding hold the index
//! and timestamp; digests and signatures cover only the bytes after
//! [`VALUE_DIGEST_OFFSET`], so re-timestamping a value keeps its signatures
//! valid.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use hs_core::crypto::HashAlgorithm;
use hs_core::encoding::{read_byte_array, write_byte_array};
use hs_core::{
    DecodeError, Handle, HandleError, WireDecode, WireEncode, MAX_RECOGNIZED_TTL,
    VALUE_DIGEST_OFFSET,
};
use serde::{Deserialize, Serialize};

/// Well-known value types.
pub mod types {
    /// Administrator record.
    pub const HS_ADMIN: &[u8] = b"HS_ADMIN";
    /// Site description.
    pub const HS_SITE: &[u8] = b"HS_SITE";
    /// Site description for prefix-level service.
    pub const HS_SITE_PREFIX: &[u8] = b"HS_SITE.PREFIX";
    /// Reference to a service handle.
    pub const HS_SERV: &[u8] = b"HS_SERV";
    /// Public key record.
    pub const HS_PUBKEY: &[u8] = b"HS_PUBKEY";
    /// Shared secret.
    pub const HS_SECKEY: &[u8] = b"HS_SECKEY";
    /// Administrator group list.
    pub const HS_VLIST: &[u8] = b"HS_VLIST";
    /// Signature over a digest container.
    pub const HS_SIGNATURE: &[u8] = b"HS_SIGNATURE";
    /// Alias to another handle.
    pub const HS_ALIAS: &[u8] = b"HS_ALIAS";
    /// Naming authority delegation.
    pub const HS_NA_DELEGATE: &[u8] = b"HS_NA_DELEGATE";
    /// Web address.
    pub const URL: &[u8] = b"URL";
    /// Email address.
    pub const EMAIL: &[u8] = b"EMAIL";
}

const PERM_ADMIN_READ: u8 = 0x8;
const PERM_ADMIN_WRITE: u8 = 0x4;
const PERM_PUBLIC_READ: u8 = 0x2;
const PERM_PUBLIC_WRITE: u8 = 0x1;

/// Default TTL for new values (one day).
pub const DEFAULT_TTL: u32 = 86_400;

/// How a value's TTL is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TtlType {
    /// Seconds after retrieval.
    #[default]
    Relative = 0,
    /// Absolute expiry time in epoch seconds.
    Absolute = 1,
}

impl TtlType {
    fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::Relative),
            1 => Ok(Self::Absolute),
            _ => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

/// A `(handle, index)` pointer to one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueReference {
    /// Handle holding the value.
    pub handle: Handle,
    /// Index of the value.
    pub index: u32,
}

impl ValueReference {
    /// Creates a reference.
    pub fn new(handle: impl Into<Handle>, index: u32) -> Self {
        Self {
            handle: handle.into(),
            index,
        }
    }
}

impl fmt::Display for ValueReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.handle)
    }
}

impl FromStr for ValueReference {
    type Err = HandleError;

    /// Parses `index:handle`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, handle) = s
            .split_once(':')
            .ok_or_else(|| HandleError::invalid_value(format!("bad value reference {s:?}")))?;
        let index = index
            .parse()
            .map_err(|_| HandleError::invalid_value(format!("bad index in {s:?}")))?;
        Ok(Self::new(handle, index))
    }
}

impl WireEncode for ValueReference {
    fn encode(&self, buf: &mut BytesMut) {
        self.handle.encode(buf);
        buf.put_u32(self.index);
    }
}

impl WireDecode for ValueReference {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            handle: Handle::decode(buf)?,
            index: u32::decode(buf)?,
        })
    }
}

/// One value record of a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ValueJson", into = "ValueJson")]
pub struct HandleValue {
    /// Index, unique within the handle.
    pub index: u32,
    /// Value type, dot-separated for subtypes.
    pub value_type: Bytes,
    /// Raw data.
    pub data: Bytes,
    /// TTL interpretation.
    pub ttl_type: TtlType,
    /// TTL in seconds (relative) or epoch seconds (absolute).
    pub ttl: u32,
    /// Last modification, epoch seconds.
    pub timestamp: u32,
    /// Cross references.
    pub references: Vec<ValueReference>,
    /// Readable by administrators.
    pub admin_read: bool,
    /// Writable by administrators.
    pub admin_write: bool,
    /// Readable by anyone.
    pub public_read: bool,
    /// Writable by anyone.
    pub public_write: bool,
}

impl HandleValue {
    /// Creates a value with default TTL and permissions
    /// (admin read/write, public read).
    pub fn new(index: u32, value_type: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            index,
            value_type: value_type.into(),
            data: data.into(),
            ttl_type: TtlType::Relative,
            ttl: DEFAULT_TTL,
            timestamp: 0,
            references: Vec::new(),
            admin_read: true,
            admin_write: true,
            public_read: true,
            public_write: false,
        }
    }

    /// Sets the TTL.
    pub fn with_ttl(mut self, ttl_type: TtlType, ttl: u32) -> Self {
        self.ttl_type = ttl_type;
        self.ttl = ttl;
        self
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Marks the value as not publicly readable.
    pub fn private(mut self) -> Self {
        self.public_read = false;
        self
    }

    /// Returns the type as a lossy string.
    pub fn type_str(&self) -> String {
        String::from_utf8_lossy(&self.value_type).into_owned()
    }

    /// Returns the data as a lossy string.
    pub fn data_str(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// True if the type equals `ty` or is a dotted subtype of it.
    ///
    /// `URL.METADATA` has type `URL`; `URLX` does not.
    pub fn has_type(&self, ty: &[u8]) -> bool {
        type_matches(&self.value_type, ty)
    }

    /// The permission bits as carried on the wire.
    pub fn permissions(&self) -> u8 {
        let mut perms = 0;
        if self.admin_read {
            perms |= PERM_ADMIN_READ;
        }
        if self.admin_write {
            perms |= PERM_ADMIN_WRITE;
        }
        if self.public_read {
            perms |= PERM_PUBLIC_READ;
        }
        if self.public_write {
            perms |= PERM_PUBLIC_WRITE;
        }
        perms
    }

    fn set_permissions(&mut self, perms: u8) {
        self.admin_read = perms & PERM_ADMIN_READ != 0;
        self.admin_write = perms & PERM_ADMIN_WRITE != 0;
        self.public_read = perms & PERM_PUBLIC_READ != 0;
        self.public_write = perms & PERM_PUBLIC_WRITE != 0;
    }

    /// TTL used for staleness checks, capped at [`MAX_RECOGNIZED_TTL`] when
    /// relative.
    pub fn effective_ttl(&self) -> u32 {
        match self.ttl_type {
            TtlType::Relative => self.ttl.min(MAX_RECOGNIZED_TTL),
            TtlType::Absolute => self.ttl,
        }
    }

    /// True if the value, retrieved at `retrieved_at` (epoch seconds), is
    /// stale at `now`.
    ///
    /// A relative TTL of zero is always expired.
    pub fn is_expired(&self, retrieved_at: u32, now: u32) -> bool {
        match self.ttl_type {
            TtlType::Relative => {
                let ttl = self.effective_ttl();
                ttl == 0 || now as u64 >= retrieved_at as u64 + ttl as u64
            }
            TtlType::Absolute => now >= self.ttl,
        }
    }

    /// Equality on every field except the timestamp.
    pub fn equals_ignore_timestamp(&self, other: &Self) -> bool {
        self.index == other.index
            && self.value_type == other.value_type
            && self.data == other.data
            && self.ttl_type == other.ttl_type
            && self.ttl == other.ttl
            && self.references == other.references
            && self.permissions() == other.permissions()
    }

    /// Digest over the encoding past [`VALUE_DIGEST_OFFSET`].
    pub fn digest(&self, alg: HashAlgorithm) -> Vec<u8> {
        let encoded = self.to_bytes();
        alg.digest(&encoded[VALUE_DIGEST_OFFSET..])
    }
}

/// Dotted subtype match, case-insensitive.
pub fn type_matches(value_type: &[u8], ty: &[u8]) -> bool {
    if value_type.len() < ty.len() || !value_type[..ty.len()].eq_ignore_ascii_case(ty) {
        return false;
    }
    value_type.len() == ty.len() || value_type[ty.len()] == b'.'
}

impl WireEncode for HandleValue {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.timestamp);
        buf.put_u8(self.ttl_type as u8);
        buf.put_u32(self.ttl);
        buf.put_u8(self.permissions());
        write_byte_array(buf, &self.value_type);
        write_byte_array(buf, &self.data);
        self.references.encode(buf);
    }
}

impl WireDecode for HandleValue {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let index = u32::decode(buf)?;
        let timestamp = u32::decode(buf)?;
        let ttl_type = TtlType::from_u8(u8::decode(buf)?)?;
        let ttl = u32::decode(buf)?;
        let perms = u8::decode(buf)?;
        let value_type = read_byte_array(buf)?;
        let data = read_byte_array(buf)?;
        let references = Vec::<ValueReference>::decode(buf)?;

        let mut value = Self {
            index,
            value_type,
            data,
            ttl_type,
            ttl,
            timestamp,
            references,
            admin_read: false,
            admin_write: false,
            public_read: false,
            public_write: false,
        };
        value.set_permissions(perms);
        Ok(value)
    }
}

/// Binary types that are not rendered as text in JSON.
fn is_binary_type(ty: &[u8]) -> bool {
    [
        types::HS_ADMIN,
        types::HS_SITE,
        types::HS_PUBKEY,
        types::HS_SECKEY,
        types::HS_VLIST,
    ]
    .iter()
    .any(|t| type_matches(ty, t))
}

/// JSON shape of a value in bootstrap files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueJson {
    index: u32,
    #[serde(rename = "type")]
    value_type: String,
    data: DataJson,
    #[serde(default)]
    ttl_type: TtlType,
    #[serde(default = "default_ttl")]
    ttl: u32,
    #[serde(default)]
    timestamp: u32,
    #[serde(default = "default_permissions")]
    permissions: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    references: Vec<ValueReference>,
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn default_permissions() -> String {
    "1110".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "lowercase")]
enum DataJson {
    String(String),
    Base64(String),
}

impl From<HandleValue> for ValueJson {
    fn from(v: HandleValue) -> Self {
        let data = match std::str::from_utf8(&v.data) {
            Ok(s) if !is_binary_type(&v.value_type) => DataJson::String(s.to_string()),
            _ => DataJson::Base64(BASE64.encode(&v.data)),
        };
        let permissions = [v.admin_read, v.admin_write, v.public_read, v.public_write]
            .iter()
            .map(|&b| if b { '1' } else { '0' })
            .collect();
        Self {
            index: v.index,
            value_type: v.type_str(),
            data,
            ttl_type: v.ttl_type,
            ttl: v.ttl,
            timestamp: v.timestamp,
            permissions,
            references: v.references,
        }
    }
}

impl TryFrom<ValueJson> for HandleValue {
    type Error = String;

    fn try_from(j: ValueJson) -> Result<Self, Self::Error> {
        let data = match j.data {
            DataJson::String(s) => Bytes::from(s),
            DataJson::Base64(s) => Bytes::from(
                BASE64
                    .decode(s.as_bytes())
                    .map_err(|e| format!("invalid base64 data: {e}"))?,
            ),
        };
        let bits: Vec<bool> = j.permissions.chars().map(|c| c == '1').collect();
        if bits.len() != 4 {
            return Err(format!("invalid permissions {:?}", j.permissions));
        }
        Ok(Self {
            index: j.index,
            value_type: Bytes::from(j.value_type),
            data,
            ttl_type: j.ttl_type,
            ttl: j.ttl,
            timestamp: j.timestamp,
            references: j.references,
            admin_read: bits[0],
            admin_write: bits[1],
            public_read: bits[2],
            public_write: bits[3],
        })
    }
}
