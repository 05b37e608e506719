//! Handle identifiers.
//!
//! A handle is an opaque byte string of the form `prefix/suffix`. The prefix
//! is compared ASCII case-insensitively, the suffix byte-for-byte. Servers
//! within a site are selected by hashing part of the normalized handle.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::encoding::{read_handle_bytes, write_byte_array, DecodeError, WireDecode, WireEncode};

/// Prefix under which naming authority handles live.
pub const NA_HANDLE_PREFIX: &[u8] = b"0.NA/";

/// Which part of a handle is hashed to pick a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum HashOption {
    /// Hash the prefix (naming authority) only.
    #[default]
    ByPrefix = 0,
    /// Hash the suffix only.
    BySuffix = 1,
    /// Hash the whole handle.
    ByAll = 2,
}

impl HashOption {
    /// Parses the wire tag.
    pub fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::ByPrefix),
            1 => Ok(Self::BySuffix),
            2 => Ok(Self::ByAll),
            _ => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

/// A handle: `prefix/suffix`, case-insensitive in its prefix.
#[derive(Clone, Default)]
pub struct Handle(Bytes);

impl Handle {
    /// Creates a handle from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Creates a handle from a static string.
    pub const fn from_static(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the underlying buffer.
    pub fn bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Returns the length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the handle is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn slash(&self) -> Option<usize> {
        let start = if self.is_na_handle() {
            NA_HANDLE_PREFIX.len()
        } else {
            0
        };
        self.0[start..]
            .iter()
            .position(|&b| b == b'/')
            .map(|pos| pos + start)
    }

    /// Returns true for `0.NA/...` naming authority handles.
    pub fn is_na_handle(&self) -> bool {
        self.0.len() >= NA_HANDLE_PREFIX.len()
            && self.0[..NA_HANDLE_PREFIX.len()].eq_ignore_ascii_case(NA_HANDLE_PREFIX)
    }

    /// The prefix part. A handle without a slash is all prefix.
    ///
    /// For `0.NA/X` handles the prefix is `0.NA/X` up to the next slash.
    pub fn prefix(&self) -> &[u8] {
        match self.slash() {
            Some(pos) => &self.0[..pos],
            None => &self.0,
        }
    }

    /// The suffix part, empty if there is no slash.
    pub fn suffix(&self) -> &[u8] {
        match self.slash() {
            Some(pos) => &self.0[pos + 1..],
            None => &[],
        }
    }

    /// Returns the handle with its prefix upper-cased.
    pub fn normalized(&self) -> Bytes {
        let prefix_len = self.prefix().len();
        let mut out = BytesMut::from(&self.0[..]);
        out[..prefix_len].make_ascii_uppercase();
        out.freeze()
    }

    /// The naming authority handle that owns this handle (`0.NA/<prefix>`).
    pub fn na_handle(&self) -> Handle {
        if self.is_na_handle() && self.suffix().is_empty() {
            return self.clone();
        }
        let prefix = self.prefix();
        let mut out = BytesMut::with_capacity(NA_HANDLE_PREFIX.len() + prefix.len());
        out.extend_from_slice(NA_HANDLE_PREFIX);
        out.extend_from_slice(prefix);
        Handle(out.freeze())
    }

    /// The part of the normalized handle hashed under `option`.
    fn hash_part(&self, option: HashOption) -> Bytes {
        let normalized = self.normalized();
        let prefix_len = self.prefix().len();
        match option {
            HashOption::ByPrefix => {
                if self.is_na_handle() {
                    normalized.slice(NA_HANDLE_PREFIX.len()..prefix_len)
                } else {
                    normalized.slice(..prefix_len)
                }
            }
            HashOption::BySuffix => {
                if prefix_len < normalized.len() {
                    normalized.slice(prefix_len + 1..)
                } else {
                    Bytes::new()
                }
            }
            HashOption::ByAll => normalized,
        }
    }

    /// Hash of the handle under `option`.
    ///
    /// MD5 over the hashed part, read as a big-endian i32 from the last four
    /// digest bytes. A pure function of the handle bytes.
    pub fn hash(&self, option: HashOption) -> i32 {
        let digest = Md5::digest(self.hash_part(option));
        i32::from_be_bytes([digest[12], digest[13], digest[14], digest[15]])
    }

    /// Selects a server number in `0..num_servers`.
    pub fn server_number(&self, option: HashOption, num_servers: usize) -> usize {
        server_number_for_hash(self.hash(option), num_servers)
    }

    /// Converts to a lossy UTF-8 string.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

/// Maps a precomputed handle hash onto `0..num_servers`.
pub fn server_number_for_hash(hash: i32, num_servers: usize) -> usize {
    if num_servers == 0 {
        return 0;
    }
    (hash.unsigned_abs() as usize) % num_servers
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.prefix(), other.prefix());
        a.eq_ignore_ascii_case(b) && self.suffix() == other.suffix() && self.len() == other.len()
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl Ord for Handle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl PartialOrd for Handle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.to_string_lossy())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&[u8]> for Handle {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for Handle {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl AsRef<[u8]> for Handle {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl WireEncode for Handle {
    fn encode(&self, buf: &mut BytesMut) {
        write_byte_array(buf, &self.0);
    }
}

impl WireDecode for Handle {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(read_handle_bytes(buf)?))
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_lossy())
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Handle::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_suffix() {
        let h = Handle::from("10.1000/abc/def");
        assert_eq!(h.prefix(), b"10.1000");
        assert_eq!(h.suffix(), b"abc/def");

        let na = Handle::from("0.NA/10.1000");
        assert_eq!(na.prefix(), b"0.NA/10.1000");
        assert!(na.suffix().is_empty());
        assert!(na.is_na_handle());
    }

    #[test]
    fn test_prefix_is_case_insensitive() {
        let a = Handle::from("abc.def/Suffix");
        let b = Handle::from("ABC.DEF/Suffix");
        let c = Handle::from("ABC.DEF/suffix");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.normalized(), Bytes::from_static(b"ABC.DEF/Suffix"));
    }

    #[test]
    fn test_na_handle() {
        assert_eq!(
            Handle::from("10.1000/x").na_handle(),
            Handle::from("0.NA/10.1000")
        );
        assert_eq!(
            Handle::from("0.na/10.1000").na_handle(),
            Handle::from("0.NA/10.1000")
        );
    }

    #[test]
    fn test_hash_is_stable_and_case_insensitive() {
        let h = Handle::from("10.1000/xyz");
        let first = h.hash(HashOption::ByAll);
        for _ in 0..10 {
            assert_eq!(h.hash(HashOption::ByAll), first);
        }
        assert_eq!(
            Handle::from("10.1000/a").hash(HashOption::ByPrefix),
            Handle::from("10.1000/b").hash(HashOption::ByPrefix)
        );
        assert_eq!(
            Handle::from("abc/a").hash(HashOption::ByPrefix),
            Handle::from("ABC/zzz").hash(HashOption::ByPrefix)
        );
    }

    #[test]
    fn test_na_handle_hashes_like_its_prefix() {
        assert_eq!(
            Handle::from("0.NA/10.1000").hash(HashOption::ByPrefix),
            Handle::from("10.1000/anything").hash(HashOption::ByPrefix)
        );
    }

    #[test]
    fn test_server_number_handles_min_value() {
        assert_eq!(server_number_for_hash(i32::MIN, 4), 0);
        assert_eq!(server_number_for_hash(-7, 4), 3);
        assert_eq!(server_number_for_hash(5, 0), 0);
    }

    #[test]
    fn test_wire_roundtrip() {
        let h = Handle::from("10.1000/1");
        let decoded = Handle::from_bytes(&h.to_bytes().to_vec()).unwrap();
        assert_eq!(decoded.as_bytes(), h.as_bytes());
    }
}
