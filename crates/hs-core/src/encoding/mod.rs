//! Wire encoding primitives for the Handle protocol.
//!
//! Every message, value and record is serialized with the same small set of
//! rules so that encoders are deterministic and decoders can reject malformed
//! input before allocating for it.
//!
//! # Encoding Rules
//!
//! - **Integers**: Big-endian, fixed width
//! - **Fixed Arrays**: Elements encoded consecutively without length prefix
//! - **Byte Arrays**: u32 length prefix followed by the raw bytes
//! - **Strings**: u32 byte length followed by UTF-8 bytes (no terminator)
//! - **Sequences**: u32 element count followed by the elements
//! - **Booleans**: one byte, 0 or 1
//!
//! Decoding fails with a [`DecodeError`] when a declared length exceeds
//! [`MAX_ARRAY_SIZE`], when a handle exceeds [`MAX_HANDLE_LENGTH`], or when the
//! buffer runs out. Oversized input is never truncated.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{MAX_ARRAY_SIZE, MAX_HANDLE_LENGTH, MAX_MESSAGE_LENGTH};

/// Errors during wire decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes to decode
    #[error("Insufficient bytes: expected {expected}, got {available}")]
    InsufficientBytes {
        /// Expected number of bytes
        expected: usize,
        /// Actually available bytes
        available: usize,
    },

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// Invalid enum tag
    #[error("Invalid enum tag: {0}")]
    InvalidEnumTag(u32),

    /// Declared array length exceeds the decode limit
    #[error("Array length {len} exceeds maximum {max}")]
    ArrayTooLarge {
        /// Declared length
        len: usize,
        /// Permitted maximum
        max: usize,
    },

    /// Handle exceeds the maximum handle length
    #[error("Handle length {0} exceeds maximum {MAX_HANDLE_LENGTH}")]
    HandleTooLong(usize),

    /// Message exceeds the maximum message length
    #[error("Message length {0} exceeds maximum {MAX_MESSAGE_LENGTH}")]
    MessageTooLong(usize),

    /// Trailing bytes after a complete structure
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    /// Custom decode error
    #[error("{0}")]
    Custom(String),
}

/// Trait for types with a Handle wire representation.
pub trait WireEncode {
    /// Encodes the value into the buffer.
    fn encode(&self, buf: &mut BytesMut);

    /// Returns the encoded byte representation.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Trait for types that can be decoded from the Handle wire representation.
pub trait WireDecode: Sized {
    /// Decodes from the front of the buffer, advancing it.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Decodes from a byte slice, rejecting trailing bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(value)
    }
}

/// Fails unless `buf` holds at least `needed` more bytes.
pub fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::InsufficientBytes {
            expected: needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Writes a u32 length prefix followed by the bytes.
pub fn write_byte_array(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u32::MAX as usize);
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Reads a length-prefixed byte array bounded by [`MAX_ARRAY_SIZE`].
pub fn read_byte_array(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    read_bounded_array(buf, MAX_ARRAY_SIZE)
}

/// Reads a length-prefixed byte array bounded by `max`.
pub fn read_bounded_array(buf: &mut Bytes, max: usize) -> Result<Bytes, DecodeError> {
    let len = u32::decode(buf)? as usize;
    if len > max {
        return Err(DecodeError::ArrayTooLarge { len, max });
    }
    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Reads a length-prefixed handle bounded by [`MAX_HANDLE_LENGTH`].
pub fn read_handle_bytes(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = u32::decode(buf)? as usize;
    if len > MAX_HANDLE_LENGTH {
        return Err(DecodeError::HandleTooLong(len));
    }
    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Reads an element count for a sequence, bounded by [`MAX_ARRAY_SIZE`].
pub fn read_count(buf: &mut Bytes) -> Result<usize, DecodeError> {
    let len = u32::decode(buf)? as usize;
    if len > MAX_ARRAY_SIZE {
        return Err(DecodeError::ArrayTooLarge {
            len,
            max: MAX_ARRAY_SIZE,
        });
    }
    Ok(len)
}

// ============================================================================
// Primitive implementations
// ============================================================================

macro_rules! impl_wire_int {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl WireEncode for $ty {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl WireDecode for $ty {
            fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
                ensure_remaining(buf, $size)?;
                Ok(buf.$get())
            }
        }
    };
}

impl_wire_int!(u8, 1, put_u8, get_u8);
impl_wire_int!(u16, 2, put_u16, get_u16);
impl_wire_int!(u32, 4, put_u32, get_u32);
impl_wire_int!(i32, 4, put_i32, get_i32);
impl_wire_int!(u64, 8, put_u64, get_u64);
impl_wire_int!(i64, 8, put_i64, get_i64);

impl WireEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl WireDecode for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

// ============================================================================
// Fixed array implementations
// ============================================================================

impl<const N: usize> WireEncode for [u8; N] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> WireDecode for [u8; N] {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        ensure_remaining(buf, N)?;
        let mut arr = [0u8; N];
        buf.copy_to_slice(&mut arr);
        Ok(arr)
    }
}

// ============================================================================
// Variable length implementations
// ============================================================================

impl WireEncode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        write_byte_array(buf, self);
    }
}

impl WireDecode for Bytes {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        read_byte_array(buf)
    }
}

impl WireEncode for &[u8] {
    fn encode(&self, buf: &mut BytesMut) {
        write_byte_array(buf, self);
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        write_byte_array(buf, self.as_bytes());
    }
}

impl WireDecode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let bytes = read_byte_array(buf)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

impl WireEncode for &str {
    fn encode(&self, buf: &mut BytesMut) {
        write_byte_array(buf, self.as_bytes());
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.len() <= u32::MAX as usize);
        buf.put_u32(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = read_count(buf)?;
        // Every element occupies at least one byte, so the remaining buffer
        // bounds the allocation even when the declared count is hostile.
        let mut vec = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            vec.push(T::decode(buf)?);
        }
        Ok(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_is_big_endian() {
        let encoded = 1u32.to_bytes();
        assert_eq!(encoded.to_vec(), vec![0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_byte_array_encoding() {
        let data: &[u8] = &[0xAA, 0xBB, 0xCC];
        let encoded = data.to_bytes();
        assert_eq!(
            encoded.to_vec(),
            vec![0x00, 0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC]
        );
    }

    #[test]
    fn test_string_encoding() {
        let s = String::from("URL");
        assert_eq!(s.to_bytes().to_vec(), vec![0, 0, 0, 3, b'U', b'R', b'L']);
        assert_eq!(String::from_bytes(&s.to_bytes()).unwrap(), "URL");
    }

    #[test]
    fn test_roundtrip_primitives() {
        let val: i32 = -1234567;
        assert_eq!(i32::from_bytes(&val.to_bytes()).unwrap(), val);

        let val: u64 = 0x0102030405060708;
        assert_eq!(val.to_bytes().to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(u64::from_bytes(&val.to_bytes()).unwrap(), val);
    }

    #[test]
    fn test_raw_copies_are_not_length_prefixed() {
        let raw = Bytes::from_static(&[0xAA, 0xBB]);
        assert_eq!(raw.to_vec(), vec![0xAA, 0xBB]);
        let owned: Vec<u8> = vec![1, 2, 3];
        assert_eq!(owned.to_vec(), vec![1, 2, 3]);

        // Encoding is explicit and carries the length.
        assert_eq!(raw.to_bytes().to_vec(), vec![0, 0, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_insufficient_bytes() {
        let result = u32::from_bytes(&[0x00, 0x01]);
        assert_eq!(
            result,
            Err(DecodeError::InsufficientBytes {
                expected: 4,
                available: 2
            })
        );
    }

    #[test]
    fn test_oversized_array_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_ARRAY_SIZE + 1) as u32);
        let mut bytes = buf.freeze();
        assert!(matches!(
            read_byte_array(&mut bytes),
            Err(DecodeError::ArrayTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_handle_rejected() {
        let mut buf = BytesMut::new();
        write_byte_array(&mut buf, &vec![b'a'; MAX_HANDLE_LENGTH + 1]);
        let mut bytes = buf.freeze();
        assert_eq!(
            read_handle_bytes(&mut bytes),
            Err(DecodeError::HandleTooLong(MAX_HANDLE_LENGTH + 1))
        );
    }

    #[test]
    fn test_hostile_sequence_count_does_not_allocate() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_ARRAY_SIZE as u32);
        let mut bytes = buf.freeze();
        assert!(matches!(
            Vec::<u32>::decode(&mut bytes),
            Err(DecodeError::InsufficientBytes { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert_eq!(
            u8::from_bytes(&[1, 2]),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_bool_rejects_other_values() {
        assert_eq!(bool::from_bytes(&[1]).unwrap(), true);
        assert!(bool::from_bytes(&[2]).is_err());
    }
}
