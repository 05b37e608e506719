//! The fixed 24-byte message header.

use bytes::{BufMut, Bytes, BytesMut};
use hs_core::{DecodeError, WireDecode, WireEncode, MAX_MESSAGE_LENGTH};

use super::flags::OpFlags;
use super::opcode::Opcode;
use super::response_code::ResponseCode;

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Operation.
    pub opcode: Opcode,
    /// Outcome; [`ResponseCode::Reserved`] on requests.
    pub response_code: ResponseCode,
    /// Operation flags.
    pub flags: OpFlags,
    /// Serial of the site info the sender used.
    pub site_info_serial: u16,
    /// Remaining recursion allowance.
    pub recursion_count: u8,
    /// Expiration in epoch seconds; 0 never expires.
    pub expiration: u32,
    /// Length of the body that follows.
    pub body_length: u32,
}

impl WireEncode for MessageHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.opcode.tag());
        buf.put_u32(self.response_code.tag());
        buf.put_u32(self.flags.0);
        buf.put_u16(self.site_info_serial);
        buf.put_u8(self.recursion_count);
        buf.put_u8(0);
        buf.put_u32(self.expiration);
        buf.put_u32(self.body_length);
    }
}

impl WireDecode for MessageHeader {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let opcode = Opcode::from_tag(u32::decode(buf)?)?;
        let response_code = ResponseCode::from_tag(u32::decode(buf)?)?;
        let flags = OpFlags(u32::decode(buf)?);
        let site_info_serial = u16::decode(buf)?;
        let recursion_count = u8::decode(buf)?;
        let _reserved = u8::decode(buf)?;
        let expiration = u32::decode(buf)?;
        let body_length = u32::decode(buf)?;
        if body_length as usize > MAX_MESSAGE_LENGTH {
            return Err(DecodeError::MessageTooLong(body_length as usize));
        }
        Ok(Self {
            opcode,
            response_code,
            flags,
            site_info_serial,
            recursion_count,
            expiration,
            body_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_core::MESSAGE_HEADER_SIZE;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader {
            opcode: Opcode::Resolution,
            response_code: ResponseCode::Reserved,
            flags: OpFlags(OpFlags::RECURSIVE),
            site_info_serial: 3,
            recursion_count: 4,
            expiration: 0x01020304,
            body_length: 9,
        };
        let bytes = header.to_bytes().to_vec();
        assert_eq!(bytes.len(), MESSAGE_HEADER_SIZE);
        assert_eq!(
            hex::encode(&bytes),
            "000000010000000010000000000304000102030400000009"
        );
        assert_eq!(MessageHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut bytes = MessageHeader {
            opcode: Opcode::Resolution,
            response_code: ResponseCode::Success,
            flags: OpFlags::default(),
            site_info_serial: 0,
            recursion_count: 0,
            expiration: 0,
            body_length: 0,
        }
        .to_bytes().to_vec();
        bytes[20..24].copy_from_slice(&(MAX_MESSAGE_LENGTH as u32 + 1).to_be_bytes());
        assert!(matches!(
            MessageHeader::from_bytes(&bytes),
            Err(DecodeError::MessageTooLong(_))
        ));
    }
}
