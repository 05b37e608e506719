//! The 20-byte message envelope.
//!
//! Every message on every transport is preceded by an envelope. Over UDP a
//! message larger than one packet is split, each packet carrying its own
//! envelope with a sequence number.

use bytes::{BufMut, Bytes, BytesMut};
use hs_core::{DecodeError, WireDecode, WireEncode, MAX_MESSAGE_LENGTH, MESSAGE_ENVELOPE_SIZE};

use super::flags::{ENVELOPE_COMPRESSED, ENVELOPE_ENCRYPTED, ENVELOPE_TRUNCATED};
use super::version::ProtocolVersion;

/// Message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Envelope {
    /// Version of this message.
    pub version: ProtocolVersion,
    /// Highest version the sender would like to speak.
    pub suggested: ProtocolVersion,
    /// Envelope flags.
    pub flags: u8,
    /// Session id, 0 outside a session.
    pub session_id: u32,
    /// Request id correlating a response with its request.
    pub request_id: u32,
    /// Packet sequence number within a multi-packet message.
    pub sequence: u32,
    /// Length of the whole message (all packets).
    pub message_length: u32,
}

impl Envelope {
    /// True if the message bytes are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.flags & ENVELOPE_ENCRYPTED != 0
    }

    /// True if the message bytes are compressed.
    pub fn is_compressed(&self) -> bool {
        self.flags & ENVELOPE_COMPRESSED != 0
    }

    /// True if the message was truncated.
    pub fn is_truncated(&self) -> bool {
        self.flags & ENVELOPE_TRUNCATED != 0
    }

    /// Sets the encrypted flag.
    pub fn set_encrypted(&mut self, on: bool) {
        if on {
            self.flags |= ENVELOPE_ENCRYPTED;
        } else {
            self.flags &= !ENVELOPE_ENCRYPTED;
        }
    }

    /// Encodes into a fixed array.
    pub fn to_array(&self) -> [u8; MESSAGE_ENVELOPE_SIZE] {
        let mut out = [0u8; MESSAGE_ENVELOPE_SIZE];
        out.copy_from_slice(&self.to_bytes());
        out
    }
}

impl WireEncode for Envelope {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version.major);
        buf.put_u8(self.version.minor);
        buf.put_u8(self.flags);
        buf.put_u8(self.suggested.to_suggested_byte());
        buf.put_u32(self.session_id);
        buf.put_u32(self.request_id);
        buf.put_u32(self.sequence);
        buf.put_u32(self.message_length);
    }
}

impl WireDecode for Envelope {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let major = u8::decode(buf)?;
        let minor = u8::decode(buf)?;
        let flags = u8::decode(buf)?;
        let suggested = ProtocolVersion::from_suggested_byte(u8::decode(buf)?);
        let session_id = u32::decode(buf)?;
        let request_id = u32::decode(buf)?;
        let sequence = u32::decode(buf)?;
        let message_length = u32::decode(buf)?;
        if message_length as usize > MAX_MESSAGE_LENGTH {
            return Err(DecodeError::MessageTooLong(message_length as usize));
        }
        Ok(Self {
            version: ProtocolVersion::new(major, minor),
            suggested,
            flags,
            session_id,
            request_id,
            sequence,
            message_length,
        })
    }
}
