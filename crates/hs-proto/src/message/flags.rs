//! Header op flags and envelope flags.

/// Bit flags of the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpFlags(pub u32);

impl OpFlags {
    /// Answer only from authoritative data.
    pub const AUTHORITATIVE: u32 = 0x8000_0000;
    /// Response must be signed.
    pub const CERTIFY: u32 = 0x4000_0000;
    /// Response must be encrypted.
    pub const ENCRYPT: u32 = 0x2000_0000;
    /// Server may recurse.
    pub const RECURSIVE: u32 = 0x1000_0000;
    /// Cached responses must be certified.
    pub const CACHE_CERTIFY: u32 = 0x0800_0000;
    /// More messages follow on the stream.
    pub const CONTINUOUS: u32 = 0x0400_0000;
    /// Keep the connection open.
    pub const KEEP_ALIVE: u32 = 0x0200_0000;
    /// Return only public values.
    pub const PUBLIC_ONLY: u32 = 0x0100_0000;
    /// Response carries a digest of the request.
    pub const RETURN_REQUEST_DIGEST: u32 = 0x0080_0000;
    /// Create may overwrite.
    pub const OVERWRITE: u32 = 0x0040_0000;
    /// Server mints the suffix.
    pub const MINT: u32 = 0x0020_0000;
    /// Server must not answer with a referral.
    pub const DO_NOT_REFER: u32 = 0x0010_0000;

    /// True if every bit of `flag` is set.
    pub fn has(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Sets or clears `flag`.
    pub fn set(&mut self, flag: u32, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Returns a copy with `flag` set.
    pub fn with(mut self, flag: u32) -> Self {
        self.set(flag, true);
        self
    }
}

/// Envelope flag: body is compressed.
pub const ENVELOPE_COMPRESSED: u8 = 0x80;
/// Envelope flag: body is encrypted under the session key.
pub const ENVELOPE_ENCRYPTED: u8 = 0x40;
/// Envelope flag: message was truncated.
pub const ENVELOPE_TRUNCATED: u8 = 0x20;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let mut f = OpFlags::default().with(OpFlags::CERTIFY);
        assert!(f.has(OpFlags::CERTIFY));
        assert!(!f.has(OpFlags::ENCRYPT));
        f.set(OpFlags::CERTIFY, false);
        assert_eq!(f, OpFlags::default());
    }
}
