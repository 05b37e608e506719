//! Administrator records carried in `HS_ADMIN` values.
//!
//! Layout: permissions u16, admin handle, admin index u32. Writers older than
//! the 7.3 software line append two zero bytes; [`AdminRecord::decode`]
//! accepts both forms.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hs_core::encoding::write_byte_array;
use hs_core::{DecodeError, Handle, WireDecode, WireEncode};

use crate::value::ValueReference;

/// Bit set of administrative permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AdminPermissions(pub u16);

impl AdminPermissions {
    /// Create handles under the prefix.
    pub const ADD_HANDLE: u16 = 0x0001;
    /// Delete the handle.
    pub const DELETE_HANDLE: u16 = 0x0002;
    /// Home a naming authority.
    pub const ADD_NA: u16 = 0x0004;
    /// Unhome a naming authority.
    pub const DELETE_NA: u16 = 0x0008;
    /// Modify non-admin values.
    pub const MODIFY_VALUE: u16 = 0x0010;
    /// Remove non-admin values.
    pub const REMOVE_VALUE: u16 = 0x0020;
    /// Add non-admin values.
    pub const ADD_VALUE: u16 = 0x0040;
    /// Read admin-readable values.
    pub const READ_VALUE: u16 = 0x0080;
    /// Modify `HS_ADMIN` values.
    pub const MODIFY_ADMIN: u16 = 0x0100;
    /// Remove `HS_ADMIN` values.
    pub const REMOVE_ADMIN: u16 = 0x0200;
    /// Add `HS_ADMIN` values.
    pub const ADD_ADMIN: u16 = 0x0400;
    /// List handles under a prefix.
    pub const LIST_HANDLES: u16 = 0x0800;

    /// Every permission.
    pub const ALL: AdminPermissions = AdminPermissions(0x0fff);

    /// True if every bit of `perm` is set.
    pub fn has(self, perm: u16) -> bool {
        self.0 & perm == perm
    }
}

/// An administrator: who, and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRecord {
    /// Granted permissions.
    pub permissions: AdminPermissions,
    /// The administrator identity (a `HS_PUBKEY`, `HS_SECKEY` or `HS_VLIST`).
    pub admin: ValueReference,
}

impl AdminRecord {
    /// Creates a record.
    pub fn new(admin: ValueReference, permissions: AdminPermissions) -> Self {
        Self { permissions, admin }
    }

    /// Encodes with the two trailing zero bytes older readers expect.
    pub fn to_legacy_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.put_u16(0);
        buf.freeze()
    }

    /// Length of the legacy encoding.
    pub fn legacy_byte_length(&self) -> usize {
        self.to_bytes().len() + 2
    }
}

impl WireEncode for AdminRecord {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.permissions.0);
        write_byte_array(buf, self.admin.handle.as_bytes());
        buf.put_u32(self.admin.index);
    }
}

impl WireDecode for AdminRecord {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let permissions = AdminPermissions(u16::decode(buf)?);
        let handle = Handle::decode(buf)?;
        let index = u32::decode(buf)?;
        // Legacy trailer.
        if buf.remaining() == 2 && buf[..2] == [0, 0] {
            buf.advance(2);
        }
        Ok(Self {
            permissions,
            admin: ValueReference { handle, index },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AdminRecord {
        AdminRecord::new(
            ValueReference::new("0.NA/10.1000", 300),
            AdminPermissions(AdminPermissions::ADD_HANDLE | AdminPermissions::READ_VALUE),
        )
    }

    #[test]
    fn test_roundtrip() {
        let r = record();
        assert_eq!(AdminRecord::from_bytes(&r.to_bytes().to_vec()).unwrap(), r);
    }

    #[test]
    fn test_legacy_layout() {
        let r = record();
        let legacy = r.to_legacy_bytes();
        assert_eq!(legacy.len(), r.legacy_byte_length());
        assert_eq!(&legacy[legacy.len() - 2..], &[0, 0]);
        assert_eq!(AdminRecord::from_bytes(&legacy).unwrap(), r);
    }

    #[test]
    fn test_permissions() {
        let p = record().permissions;
        assert!(p.has(AdminPermissions::ADD_HANDLE));
        assert!(!p.has(AdminPermissions::DELETE_HANDLE));
        assert!(AdminPermissions::ALL.has(AdminPermissions::LIST_HANDLES));
    }
}
