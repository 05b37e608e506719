//! Replicated mutations.
//!
//! Every change a primary applies becomes a [`Transaction`] in its queue.
//! The three hashes are computed once at construction so that forwarding can
//! shard without rehashing.

use bytes::{BufMut, Bytes, BytesMut};
use hs_core::encoding::{read_handle_bytes, write_byte_array};
use hs_core::{DecodeError, Handle, HashOption, Timestamp, WireDecode, WireEncode};

use crate::value::HandleValue;

/// What a transaction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxnAction {
    /// Create a handle.
    AddHandle = 1,
    /// Delete a handle.
    DeleteHandle = 2,
    /// Replace a handle's values.
    UpdateHandle = 3,
    /// Home a naming authority.
    HomeNa = 4,
    /// Unhome a naming authority.
    UnhomeNa = 5,
    /// Delete everything.
    DeleteAll = 6,
}

impl TxnAction {
    /// Creates from a tag value.
    pub fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            1 => Ok(Self::AddHandle),
            2 => Ok(Self::DeleteHandle),
            3 => Ok(Self::UpdateHandle),
            4 => Ok(Self::HomeNa),
            5 => Ok(Self::UnhomeNa),
            6 => Ok(Self::DeleteAll),
            _ => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }

    /// True for home and unhome, which go to every replica.
    pub fn is_na_action(self) -> bool {
        matches!(self, Self::HomeNa | Self::UnhomeNa)
    }
}

/// One replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Queue-assigned id, strictly increasing.
    pub id: u64,
    /// Target handle.
    pub handle: Handle,
    /// Action.
    pub action: TxnAction,
    /// When the transaction was recorded.
    pub date: Timestamp,
    /// Hash of the handle by prefix.
    pub hash_on_prefix: i32,
    /// Hash of the handle by suffix.
    pub hash_on_suffix: i32,
    /// Hash of the whole handle.
    pub hash_on_all: i32,
    /// Value snapshot for add and update.
    pub values: Vec<HandleValue>,
}

impl Transaction {
    /// Creates a transaction and precomputes its hashes.
    pub fn new(
        id: u64,
        handle: Handle,
        action: TxnAction,
        date: Timestamp,
        values: Vec<HandleValue>,
    ) -> Self {
        Self {
            id,
            hash_on_prefix: handle.hash(HashOption::ByPrefix),
            hash_on_suffix: handle.hash(HashOption::BySuffix),
            hash_on_all: handle.hash(HashOption::ByAll),
            handle,
            action,
            date,
            values,
        }
    }

    /// Precomputed hash for `option`.
    pub fn hash(&self, option: HashOption) -> i32 {
        match option {
            HashOption::ByPrefix => self.hash_on_prefix,
            HashOption::BySuffix => self.hash_on_suffix,
            HashOption::ByAll => self.hash_on_all,
        }
    }

    /// Server number that owns this transaction in a site of `num_servers`.
    pub fn server_number(&self, option: HashOption, num_servers: usize) -> usize {
        hs_core::handle::server_number_for_hash(self.hash(option), num_servers)
    }
}

impl WireEncode for Transaction {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        write_byte_array(buf, self.handle.as_bytes());
        buf.put_u8(self.action as u8);
        buf.put_u64(self.date.as_millis() as u64);
        buf.put_i32(self.hash_on_prefix);
        buf.put_i32(self.hash_on_suffix);
        buf.put_i32(self.hash_on_all);
        self.values.encode(buf);
    }
}

impl WireDecode for Transaction {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            id: u64::decode(buf)?,
            handle: Handle::new(read_handle_bytes(buf)?),
            action: TxnAction::from_u8(u8::decode(buf)?)?,
            date: Timestamp::new(u64::decode(buf)? as i64),
            hash_on_prefix: i32::decode(buf)?,
            hash_on_suffix: i32::decode(buf)?,
            hash_on_all: i32::decode(buf)?,
            values: Vec::<HandleValue>::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let txn = Transaction::new(
            51,
            Handle::from("10.1000/abc"),
            TxnAction::AddHandle,
            Timestamp::new(1_700_000_000_000),
            vec![HandleValue::new(1, "URL", "http://x")],
        );
        assert_eq!(Transaction::from_bytes(&txn.to_bytes().to_vec()).unwrap(), txn);
    }

    #[test]
    fn test_sharding_is_stable() {
        let handle = Handle::from("10.1000/abc");
        let a = Transaction::new(1, handle.clone(), TxnAction::AddHandle, Timestamp::now(), vec![]);
        let b = Transaction::new(9, handle, TxnAction::DeleteHandle, Timestamp::new(0), vec![]);
        for option in [HashOption::ByPrefix, HashOption::BySuffix, HashOption::ByAll] {
            assert_eq!(a.server_number(option, 4), b.server_number(option, 4));
            assert!(a.server_number(option, 4) < 4);
        }
    }

    #[test]
    fn test_same_prefix_same_server_by_prefix() {
        let a = Transaction::new(1, "10.1000/a".into(), TxnAction::AddHandle, Timestamp::new(0), vec![]);
        let b = Transaction::new(2, "10.1000/b".into(), TxnAction::AddHandle, Timestamp::new(0), vec![]);
        assert_eq!(a.hash_on_prefix, b.hash_on_prefix);
    }

    #[test]
    fn test_unknown_action() {
        assert!(TxnAction::from_u8(9).is_err());
        assert!(TxnAction::HomeNa.is_na_action());
        assert!(!TxnAction::UpdateHandle.is_na_action());
    }
}
