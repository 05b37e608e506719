//! Which transactions and handles a replica receives.
//!
//! A replica site shards handles across its servers by hash. A server only
//! gets the transactions whose handle hashes to its server number. Homing
//! and unhoming a naming authority is the exception: every server needs
//! to know which prefixes the site serves.

use hs_core::Handle;
use hs_proto::message::ReplicaShard;
use hs_proto::Transaction;

/// True if `handle` belongs to the server described by `shard`.
pub fn owns(shard: &ReplicaShard, handle: &Handle) -> bool {
    if shard.num_servers <= 1 {
        return true;
    }
    handle.server_number(shard.hash_option, shard.num_servers as usize) == shard.server_num as usize
}

/// True if `txn` should be sent to the server described by `shard`.
pub fn should_forward(shard: &ReplicaShard, txn: &Transaction) -> bool {
    if txn.action.is_na_action() || shard.num_servers <= 1 {
        return true;
    }
    txn.server_number(shard.hash_option, shard.num_servers as usize) == shard.server_num as usize
}

/// The transactions of `txns` that go to `shard`, in order.
pub fn forwardable(shard: &ReplicaShard, txns: Vec<Transaction>) -> Vec<Transaction> {
    txns.into_iter().filter(|t| should_forward(shard, t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_core::{HashOption, Timestamp};
    use hs_proto::TxnAction;

    fn shard(server_num: u32) -> ReplicaShard {
        ReplicaShard {
            hash_option: HashOption::ByAll,
            num_servers: 4,
            server_num,
        }
    }

    fn txn(handle: &str, action: TxnAction) -> Transaction {
        Transaction::new(1, Handle::from(handle), action, Timestamp::new(0), Vec::new())
    }

    #[test]
    fn test_each_transaction_goes_to_one_server() {
        for i in 0..50 {
            let t = txn(&format!("10.1/{i}"), TxnAction::UpdateHandle);
            let owners: Vec<u32> = (0..4).filter(|n| should_forward(&shard(*n), &t)).collect();
            assert_eq!(owners.len(), 1);
            assert!(owns(&shard(owners[0]), &t.handle));
        }
    }

    #[test]
    fn test_na_actions_broadcast() {
        let home = txn("0.NA/10.1", TxnAction::HomeNa);
        let unhome = txn("0.NA/10.1", TxnAction::UnhomeNa);
        for n in 0..4 {
            assert!(should_forward(&shard(n), &home));
            assert!(should_forward(&shard(n), &unhome));
        }
    }

    #[test]
    fn test_single_server_gets_everything() {
        let single = ReplicaShard {
            hash_option: HashOption::ByPrefix,
            num_servers: 1,
            server_num: 0,
        };
        let txns = vec![
            txn("10.1/a", TxnAction::AddHandle),
            txn("10.2/b", TxnAction::DeleteHandle),
        ];
        assert_eq!(forwardable(&single, txns).len(), 2);
    }
}
