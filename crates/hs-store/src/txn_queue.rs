//! Transaction queues.
//!
//! A primary appends one [`Transaction`] per mutation. Replicas pull them
//! in id order; a queue may be trimmed, after which replicas that fell
//! behind must redump. A server fed by several primaries keeps one queue
//! per source, grouped in a [`TransactionQueueSet`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use hs_core::{Handle, Timestamp};
use hs_proto::{HandleValue, Transaction, TxnAction};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

/// An ordered, trimmable log of transactions.
pub trait TransactionQueue: Send + Sync {
    /// Queue name; empty for the local queue of a single-primary site.
    fn name(&self) -> &str;

    /// Records a mutation, assigning the next id and the current date.
    fn add_transaction(
        &self,
        handle: &Handle,
        action: TxnAction,
        values: Vec<HandleValue>,
    ) -> Transaction;

    /// Id the next transaction will get.
    fn next_txn_id(&self) -> u64;

    /// Id of the last transaction ever recorded, 0 if none.
    fn last_txn_id(&self) -> u64 {
        self.next_txn_id().saturating_sub(1)
    }

    /// When this queue started recording.
    fn first_date(&self) -> Timestamp;

    /// Earliest transaction still retained.
    fn first_retained(&self) -> Option<Transaction>;

    /// Retained transactions with id greater than `last_txn_id`, in order.
    fn transactions_after(&self, last_txn_id: u64) -> Vec<Transaction>;

    /// Drops transactions with id below `id`. Returns how many were dropped.
    fn trim_before(&self, id: u64) -> usize;
}

struct QueueInner {
    txns: VecDeque<Transaction>,
    next_id: u64,
}

/// Transaction queue held in memory.
pub struct MemoryTransactionQueue {
    name: String,
    first_date: Timestamp,
    inner: Mutex<QueueInner>,
}

impl MemoryTransactionQueue {
    /// Creates an empty queue starting now.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_first_date(name, Timestamp::now())
    }

    /// Creates an empty queue with a given start date.
    pub fn with_first_date(name: impl Into<String>, first_date: Timestamp) -> Self {
        Self {
            name: name.into(),
            first_date,
            inner: Mutex::new(QueueInner {
                txns: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    /// Appends a transaction produced elsewhere, keeping its id and date.
    ///
    /// Used by replicas mirroring another primary's queue. Ids at or below
    /// the last recorded id are ignored.
    pub fn append(&self, txn: Transaction) -> bool {
        let mut inner = self.inner.lock();
        if txn.id < inner.next_id {
            return false;
        }
        inner.next_id = txn.id + 1;
        inner.txns.push_back(txn);
        true
    }

    /// Number of retained transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().txns.len()
    }

    /// True if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().txns.is_empty()
    }
}

impl TransactionQueue for MemoryTransactionQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_transaction(
        &self,
        handle: &Handle,
        action: TxnAction,
        values: Vec<HandleValue>,
    ) -> Transaction {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let txn = Transaction::new(id, handle.clone(), action, Timestamp::now(), values);
        inner.txns.push_back(txn.clone());
        debug!(queue = %self.name, txn_id = id, handle = %handle, action = ?action, "recorded transaction");
        txn
    }

    fn next_txn_id(&self) -> u64 {
        self.inner.lock().next_id
    }

    fn first_date(&self) -> Timestamp {
        self.first_date
    }

    fn first_retained(&self) -> Option<Transaction> {
        self.inner.lock().txns.front().cloned()
    }

    fn transactions_after(&self, last_txn_id: u64) -> Vec<Transaction> {
        self.inner
            .lock()
            .txns
            .iter()
            .filter(|t| t.id > last_txn_id)
            .cloned()
            .collect()
    }

    fn trim_before(&self, id: u64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.txns.len();
        while inner.txns.front().is_some_and(|t| t.id < id) {
            inner.txns.pop_front();
        }
        let dropped = before - inner.txns.len();
        if dropped > 0 {
            info!(queue = %self.name, dropped, first_kept = id, "trimmed transaction queue");
        }
        dropped
    }
}

/// The queues a server serves, keyed by source name.
pub struct TransactionQueueSet {
    local: Arc<dyn TransactionQueue>,
    queues: RwLock<BTreeMap<String, Arc<dyn TransactionQueue>>>,
}

impl TransactionQueueSet {
    /// Creates a set around the local queue.
    pub fn new(local: Arc<dyn TransactionQueue>) -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(local.name().to_string(), local.clone());
        Self {
            local,
            queues: RwLock::new(queues),
        }
    }

    /// Adds the queue of another source. The local queue cannot be replaced.
    pub fn add_queue(&self, queue: Arc<dyn TransactionQueue>) {
        if queue.name() == self.local.name() {
            return;
        }
        self.queues.write().insert(queue.name().to_string(), queue);
    }

    /// The queue receiving this server's own mutations.
    pub fn local(&self) -> Arc<dyn TransactionQueue> {
        self.local.clone()
    }

    /// A queue by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TransactionQueue>> {
        self.queues.read().get(name).cloned()
    }

    /// Every queue name, in order.
    pub fn names(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    /// Every queue, in name order.
    pub fn queues(&self) -> Vec<Arc<dyn TransactionQueue>> {
        self.queues.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(queue: &MemoryTransactionQueue, n: usize) {
        for i in 0..n {
            queue.add_transaction(
                &Handle::from(format!("10.1000/{i}")),
                TxnAction::AddHandle,
                vec![],
            );
        }
    }

    #[test]
    fn test_ids_are_sequential() {
        let q = MemoryTransactionQueue::new("");
        assert_eq!(q.last_txn_id(), 0);
        fill(&q, 3);
        assert_eq!(q.next_txn_id(), 4);
        assert_eq!(q.last_txn_id(), 3);
        let ids: Vec<u64> = q.transactions_after(1).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_trim() {
        let q = MemoryTransactionQueue::new("");
        fill(&q, 100);
        assert_eq!(q.trim_before(80), 79);
        assert_eq!(q.first_retained().unwrap().id, 80);
        assert_eq!(q.transactions_after(50).len(), 21);
        // Trimming never changes the id sequence.
        assert_eq!(q.next_txn_id(), 101);
    }

    #[test]
    fn test_append_keeps_remote_ids() {
        let q = MemoryTransactionQueue::new("primary-b");
        let txn = Transaction::new(
            42,
            Handle::from("10.1000/x"),
            TxnAction::AddHandle,
            Timestamp::new(5),
            vec![],
        );
        assert!(q.append(txn.clone()));
        assert!(!q.append(txn));
        assert_eq!(q.next_txn_id(), 43);
    }

    #[test]
    fn test_queue_set() {
        let set = TransactionQueueSet::new(Arc::new(MemoryTransactionQueue::new("a")));
        set.add_queue(Arc::new(MemoryTransactionQueue::new("b")));
        assert_eq!(set.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(set.local().name(), "a");
        assert!(set.get("b").is_some());
        assert!(set.get("c").is_none());
    }
}
