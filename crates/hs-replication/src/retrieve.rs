//! Incremental replication: the retrieve-transactions protocol.
//!
//! The replica sends its position in every source queue. For each queue
//! the server decides whether it can still serve the missing history; if
//! any queue cannot, the answer is a redump. Otherwise the server streams
//! one [`TxnRecord::Queue`] header per queue followed by the transactions
//! the replica's shard receives.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hs_core::{Timestamp, WireDecode, WireEncode};
use hs_proto::message::{ReplicaShard, ReplicationPosition, RetrieveTxnStatus};
use hs_proto::{Transaction, TxnAction};
use hs_store::{HandleStorage, StorageError, TransactionQueue, TransactionQueueSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::dump::put_handle;
use crate::error::{ReplicationError, ReplicationResult};
use crate::forwarding::should_forward;
use crate::signed_stream::{RecordReader, RecordWriter, StreamRecord};
use crate::state::ReplicationState;

/// A replica whose last retrieval is this much older than the queue itself
/// missed the queue's start.
pub const QUEUE_START_GRACE: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// A new mirror asking for everything gets transactions instead of a dump
/// while the first transaction is younger than this.
pub const NEW_MIRROR_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// What to do for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueDecision {
    /// Send the transactions after `after`.
    Send {
        /// Last id the replica has.
        after: u64,
    },
    /// History is gone.
    Redump(String),
}

/// Decides whether `queue` can bring a replica at `last_txn_id`,
/// last retrieved at `last_timestamp`, up to date. A replica that never
/// retrieved anything sends a zero timestamp.
pub fn decide(
    queue: &dyn TransactionQueue,
    last_txn_id: u64,
    last_timestamp: Timestamp,
    now: Timestamp,
) -> QueueDecision {
    let first = queue.first_retained();
    if last_txn_id == 0 && last_timestamp == Timestamp::new(0) {
        return match first {
            Some(t) if t.id == 1 && t.date >= now.sub(NEW_MIRROR_WINDOW) => {
                QueueDecision::Send { after: 0 }
            }
            _ => QueueDecision::Redump("new mirror and history is not fresh".to_string()),
        };
    }
    if last_txn_id > queue.last_txn_id() {
        return QueueDecision::Redump(format!(
            "replica at {last_txn_id} is ahead of the queue at {}",
            queue.last_txn_id()
        ));
    }
    if last_timestamp.add(QUEUE_START_GRACE) < queue.first_date() {
        return QueueDecision::Redump("last retrieval predates the queue".to_string());
    }
    match first {
        Some(t) if t.id > last_txn_id + 1 => QueueDecision::Redump(format!(
            "transactions {} to {} were trimmed",
            last_txn_id + 1,
            t.id - 1
        )),
        None if last_txn_id < queue.last_txn_id() => {
            QueueDecision::Redump("queue trimmed to nothing".to_string())
        }
        _ => QueueDecision::Send { after: last_txn_id },
    }
}

/// Per-queue plan for a retrieve request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievePlan {
    /// At least one queue lost history.
    Redump,
    /// Send each queue from the given id.
    Send(Vec<(Arc<str>, u64)>),
}

impl RetrievePlan {
    /// Wire status for the response header.
    pub fn status(&self) -> RetrieveTxnStatus {
        match self {
            Self::Redump => RetrieveTxnStatus::NeedToRedump,
            Self::Send(_) => RetrieveTxnStatus::SendingTransactions,
        }
    }
}

/// Decides for every queue of `queues`. A queue the replica did not
/// mention is treated as never retrieved.
pub fn decide_all(
    queues: &TransactionQueueSet,
    positions: &[ReplicationPosition],
    now: Timestamp,
) -> RetrievePlan {
    for p in positions {
        if queues.get(&p.queue).is_none() {
            warn!(queue = %p.queue, "replica names an unknown queue");
        }
    }
    let mut sends = Vec::new();
    for queue in queues.queues() {
        let (last_txn_id, last_timestamp) = positions
            .iter()
            .find(|p| p.queue == queue.name())
            .map(|p| (p.last_txn_id, p.last_timestamp))
            .unwrap_or((0, Timestamp::new(0)));
        match decide(queue.as_ref(), last_txn_id, last_timestamp, now) {
            QueueDecision::Send { after } => sends.push((Arc::from(queue.name()), after)),
            QueueDecision::Redump(reason) => {
                info!(queue = %queue.name(), last_txn_id, reason = %reason, "replica must redump");
                return RetrievePlan::Redump;
            }
        }
    }
    RetrievePlan::Send(sends)
}

/// One record of a transaction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnRecord {
    /// Start of a queue's transactions. The replica is up to date through
    /// `through` once they are applied.
    Queue {
        /// Queue name.
        name: String,
        /// Last id covered.
        through: u64,
    },
    /// A transaction of the current queue.
    Txn(Transaction),
    /// End of the stream.
    Done,
}

impl StreamRecord for TxnRecord {
    fn tag(&self) -> u8 {
        match self {
            Self::Queue { .. } => 1,
            Self::Txn(_) => 2,
            Self::Done => 3,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::Queue { name, through } => {
                name.encode(buf);
                through.encode(buf);
            }
            Self::Txn(txn) => txn.encode(buf),
            Self::Done => {}
        }
    }

    fn decode_body(tag: u8, mut body: Bytes) -> ReplicationResult<Self> {
        let buf = &mut body;
        Ok(match tag {
            1 => Self::Queue {
                name: String::decode(buf)?,
                through: u64::decode(buf)?,
            },
            2 => Self::Txn(Transaction::decode(buf)?),
            3 => Self::Done,
            other => return Err(ReplicationError::UnknownRecord(other)),
        })
    }

    fn is_end(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Streams the transactions of `plan` that go to `shard`. Returns how many
/// were sent.
pub async fn write_transactions<W: AsyncWrite + Unpin>(
    queues: &TransactionQueueSet,
    plan: &[(Arc<str>, u64)],
    shard: &ReplicaShard,
    out: &mut RecordWriter<W>,
) -> ReplicationResult<usize> {
    let mut sent = 0;
    for (name, after) in plan {
        let Some(queue) = queues.get(name) else {
            continue;
        };
        let txns = queue.transactions_after(*after);
        let through = txns.last().map_or(*after, |t| t.id);
        out.write(&TxnRecord::Queue {
            name: name.to_string(),
            through,
        })
        .await?;
        for txn in txns.into_iter().filter(|t| should_forward(shard, t)) {
            out.write(&TxnRecord::Txn(txn)).await?;
            sent += 1;
        }
        debug!(queue = %name, after, through, "queue transactions sent");
    }
    out.write(&TxnRecord::Done).await?;
    Ok(sent)
}

/// Applies one transaction to `storage`.
///
/// Transactions older than the last change already applied to the handle
/// are skipped, so sources feeding one replica can interleave. Returns
/// false for a skipped transaction.
pub async fn apply_transaction(
    storage: &Arc<dyn HandleStorage>,
    state: &mut ReplicationState,
    txn: Transaction,
) -> ReplicationResult<bool> {
    if state.handle_date(&txn.handle).is_some_and(|d| txn.date < d) {
        debug!(txn_id = txn.id, handle = %txn.handle, "skipping stale transaction");
        return Ok(false);
    }
    match txn.action {
        TxnAction::AddHandle => match storage.create_handle(&txn.handle, txn.values.clone()).await {
            Err(StorageError::AlreadyExists(_)) => {
                storage.update_value(&txn.handle, txn.values.clone()).await?
            }
            other => other?,
        },
        TxnAction::UpdateHandle => put_handle(storage, &txn.handle, txn.values.clone()).await?,
        TxnAction::DeleteHandle => {
            storage.delete_handle(&txn.handle).await?;
        }
        TxnAction::HomeNa => storage.set_have_na(&txn.handle, true).await?,
        TxnAction::UnhomeNa => storage.set_have_na(&txn.handle, false).await?,
        TxnAction::DeleteAll => storage.delete_all_records().await?,
    }
    state.note_handle_date(&txn.handle, txn.date);
    Ok(true)
}

/// Applies a transaction stream, moving each queue's position once the
/// stream ends. Returns how many transactions were applied.
pub async fn apply_transactions<R: AsyncRead + Unpin>(
    input: &mut RecordReader<R>,
    storage: &Arc<dyn HandleStorage>,
    state: &mut ReplicationState,
) -> ReplicationResult<usize> {
    let now = Timestamp::now();
    let mut covered = Vec::new();
    let mut applied = 0;
    loop {
        match input.next::<TxnRecord>().await? {
            TxnRecord::Queue { name, through } => covered.push((name, through)),
            TxnRecord::Txn(txn) => {
                if covered.is_empty() {
                    return Err(ReplicationError::Compromised(
                        "transaction outside a queue".to_string(),
                    ));
                }
                if apply_transaction(storage, state, txn).await? {
                    applied += 1;
                }
            }
            TxnRecord::Done => break,
        }
    }
    for (name, through) in covered {
        state.set_position(&name, through, now);
    }
    Ok(applied)
}
