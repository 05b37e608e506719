//! The dump protocol: a full snapshot of a server's handles.
//!
//! A dump opens with replication-info records for every queue, then sends
//! four sections in [`DumpSection`] order, then a terminator. Queue
//! positions are read before any handle is scanned, so transactions that
//! land during the dump are already in the snapshot and get applied again
//! afterwards. Reapplying them is harmless.
//!
//! A dump may resume from a section and the last key received in it.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hs_core::encoding::{read_byte_array, write_byte_array};
use hs_core::{Handle, Timestamp, WireDecode, WireEncode};
use hs_proto::message::{DumpHandlesRequest, ReplicaShard, ReplicationPosition};
use hs_proto::HandleValue;
use hs_store::{HandleStorage, StorageError, TransactionQueueSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::{ReplicationError, ReplicationResult};
use crate::forwarding::owns;
use crate::signed_stream::{RecordReader, RecordWriter, StreamRecord};
use crate::state::{DumpProgress, DumpSection, ReplicationState};

/// One record of a dump stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpRecord {
    /// Position of the dumping server's own queue.
    ThisServerInfo(ReplicationPosition),
    /// A handle and its values.
    Handle {
        /// The handle.
        handle: Handle,
        /// Its values.
        values: Vec<HandleValue>,
    },
    /// A homed naming authority.
    HomedNa(Handle),
    /// When a handle last changed.
    HandleDate {
        /// The handle.
        handle: Handle,
        /// Last change.
        date: Timestamp,
    },
    /// When a naming authority was last homed.
    NaDate {
        /// The naming authority.
        na: Handle,
        /// Last change.
        date: Timestamp,
    },
    /// Position of another source queue the dumping server mirrors.
    OtherSiteInfo(ReplicationPosition),
    /// End of the dump.
    Done,
}

impl StreamRecord for DumpRecord {
    fn tag(&self) -> u8 {
        match self {
            Self::ThisServerInfo(_) => 1,
            Self::Handle { .. } => 2,
            Self::HomedNa(_) => 3,
            Self::HandleDate { .. } => 4,
            Self::NaDate { .. } => 5,
            Self::OtherSiteInfo(_) => 6,
            Self::Done => 7,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::ThisServerInfo(p) | Self::OtherSiteInfo(p) => p.encode(buf),
            Self::Handle { handle, values } => {
                write_byte_array(buf, handle.as_bytes());
                values.encode(buf);
            }
            Self::HomedNa(na) => write_byte_array(buf, na.as_bytes()),
            Self::HandleDate { handle: key, date } | Self::NaDate { na: key, date } => {
                write_byte_array(buf, key.as_bytes());
                date.encode(buf);
            }
            Self::Done => {}
        }
    }

    fn decode_body(tag: u8, mut body: Bytes) -> ReplicationResult<Self> {
        let buf = &mut body;
        Ok(match tag {
            1 => Self::ThisServerInfo(ReplicationPosition::decode(buf)?),
            2 => Self::Handle {
                handle: Handle::new(read_byte_array(buf)?),
                values: Vec::<HandleValue>::decode(buf)?,
            },
            3 => Self::HomedNa(Handle::new(read_byte_array(buf)?)),
            4 => Self::HandleDate {
                handle: Handle::new(read_byte_array(buf)?),
                date: Timestamp::decode(buf)?,
            },
            5 => Self::NaDate {
                na: Handle::new(read_byte_array(buf)?),
                date: Timestamp::decode(buf)?,
            },
            6 => Self::OtherSiteInfo(ReplicationPosition::decode(buf)?),
            7 => Self::Done,
            other => return Err(ReplicationError::UnknownRecord(other)),
        })
    }

    fn is_end(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Counts of what a dump carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Handle records.
    pub handles: usize,
    /// Homed naming authorities.
    pub nas: usize,
}

/// Date of the newest value of a handle.
fn latest_change(values: &[HandleValue]) -> Timestamp {
    let secs = values.iter().map(|v| v.timestamp).max().unwrap_or(0);
    Timestamp::from_secs(secs as i64)
}

/// Writes a dump of `storage` for the replica described by `request`.
pub async fn write_dump<W: AsyncWrite + Unpin>(
    storage: &Arc<dyn HandleStorage>,
    queues: &TransactionQueueSet,
    request: &DumpHandlesRequest,
    out: &mut RecordWriter<W>,
) -> ReplicationResult<DumpSummary> {
    let now = Timestamp::now();
    let local = queues.local();
    out.write(&DumpRecord::ThisServerInfo(ReplicationPosition {
        queue: local.name().to_string(),
        last_txn_id: local.last_txn_id(),
        last_timestamp: now,
    }))
    .await?;
    for queue in queues.queues() {
        if queue.name() == local.name() {
            continue;
        }
        out.write(&DumpRecord::OtherSiteInfo(ReplicationPosition {
            queue: queue.name().to_string(),
            last_txn_id: queue.last_txn_id(),
            last_timestamp: now,
        }))
        .await?;
    }

    let resume = request
        .resume
        .as_ref()
        .map(|r| (DumpSection::from_resume_kind(r.kind), r.after.clone()));
    let mut summary = DumpSummary::default();
    for section in DumpSection::ALL {
        let after = match &resume {
            Some((start, _)) if section < *start => continue,
            Some((start, after)) if section == *start => Some(after.clone()),
            _ => None,
        };
        let after = after.as_deref();
        match section {
            DumpSection::HandleDates | DumpSection::Handles => {
                for handle in storage.scan_handles_from(after).await? {
                    if !owns(&request.shard, &handle) {
                        continue;
                    }
                    let Some(values) = storage.get_raw_handle_values(&handle).await? else {
                        continue;
                    };
                    let record = if section == DumpSection::HandleDates {
                        DumpRecord::HandleDate {
                            date: latest_change(&values),
                            handle,
                        }
                    } else {
                        summary.handles += 1;
                        DumpRecord::Handle { handle, values }
                    };
                    out.write(&record).await?;
                }
            }
            DumpSection::NaDates | DumpSection::Nas => {
                for na in storage.scan_nas_from(after).await? {
                    let record = if section == DumpSection::NaDates {
                        DumpRecord::NaDate { na, date: now }
                    } else {
                        summary.nas += 1;
                        DumpRecord::HomedNa(na)
                    };
                    out.write(&record).await?;
                }
            }
        }
        debug!(section = ?section, "dump section sent");
    }
    out.write(&DumpRecord::Done).await?;
    info!(
        handles = summary.handles,
        nas = summary.nas,
        resumed = request.resume.is_some(),
        "dump written"
    );
    Ok(summary)
}

/// Stores `values` under `handle`, creating or replacing it.
pub async fn put_handle(
    storage: &Arc<dyn HandleStorage>,
    handle: &Handle,
    values: Vec<HandleValue>,
) -> ReplicationResult<()> {
    match storage.update_value(handle, values.clone()).await {
        Ok(()) => Ok(()),
        Err(StorageError::NotFound(_)) => Ok(storage.create_handle(handle, values).await?),
        Err(e) => Err(e.into()),
    }
}

/// Applies a dump to `storage`.
///
/// Progress is tracked in `state` as records arrive, so an interrupted
/// dump can resume. Queue positions are committed only once the
/// terminator arrives.
pub async fn apply_dump<R: AsyncRead + Unpin>(
    input: &mut RecordReader<R>,
    storage: &Arc<dyn HandleStorage>,
    state: &mut ReplicationState,
) -> ReplicationResult<DumpSummary> {
    let mut summary = DumpSummary::default();
    loop {
        let record: DumpRecord = input.next().await?;
        let progress = match record {
            DumpRecord::ThisServerInfo(p) | DumpRecord::OtherSiteInfo(p) => {
                state.note_dump_position(&p);
                None
            }
            DumpRecord::HandleDate { handle, date } => {
                state.note_handle_date(&handle, date);
                Some((DumpSection::HandleDates, handle))
            }
            DumpRecord::NaDate { na, date } => {
                state.note_handle_date(&na, date);
                Some((DumpSection::NaDates, na))
            }
            DumpRecord::Handle { handle, values } => {
                put_handle(storage, &handle, values).await?;
                summary.handles += 1;
                Some((DumpSection::Handles, handle))
            }
            DumpRecord::HomedNa(na) => {
                storage.set_have_na(&na, true).await?;
                summary.nas += 1;
                Some((DumpSection::Nas, na))
            }
            DumpRecord::Done => break,
        };
        if let Some((section, after)) = progress {
            state.set_dump_progress(Some(DumpProgress { section, after }));
        }
    }
    state.commit_dump();
    info!(handles = summary.handles, nas = summary.nas, "dump applied");
    Ok(summary)
}

/// The shard that receives everything.
pub fn whole_site() -> ReplicaShard {
    ReplicaShard {
        hash_option: hs_core::HashOption::ByPrefix,
        num_servers: 1,
        server_num: 0,
    }
}
