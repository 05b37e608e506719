//! What a replica knows about its sources.
//!
//! Positions and dump progress persist as JSON so a restarted replica
//! resumes where it stopped. Handle dates are kept in memory only; they
//! order transactions from several primaries against each other.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use hs_core::{Handle, Timestamp};
use hs_proto::message::{DumpResume, ReplicationPosition, ResumeKind};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{ReplicationError, ReplicationResult};

/// Sections of a dump, in the order they are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DumpSection {
    /// Last-modified dates of handles.
    HandleDates,
    /// Dates of homed naming authorities.
    NaDates,
    /// Handle records.
    Handles,
    /// Homed naming authorities.
    Nas,
}

impl DumpSection {
    /// Every section, in order.
    pub const ALL: [DumpSection; 4] = [Self::HandleDates, Self::NaDates, Self::Handles, Self::Nas];

    /// Wire resume kind.
    pub fn resume_kind(self) -> ResumeKind {
        match self {
            Self::HandleDates => ResumeKind::HandleReplicationDb,
            Self::NaDates => ResumeKind::NaReplicationDb,
            Self::Handles => ResumeKind::Handle,
            Self::Nas => ResumeKind::Na,
        }
    }

    /// Section for a wire resume kind.
    pub fn from_resume_kind(kind: ResumeKind) -> Self {
        match kind {
            ResumeKind::HandleReplicationDb => Self::HandleDates,
            ResumeKind::NaReplicationDb => Self::NaDates,
            ResumeKind::Handle => Self::Handles,
            ResumeKind::Na => Self::Nas,
        }
    }
}

/// Last key received in an interrupted dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpProgress {
    /// Section being received.
    pub section: DumpSection,
    /// Last key in that section.
    pub after: Handle,
}

impl DumpProgress {
    /// The resume point to send with the next dump request.
    pub fn to_resume(&self) -> DumpResume {
        DumpResume {
            kind: self.section.resume_kind(),
            after: self.after.bytes(),
        }
    }
}

/// Position in one source queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePosition {
    /// Last transaction applied.
    pub last_txn_id: u64,
    /// When it was retrieved.
    pub last_timestamp: Timestamp,
}

/// Replica-side replication state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationState {
    sources: BTreeMap<String, SourcePosition>,
    dump_progress: Option<DumpProgress>,
    #[serde(default)]
    dump_positions: BTreeMap<String, SourcePosition>,
    #[serde(skip)]
    handle_dates: HashMap<Handle, Timestamp>,
}

impl ReplicationState {
    /// Nothing replicated yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads state from `path`; a missing file is a fresh state.
    pub fn load(path: &Path) -> ReplicationResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ReplicationError::State(format!("{}: {e}", path.display())))
    }

    /// Saves state to `path`, replacing it atomically.
    pub fn save(&self, path: &Path) -> ReplicationResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ReplicationError::State(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "saved replication state");
        Ok(())
    }

    /// Position in `queue`.
    pub fn position(&self, queue: &str) -> SourcePosition {
        self.sources.get(queue).copied().unwrap_or_default()
    }

    /// Records that `queue` is applied through `last_txn_id`.
    pub fn set_position(&mut self, queue: &str, last_txn_id: u64, last_timestamp: Timestamp) {
        self.sources.insert(
            queue.to_string(),
            SourcePosition {
                last_txn_id,
                last_timestamp,
            },
        );
    }

    /// Every position, for a retrieve request.
    pub fn positions(&self) -> Vec<ReplicationPosition> {
        self.sources
            .iter()
            .map(|(queue, p)| ReplicationPosition {
                queue: queue.clone(),
                last_txn_id: p.last_txn_id,
                last_timestamp: p.last_timestamp,
            })
            .collect()
    }

    /// Forgets every position, before a full redump.
    pub fn clear_positions(&mut self) {
        self.sources.clear();
        self.dump_positions.clear();
        self.dump_progress = None;
        self.handle_dates.clear();
    }

    /// Notes a source position announced by a dump in progress.
    ///
    /// A resumed dump announces newer positions than the attempt it
    /// continues; the earliest one is kept so no transaction is skipped.
    pub fn note_dump_position(&mut self, position: &ReplicationPosition) {
        let entry = self
            .dump_positions
            .entry(position.queue.clone())
            .or_insert(SourcePosition {
                last_txn_id: position.last_txn_id,
                last_timestamp: position.last_timestamp,
            });
        if position.last_txn_id < entry.last_txn_id {
            entry.last_txn_id = position.last_txn_id;
            entry.last_timestamp = position.last_timestamp;
        }
    }

    /// Completes a dump: its positions become the source positions.
    pub fn commit_dump(&mut self) {
        let positions = std::mem::take(&mut self.dump_positions);
        self.sources.extend(positions);
        self.dump_progress = None;
    }

    /// Interrupted dump, if any.
    pub fn dump_progress(&self) -> Option<&DumpProgress> {
        self.dump_progress.as_ref()
    }

    /// Records dump progress.
    pub fn set_dump_progress(&mut self, progress: Option<DumpProgress>) {
        self.dump_progress = progress;
    }

    /// Date of the last change applied to `handle`.
    pub fn handle_date(&self, handle: &Handle) -> Option<Timestamp> {
        self.handle_dates.get(handle).copied()
    }

    /// Notes a change to `handle` at `date`, keeping the latest.
    pub fn note_handle_date(&mut self, handle: &Handle, date: Timestamp) {
        let entry = self.handle_dates.entry(handle.clone()).or_insert(date);
        if date > *entry {
            *entry = date;
        }
    }
}

/// Keeps the replication daemon out while dumps are produced.
///
/// Any number of dumps may run together; the daemon waits for all of them.
#[derive(Debug, Default)]
pub struct DaemonPause {
    lock: RwLock<()>,
}

impl DaemonPause {
    /// Not paused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Held while a dump is produced.
    pub async fn dump_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Held by the daemon for one replication round.
    pub async fn daemon_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_positions_and_dates() {
        let mut state = ReplicationState::new();
        state.set_position("", 42, Timestamp::new(1_000));
        state.set_position("site-b", 7, Timestamp::new(2_000));
        assert_eq!(state.position("").last_txn_id, 42);
        assert_eq!(state.position("unknown"), SourcePosition::default());
        let queues: Vec<_> = state.positions().into_iter().map(|p| p.queue).collect();
        assert_eq!(queues, vec!["".to_string(), "site-b".to_string()]);

        let handle = Handle::from("10.1/x");
        state.note_handle_date(&handle, Timestamp::new(500));
        state.note_handle_date(&handle, Timestamp::new(300));
        assert_eq!(state.handle_date(&handle), Some(Timestamp::new(500)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replication.json");
        assert!(ReplicationState::load(&path).unwrap().positions().is_empty());

        let mut state = ReplicationState::new();
        state.set_position("", 9, Timestamp::new(123));
        state.set_dump_progress(Some(DumpProgress {
            section: DumpSection::Handles,
            after: Handle::from("10.1/m"),
        }));
        state.note_handle_date(&Handle::from("10.1/x"), Timestamp::new(1));
        state.save(&path).unwrap();

        state.note_dump_position(&ReplicationPosition {
            queue: String::new(),
            last_txn_id: 12,
            last_timestamp: Timestamp::new(5),
        });
        state.save(&path).unwrap();

        let loaded = ReplicationState::load(&path).unwrap();
        assert_eq!(loaded.position("").last_txn_id, 9);
        let progress = loaded.dump_progress().unwrap();
        assert_eq!(progress.to_resume().kind, ResumeKind::Handle);
        assert_eq!(progress.after, Handle::from("10.1/m"));
        assert_eq!(loaded.handle_date(&Handle::from("10.1/x")), None);
    }

    #[test]
    fn test_resumed_dump_keeps_earliest_position() {
        let mut state = ReplicationState::new();
        state.set_position("", 3, Timestamp::new(1));
        let at = |id| ReplicationPosition {
            queue: String::new(),
            last_txn_id: id,
            last_timestamp: Timestamp::new(id as i64),
        };
        state.note_dump_position(&at(40));
        state.note_dump_position(&at(55));
        assert_eq!(state.position("").last_txn_id, 3);
        state.commit_dump();
        assert_eq!(state.position("").last_txn_id, 40);
        assert!(state.dump_progress().is_none());
    }

    #[tokio::test]
    async fn test_dumps_pause_daemon() {
        let pause = std::sync::Arc::new(DaemonPause::new());
        let dump = pause.dump_guard().await;
        let second = pause.dump_guard().await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), pause.daemon_guard()).await;
        assert!(blocked.is_err());
        drop(dump);
        drop(second);
        assert!(tokio::time::timeout(Duration::from_secs(1), pause.daemon_guard())
            .await
            .is_ok());
    }
}
