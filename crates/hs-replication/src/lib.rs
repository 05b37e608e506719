//! Replication between Handle servers.
//!
//! A source server answers two streamed requests: a full dump of its
//! handles, and the transactions recorded since a replica's last
//! position. Streams are made of typed records, optionally signed per
//! block. Replicas shard by handle hash; naming authority homing goes to
//! every server.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod dump;
pub mod error;
pub mod forwarding;
pub mod retrieve;
pub mod service;
pub mod signed_stream;
pub mod state;

pub use client::{ReplicationClient, ReplicationSource, SyncOutcome};
pub use dump::{apply_dump, write_dump, DumpRecord, DumpSummary};
pub use error::{ReplicationError, ReplicationResult};
pub use forwarding::{owns, should_forward};
pub use retrieve::{decide, decide_all, QueueDecision, RetrievePlan, TxnRecord};
pub use service::ReplicationService;
pub use signed_stream::{
    RecordReader, RecordWriter, SignedReader, SignedWriter, StreamMode, StreamSigner,
    StreamVerifier,
};
pub use state::{DaemonPause, DumpProgress, DumpSection, ReplicationState};
