//! HS Store - Local state for Handle System clients and servers.
//!
//! Provides:
//! - An LRU value cache with TTL expiry and negative caching
//! - The handle storage interface and an in-memory engine
//! - Transaction queues recording every mutation for replication
//! - Verification of per-value signatures against trusted keys

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cache;
pub mod storage;
pub mod trust;
pub mod txn_queue;

pub use cache::{CacheConfig, CacheStats, CachedEntry, MemCache};
pub use storage::{HandleStorage, MemoryStorage, StorageError};
pub use trust::{TrustError, TrustPolicy, TrustReport, TrustedKeys};
pub use txn_queue::{MemoryTransactionQueue, TransactionQueue, TransactionQueueSet};
