//! Handle storage interface and an in-memory engine.
//!
//! The server treats storage as a key to value-set map keyed by handle,
//! plus a set of homed naming authorities. Scans return keys in byte order
//! so a dump can resume after the last key it sent.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use hs_core::{ErrorKind, Handle, HandleError};
use hs_proto::HandleValue;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

/// Errors from storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Handle already exists
    #[error("handle already exists: {0}")]
    AlreadyExists(Handle),

    /// Handle not found
    #[error("handle not found: {0}")]
    NotFound(Handle),

    /// Storage refuses writes
    #[error("storage is read only")]
    ReadOnly,

    /// Backend failure
    #[error("storage error: {0}")]
    Backend(String),
}

impl From<StorageError> for HandleError {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::AlreadyExists(_) => ErrorKind::HandleAlreadyExists,
            StorageError::NotFound(_) => ErrorKind::HandleDoesNotExist,
            StorageError::ReadOnly => ErrorKind::StorageReadOnly,
            StorageError::Backend(_) => ErrorKind::InternalError,
        };
        HandleError::new(kind, err.to_string())
    }
}

/// Storage backend consumed by the server.
#[async_trait]
pub trait HandleStorage: Send + Sync {
    /// Creates a handle with the given values.
    async fn create_handle(
        &self,
        handle: &Handle,
        values: Vec<HandleValue>,
    ) -> Result<(), StorageError>;

    /// Deletes a handle. Returns false if it did not exist.
    async fn delete_handle(&self, handle: &Handle) -> Result<bool, StorageError>;

    /// All values of a handle, or `None` if it does not exist.
    async fn get_raw_handle_values(
        &self,
        handle: &Handle,
    ) -> Result<Option<Vec<HandleValue>>, StorageError>;

    /// Replaces every value of an existing handle.
    async fn update_value(
        &self,
        handle: &Handle,
        values: Vec<HandleValue>,
    ) -> Result<(), StorageError>;

    /// Every handle, in key order.
    async fn scan_handles(&self) -> Result<Vec<Handle>, StorageError> {
        self.scan_handles_from(None).await
    }

    /// Handles strictly after `after`, in key order.
    async fn scan_handles_from(&self, after: Option<&[u8]>) -> Result<Vec<Handle>, StorageError>;

    /// Every homed naming authority, in key order.
    async fn scan_nas(&self) -> Result<Vec<Handle>, StorageError> {
        self.scan_nas_from(None).await
    }

    /// Homed naming authorities strictly after `after`, in key order.
    async fn scan_nas_from(&self, after: Option<&[u8]>) -> Result<Vec<Handle>, StorageError>;

    /// True if the naming authority is homed here.
    async fn have_na(&self, na: &Handle) -> Result<bool, StorageError>;

    /// Homes or unhomes a naming authority.
    async fn set_have_na(&self, na: &Handle, home: bool) -> Result<(), StorageError>;

    /// Removes every handle and naming authority.
    async fn delete_all_records(&self) -> Result<(), StorageError>;

    /// Flushes to durable storage.
    async fn checkpoint_database(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Releases resources.
    async fn shutdown(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// In-memory storage.
#[derive(Default)]
pub struct MemoryStorage {
    handles: RwLock<BTreeMap<Bytes, (Handle, Vec<HandleValue>)>>,
    nas: RwLock<BTreeSet<Bytes>>,
    read_only: bool,
}

impl MemoryStorage {
    /// Creates empty writable storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage that rejects writes.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Number of stored handles.
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    /// True if no handles are stored.
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }
}

fn keys_after<'a, V>(
    map: impl Iterator<Item = (&'a Bytes, V)>,
    after: Option<&[u8]>,
) -> impl Iterator<Item = (&'a Bytes, V)> {
    let after = after.map(|a| a.to_vec());
    map.filter(move |(k, _)| match &after {
        Some(a) => k.as_ref() > a.as_slice(),
        None => true,
    })
}

#[async_trait]
impl HandleStorage for MemoryStorage {
    async fn create_handle(
        &self,
        handle: &Handle,
        values: Vec<HandleValue>,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut handles = self.handles.write();
        let key = handle.normalized();
        if handles.contains_key(&key) {
            return Err(StorageError::AlreadyExists(handle.clone()));
        }
        debug!(handle = %handle, values = values.len(), "created handle");
        handles.insert(key, (handle.clone(), values));
        Ok(())
    }

    async fn delete_handle(&self, handle: &Handle) -> Result<bool, StorageError> {
        self.check_writable()?;
        Ok(self.handles.write().remove(&handle.normalized()).is_some())
    }

    async fn get_raw_handle_values(
        &self,
        handle: &Handle,
    ) -> Result<Option<Vec<HandleValue>>, StorageError> {
        Ok(self
            .handles
            .read()
            .get(&handle.normalized())
            .map(|(_, values)| values.clone()))
    }

    async fn update_value(
        &self,
        handle: &Handle,
        values: Vec<HandleValue>,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut handles = self.handles.write();
        match handles.get_mut(&handle.normalized()) {
            Some((_, stored)) => {
                *stored = values;
                Ok(())
            }
            None => Err(StorageError::NotFound(handle.clone())),
        }
    }

    async fn scan_handles_from(&self, after: Option<&[u8]>) -> Result<Vec<Handle>, StorageError> {
        let handles = self.handles.read();
        Ok(keys_after(handles.iter(), after)
            .map(|(_, (handle, _))| handle.clone())
            .collect())
    }

    async fn scan_nas_from(&self, after: Option<&[u8]>) -> Result<Vec<Handle>, StorageError> {
        let nas = self.nas.read();
        Ok(keys_after(nas.iter().map(|k| (k, ())), after)
            .map(|(k, _)| Handle::new(k.clone()))
            .collect())
    }

    async fn have_na(&self, na: &Handle) -> Result<bool, StorageError> {
        Ok(self.nas.read().contains(&na.normalized()))
    }

    async fn set_have_na(&self, na: &Handle, home: bool) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut nas = self.nas.write();
        if home {
            nas.insert(na.normalized());
        } else {
            nas.remove(&na.normalized());
        }
        debug!(na = %na, home, "naming authority updated");
        Ok(())
    }

    async fn delete_all_records(&self) -> Result<(), StorageError> {
        self.check_writable()?;
        self.handles.write().clear();
        self.nas.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Vec<HandleValue> {
        vec![HandleValue::new(1, "URL", "http://x")]
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemoryStorage::new();
        let h = Handle::from("10.1000/1");
        store.create_handle(&h, values()).await.unwrap();
        assert_eq!(
            store.create_handle(&h, values()).await,
            Err(StorageError::AlreadyExists(h.clone()))
        );
        assert_eq!(store.get_raw_handle_values(&h).await.unwrap(), Some(values()));
        assert!(store.delete_handle(&h).await.unwrap());
        assert!(!store.delete_handle(&h).await.unwrap());
        assert_eq!(store.get_raw_handle_values(&h).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_missing() {
        let store = MemoryStorage::new();
        let err = store
            .update_value(&Handle::from("10.1000/none"), values())
            .await
            .unwrap_err();
        assert_eq!(HandleError::from(err).kind(), ErrorKind::HandleDoesNotExist);
    }

    #[tokio::test]
    async fn test_scan_from() {
        let store = MemoryStorage::new();
        for s in ["10.1000/c", "10.1000/a", "10.1000/b"] {
            store.create_handle(&Handle::from(s), vec![]).await.unwrap();
        }
        let all = store.scan_handles().await.unwrap();
        assert_eq!(
            all,
            vec![
                Handle::from("10.1000/a"),
                Handle::from("10.1000/b"),
                Handle::from("10.1000/c")
            ]
        );
        let rest = store
            .scan_handles_from(Some(b"10.1000/a".as_slice()))
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0], Handle::from("10.1000/b"));
    }

    #[tokio::test]
    async fn test_nas() {
        let store = MemoryStorage::new();
        let na = Handle::from("0.NA/10.1000");
        store.set_have_na(&na, true).await.unwrap();
        assert!(store.have_na(&Handle::from("0.na/10.1000")).await.unwrap());
        assert_eq!(store.scan_nas().await.unwrap().len(), 1);
        store.set_have_na(&na, false).await.unwrap();
        assert!(!store.have_na(&na).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_only() {
        let store = MemoryStorage::read_only();
        let err = store
            .create_handle(&Handle::from("10.1000/1"), vec![])
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::ReadOnly);
        assert_eq!(HandleError::from(err).kind(), ErrorKind::StorageReadOnly);
    }
}
