//! Bootstrap handles and namespace chains.
//!
//! The bootstrap file carries the records a client needs before it can
//! resolve anything: the root service (`0.NA/0.NA`) with its `HS_SITE` and
//! `HS_PUBKEY` values, and optionally other pinned service handles.
//!
//! ```json
//! { "lastUpdate": 1700000000, "handles": { "0.NA/0.NA": { "values": [ ... ] } } }
//! ```
//!
//! Service handles can point at each other through `HS_SERV` values. Chains
//! are followed at most [`MAX_NAMESPACE_DEPTH`] levels deep; going deeper
//! is a [`ErrorKind::DepthLimitExceeded`] error, never a silent stop.

use std::collections::BTreeMap;
use std::sync::Arc;

use hs_core::crypto::PublicKey;
use hs_core::{ErrorKind, Handle, HandleError, HandleResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::site::SiteInfo;
use crate::value::{types, HandleValue, ValueReference};

/// Deepest `HS_SERV` chain or namespace nesting followed.
pub const MAX_NAMESPACE_DEPTH: usize = 5;

/// The global root service handle.
pub const ROOT_HANDLE: Handle = Handle::from_static("0.NA/0.NA");

/// Values of one bootstrap handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRecord {
    /// The handle's values.
    pub values: Vec<HandleValue>,
}

/// Root-of-trust data delivered by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapHandles {
    /// When the records were last refreshed, epoch seconds.
    #[serde(default)]
    pub last_update: u64,
    /// Records keyed by handle.
    #[serde(default)]
    pub handles: BTreeMap<String, BootstrapRecord>,
}

impl BootstrapHandles {
    /// Parses the JSON form.
    pub fn from_json(json: &str) -> HandleResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            HandleError::new(
                ErrorKind::ConfigurationError,
                format!("invalid bootstrap handles: {e}"),
            )
        })
    }

    /// Renders the JSON form.
    pub fn to_json(&self) -> HandleResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| HandleError::internal(e.to_string()))
    }

    /// Values of `handle`, matching the prefix case-insensitively.
    pub fn values(&self, handle: &Handle) -> Option<&[HandleValue]> {
        if let Some(record) = self.handles.get(&handle.to_string_lossy()) {
            return Some(&record.values);
        }
        self.handles
            .iter()
            .find(|(key, _)| Handle::from(key.as_str()) == *handle)
            .map(|(_, record)| record.values.as_slice())
    }

    /// Replaces the values of `handle`.
    pub fn set_values(&mut self, handle: &Handle, values: Vec<HandleValue>) {
        let key = self
            .handles
            .keys()
            .find(|key| Handle::from(key.as_str()) == *handle)
            .cloned()
            .unwrap_or_else(|| handle.to_string_lossy());
        self.handles.insert(key, BootstrapRecord { values });
    }

    /// True if the records are older than `max_age_secs` at `now_secs`.
    pub fn is_stale(&self, now_secs: u64, max_age_secs: u64) -> bool {
        now_secs.saturating_sub(self.last_update) > max_age_secs
    }

    /// Sites of the root service.
    pub fn root_sites(&self) -> HandleResult<Vec<SiteInfo>> {
        self.resolve_service(&ROOT_HANDLE)
    }

    /// Public keys published on the root handle.
    ///
    /// Values that fail to decode are skipped with a warning.
    pub fn root_keys(&self) -> Vec<(ValueReference, PublicKey)> {
        let Some(values) = self.values(&ROOT_HANDLE) else {
            return Vec::new();
        };
        values
            .iter()
            .filter(|v| v.has_type(types::HS_PUBKEY))
            .filter_map(|v| match PublicKey::decode(&v.data) {
                Ok(key) => Some((ValueReference::new(ROOT_HANDLE, v.index), key)),
                Err(err) => {
                    warn!(index = v.index, error = %err, "skipping undecodable root key");
                    None
                }
            })
            .collect()
    }

    /// Sites of a service handle, following `HS_SERV` references.
    pub fn resolve_service(&self, handle: &Handle) -> HandleResult<Vec<SiteInfo>> {
        self.resolve_service_at(handle, 0)
    }

    fn resolve_service_at(&self, handle: &Handle, depth: usize) -> HandleResult<Vec<SiteInfo>> {
        if depth > MAX_NAMESPACE_DEPTH {
            return Err(HandleError::depth_limit(MAX_NAMESPACE_DEPTH));
        }
        let values = self.values(handle).ok_or_else(|| {
            HandleError::new(
                ErrorKind::ServiceNotFound,
                format!("no bootstrap record for {handle}"),
            )
        })?;

        let sites = sites_of(values)?;
        if !sites.is_empty() {
            return Ok(sites);
        }
        let mut out = Vec::new();
        for serv in values.iter().filter(|v| v.has_type(types::HS_SERV)) {
            let target = Handle::new(serv.data.clone());
            out.extend(self.resolve_service_at(&target, depth + 1)?);
        }
        if out.is_empty() {
            return Err(HandleError::new(
                ErrorKind::ServiceNotFound,
                format!("{handle} has no HS_SITE or HS_SERV values"),
            ));
        }
        Ok(out)
    }
}

/// Decodes the `HS_SITE` values in a value set.
pub fn sites_of(values: &[HandleValue]) -> HandleResult<Vec<SiteInfo>> {
    values
        .iter()
        .filter(|v| v.has_type(types::HS_SITE) && !v.has_type(types::HS_SITE_PREFIX))
        .map(|v| SiteInfo::from_value_data(&v.data).map_err(HandleError::from))
        .collect()
}

/// Values of a naming authority together with its enclosing namespaces.
///
/// Lookups fall back to ancestors, so a derived prefix inherits service
/// information from its parent unless it overrides it.
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    handle: Handle,
    values: Vec<HandleValue>,
    parent: Option<Arc<NamespaceInfo>>,
    depth: usize,
}

impl NamespaceInfo {
    /// A top-level namespace.
    pub fn root(handle: Handle, values: Vec<HandleValue>) -> Self {
        Self {
            handle,
            values,
            parent: None,
            depth: 0,
        }
    }

    /// A namespace nested in `parent`.
    pub fn nested(
        handle: Handle,
        values: Vec<HandleValue>,
        parent: Arc<NamespaceInfo>,
    ) -> HandleResult<Self> {
        let depth = parent.depth + 1;
        if depth > MAX_NAMESPACE_DEPTH {
            return Err(HandleError::depth_limit(MAX_NAMESPACE_DEPTH));
        }
        Ok(Self {
            handle,
            values,
            parent: Some(parent),
            depth,
        })
    }

    /// Naming authority handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Own values.
    pub fn values(&self) -> &[HandleValue] {
        &self.values
    }

    /// Enclosing namespace.
    pub fn parent(&self) -> Option<&Arc<NamespaceInfo>> {
        self.parent.as_ref()
    }

    /// Nesting depth; 0 for a root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// First value of type `ty`, searching this namespace then its ancestors.
    pub fn find_value(&self, ty: &[u8]) -> Option<&HandleValue> {
        let mut current = Some(self);
        while let Some(ns) = current {
            if let Some(v) = ns.values.iter().find(|v| v.has_type(ty)) {
                return Some(v);
            }
            current = ns.parent.as_deref();
        }
        None
    }
}
