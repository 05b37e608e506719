//! Keeps the root service information fresh.
//!
//! A refresh runs once per [`ResolverConfig::root_refresh_interval`],
//! whenever someone calls [`RootInfoUpdater::notify`], and whenever a
//! periodic check finds the bootstrap data stale. Triggers that arrive
//! while a refresh is running are coalesced into it.
//!
//! [`ResolverConfig::root_refresh_interval`]: crate::ResolverConfig::root_refresh_interval

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hs_core::HandleResult;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resolver::HandleResolver;

/// Where root information comes from.
#[async_trait]
pub trait RootSource: Send + Sync {
    /// Fetches and installs fresh root information.
    async fn refresh_root(&self) -> HandleResult<()>;

    /// True if the installed root information is too old.
    fn root_is_stale(&self) -> bool;
}

struct ResolverRoot(Arc<HandleResolver>);

#[async_trait]
impl RootSource for ResolverRoot {
    async fn refresh_root(&self) -> HandleResult<()> {
        self.0.refresh_root_info().await
    }

    fn root_is_stale(&self) -> bool {
        self.0.root_is_stale()
    }
}

/// Result of asking for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// This call ran the refresh and it succeeded.
    Updated,
    /// Another refresh was already running.
    AlreadyRunning,
}

/// Periodic and on-demand root refresh.
pub struct RootInfoUpdater {
    source: Arc<dyn RootSource>,
    interval: Duration,
    stale_check: Duration,
    updating: Mutex<bool>,
    wake: Notify,
}

impl RootInfoUpdater {
    /// Refreshes `resolver`'s root information at its configured interval.
    pub fn new(resolver: Arc<HandleResolver>) -> Arc<Self> {
        let interval = resolver.config().root_refresh_interval();
        Self::with_source(Arc::new(ResolverRoot(resolver)), interval)
    }

    /// Refreshes from any source every `interval`.
    pub fn with_source(source: Arc<dyn RootSource>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            interval,
            stale_check: interval.min(Duration::from_secs(60 * 60)),
            updating: Mutex::new(false),
            wake: Notify::new(),
        })
    }

    /// Asks the background task to refresh soon.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// True while a refresh is running.
    pub fn is_updating(&self) -> bool {
        *self.updating.lock()
    }

    /// Refreshes now unless a refresh is already running.
    pub async fn update_now(&self) -> HandleResult<UpdateOutcome> {
        {
            let mut updating = self.updating.lock();
            if *updating {
                debug!("root refresh already running");
                return Ok(UpdateOutcome::AlreadyRunning);
            }
            *updating = true;
        }
        let _guard = UpdatingGuard(&self.updating);
        self.source.refresh_root().await?;
        info!("root information refreshed");
        Ok(UpdateOutcome::Updated)
    }

    /// Runs the refresh loop until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut next_refresh = tokio::time::Instant::now() + self.interval;
            loop {
                let wait = self.stale_check.min(next_refresh.saturating_duration_since(tokio::time::Instant::now()));
                let due = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => true,
                    _ = tokio::time::sleep(wait) => {
                        tokio::time::Instant::now() >= next_refresh || self.source.root_is_stale()
                    }
                };
                if !due {
                    continue;
                }
                match self.update_now().await {
                    Ok(_) => next_refresh = tokio::time::Instant::now() + self.interval,
                    Err(err) => warn!(error = %err, "root refresh failed"),
                }
            }
            debug!("root updater stopped");
        })
    }
}

struct UpdatingGuard<'a>(&'a Mutex<bool>);

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
    }
}
