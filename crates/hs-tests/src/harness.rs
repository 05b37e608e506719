//! Test network harness: a root service and per-prefix sites.

use std::sync::Arc;

use hs_core::time::epoch_secs;
use hs_core::Handle;
use hs_net::{AuthenticationInfo, HandleResolver, ResolverConfig};
use hs_proto::bootstrap::ROOT_HANDLE;
use hs_proto::{BootstrapHandles, ValueReference};
use tracing::info;

use crate::site::{TestSite, TestSiteConfig};

/// Index of the administrator's secret key in each naming authority handle.
pub const ADMIN_KEY_INDEX: u32 = 300;

/// A test network: one root site holding `0.NA` handles, delegating each
/// registered prefix to a site of its own.
pub struct TestNetwork {
    root: Arc<TestSite>,
    /// Prefix sites in registration order
    sites: Vec<(String, Arc<TestSite>)>,
}

impl TestNetwork {
    /// Starts the root site.
    pub async fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let root = Arc::new(
            TestSite::start(TestSiteConfig {
                root: true,
                ..Default::default()
            })
            .await?,
        );
        root.put(&ROOT_HANDLE, vec![root.site_value(1)]).await?;
        info!(addr = %root.addr(), "root site started");
        Ok(Self {
            root,
            sites: Vec::new(),
        })
    }

    /// Creates a network with one site per prefix.
    pub async fn with_prefixes(prefixes: &[&str]) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut network = Self::new().await?;
        for prefix in prefixes {
            network.add_prefix(prefix).await?;
        }
        Ok(network)
    }

    /// Starts a site for `prefix`, delegates `0.NA/<prefix>` to it from the
    /// root, and homes the prefix there with its administrator.
    pub async fn add_prefix(&mut self, prefix: &str) -> Result<Arc<TestSite>, Box<dyn std::error::Error + Send + Sync>> {
        self.add_prefix_with(prefix, TestSiteConfig::default()).await
    }

    /// Like [`TestNetwork::add_prefix`] with a custom site configuration.
    pub async fn add_prefix_with(
        &mut self,
        prefix: &str,
        config: TestSiteConfig,
    ) -> Result<Arc<TestSite>, Box<dyn std::error::Error + Send + Sync>> {
        let site = Arc::new(TestSite::start(config).await?);
        let na = Self::na_handle(prefix);
        self.root.put(&na, vec![site.site_value(1)]).await?;
        site.home_with_admin(&na, &Self::admin(prefix), &Self::secret(prefix)).await?;

        self.sites.push((prefix.to_string(), site.clone()));
        info!(prefix, addr = %site.addr(), total = self.sites.len(), "Added prefix site to test network");
        Ok(site)
    }

    /// `0.NA/<prefix>`.
    pub fn na_handle(prefix: &str) -> Handle {
        Handle::from(format!("0.NA/{prefix}"))
    }

    /// The administrator identity of `prefix`.
    pub fn admin(prefix: &str) -> ValueReference {
        ValueReference::new(Self::na_handle(prefix), ADMIN_KEY_INDEX)
    }

    fn secret(prefix: &str) -> Vec<u8> {
        format!("{prefix}-secret").into_bytes()
    }

    /// Credentials of the administrator of `prefix`.
    pub fn admin_auth(prefix: &str) -> AuthenticationInfo {
        AuthenticationInfo::secret_key(Self::admin(prefix), Self::secret(prefix))
    }

    /// Bootstrap data pointing at the root site.
    pub fn bootstrap(&self) -> BootstrapHandles {
        let mut bootstrap = BootstrapHandles::default();
        bootstrap.set_values(&ROOT_HANDLE, vec![self.root.site_value(1)]);
        bootstrap.last_update = epoch_secs() as u64;
        bootstrap
    }

    /// A fresh resolver bootstrapped from the root site.
    pub fn resolver(&self) -> Arc<HandleResolver> {
        HandleResolver::new(ResolverConfig::default(), self.bootstrap())
    }

    /// The root site.
    pub fn root(&self) -> &Arc<TestSite> {
        &self.root
    }

    /// Returns the number of prefix sites.
    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Returns the site serving `prefix`.
    pub fn site(&self, prefix: &str) -> Option<&Arc<TestSite>> {
        self.sites.iter().find(|(p, _)| p == prefix).map(|(_, site)| site)
    }

    /// Stops every site.
    pub fn shutdown(&self) {
        self.root.shutdown();
        for (_, site) in &self.sites {
            site.shutdown();
        }
    }
}
