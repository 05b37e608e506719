//! A single-server Handle site for integration testing.

use std::net::SocketAddr;
use std::sync::Arc;

use hs_core::crypto::{generate_rsa_key, PrivateKey};
use hs_core::{Handle, WireEncode};
use hs_net::{HandleResolver, HandleServer, ServerConfig, ServerHandle, StorageRequestProcessor};
use hs_proto::{
    types, AdminPermissions, AdminRecord, HandleValue, Interface, InterfaceType, Protocol,
    ServerInfo, SiteInfo, ValueReference,
};
use hs_replication::ReplicationService;
use hs_store::{HandleStorage, MemoryStorage, MemoryTransactionQueue, TransactionQueueSet};
use tracing::info;

/// Configuration for a test site.
#[derive(Debug, Clone)]
pub struct TestSiteConfig {
    /// Listen address; port 0 picks a free one
    pub listen_addr: SocketAddr,
    /// Server number within the site
    pub server_id: u32,
    /// Accepts administrative requests
    pub primary: bool,
    /// Root service site
    pub root: bool,
    /// Identities allowed everything on this server
    pub server_admins: Vec<ValueReference>,
    /// Identities allowed to replicate from this site
    pub replicators: Vec<ValueReference>,
    /// RSA modulus size of the server key
    pub key_bits: usize,
}

impl Default for TestSiteConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            server_id: 1,
            primary: true,
            root: false,
            server_admins: Vec::new(),
            replicators: Vec::new(),
            key_bits: 1024,
        }
    }
}

/// A running site: one server over memory storage with a local
/// transaction queue and the replication service attached.
pub struct TestSite {
    /// Handle storage
    pub storage: Arc<dyn HandleStorage>,
    /// Local transaction queue
    pub queue: Arc<MemoryTransactionQueue>,
    /// All queues served to replicas
    pub queues: Arc<TransactionQueueSet>,
    /// Server key, published in the site record
    pub key: PrivateKey,
    /// Site record describing the running server
    pub site_info: SiteInfo,
    server: ServerHandle,
}

impl TestSite {
    /// Starts a site with the given configuration.
    pub async fn start(config: TestSiteConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Self::launch(config, None).await
    }

    /// Starts a site that resolves handles it does not hold through
    /// `resolver` when asked to recurse.
    pub async fn start_recursive(
        config: TestSiteConfig,
        resolver: Arc<HandleResolver>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Self::launch(config, Some(resolver)).await
    }

    async fn launch(
        config: TestSiteConfig,
        resolver: Option<Arc<HandleResolver>>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let key = generate_rsa_key(config.key_bits)?;
        let storage: Arc<dyn HandleStorage> = Arc::new(MemoryStorage::new());
        let queue = Arc::new(MemoryTransactionQueue::new(""));
        let queues = Arc::new(TransactionQueueSet::new(queue.clone()));

        let processor = Arc::new(StorageRequestProcessor::new(
            storage.clone(),
            queues.clone(),
            config.server_admins.clone(),
        ));
        let replication = ReplicationService::new(storage.clone(), queues.clone(), config.replicators.clone());
        let server_config = ServerConfig {
            listen_addr: config.listen_addr,
            server_id: config.server_id,
            server_admins: config.server_admins.clone(),
            allow_recursion: resolver.is_some(),
            ..ServerConfig::default()
        };
        let mut server = HandleServer::new(server_config, processor).with_streaming(Arc::new(replication));
        if let Some(resolver) = resolver {
            server = server.with_resolver(resolver);
        }
        let server = Arc::new(server);
        let server = server.start().await?;

        let port = server.tcp_addr.port();
        let mut site_info = SiteInfo::new(vec![ServerInfo {
            server_id: config.server_id,
            address: server.tcp_addr.ip(),
            public_key: key.public_key().encode(),
            interfaces: vec![
                Interface::new(InterfaceType::Both, Protocol::Tcp, port),
                Interface::new(InterfaceType::Both, Protocol::Udp, port),
            ],
        }]);
        site_info.is_primary = config.primary;
        site_info.is_root = config.root;

        info!(addr = %server.tcp_addr, primary = config.primary, root = config.root, "test site started");
        Ok(Self {
            storage,
            queue,
            queues,
            key,
            site_info,
            server,
        })
    }

    /// TCP address of the server.
    pub fn addr(&self) -> SocketAddr {
        self.server.tcp_addr
    }

    /// An `HS_SITE` value describing this site.
    pub fn site_value(&self, index: u32) -> HandleValue {
        HandleValue::new(index, types::HS_SITE, self.site_info.to_bytes())
    }

    /// Stores `handle` directly, bypassing the request path.
    pub async fn put(
        &self,
        handle: &Handle,
        values: Vec<HandleValue>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.storage.create_handle(handle, values).await?;
        Ok(())
    }

    /// Homes `na` here with an administrator holding a secret key at
    /// `admin`, granted every permission on the naming authority.
    pub async fn home_with_admin(
        &self,
        na: &Handle,
        admin: &ValueReference,
        secret: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let record = AdminRecord::new(admin.clone(), AdminPermissions::ALL);
        let mut values = vec![HandleValue::new(100, types::HS_ADMIN, record.to_bytes())];
        if admin.handle == *na {
            values.push(HandleValue::new(admin.index, types::HS_SECKEY, secret.to_vec()).private());
        } else {
            self.put(
                &admin.handle,
                vec![HandleValue::new(admin.index, types::HS_SECKEY, secret.to_vec()).private()],
            )
            .await?;
        }
        self.put(na, values).await?;
        self.storage.set_have_na(na, true).await?;
        Ok(())
    }

    /// Stops the server.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

impl Drop for TestSite {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_store::TransactionQueue;

    #[tokio::test]
    async fn test_site_describes_bound_server() {
        let site = TestSite::start(TestSiteConfig::default()).await.unwrap();
        let server = &site.site_info.servers[0];
        assert_eq!(server.address, site.addr().ip());
        assert!(server.interfaces.iter().all(|i| i.port == u32::from(site.addr().port())));
        assert!(site.site_info.is_primary);

        let decoded = SiteInfo::from_value_data(&site.site_value(1).data).unwrap();
        assert_eq!(decoded, site.site_info);
    }

    #[tokio::test]
    async fn test_home_with_admin() {
        let site = TestSite::start(TestSiteConfig::default()).await.unwrap();
        let na = Handle::from("0.NA/10.5");
        let admin = ValueReference::new(na.clone(), 300);
        site.home_with_admin(&na, &admin, b"secret").await.unwrap();

        let values = site.storage.get_raw_handle_values(&na).await.unwrap().unwrap();
        assert!(values.iter().any(|v| v.has_type(types::HS_ADMIN)));
        assert!(values.iter().any(|v| v.index == 300 && !v.public_read));
        assert!(site.storage.have_na(&na).await.unwrap());
        assert_eq!(site.queue.last_txn_id(), 0);
    }
}
