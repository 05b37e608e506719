//! Handle System server daemon.
//!
//! Provides:
//! - resolution and administration over TCP and UDP
//! - dumps and transaction streams for replicas
//! - optional recursion through a bootstrapped resolver
//! - optional replication from a primary site

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use hs_core::crypto::{generate_rsa_key, PrivateKey};
use hs_core::{Handle, HashOption, WireDecode};
use hs_net::{
    AuthenticationInfo, HandleResolver, HandleServer, ResolverConfig, RootInfoUpdater, ServerConfig,
    StorageRequestProcessor,
};
use hs_proto::message::ReplicaShard;
use hs_proto::{AddressMap, BootstrapHandles, Interface, InterfaceType, Protocol, ServerInfo, SiteInfo, ValueReference};
use hs_replication::{ReplicationClient, ReplicationService, ReplicationSource, StreamSigner};
use hs_store::{HandleStorage, MemoryStorage, MemoryTransactionQueue, TransactionQueueSet};

/// Handle server daemon.
#[derive(Parser)]
#[command(name = "hsd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.hs/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Run {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Parse the configuration and print what would run
    CheckConfig,
}

/// Where this server replicates from.
#[derive(Debug, Clone)]
struct ReplicationSettings {
    /// TCP address of the primary
    source: SocketAddr,
    /// Replicator identity on the primary
    identity: ValueReference,
    /// Secret key of that identity
    secret: String,
    /// Seconds between rounds
    interval_secs: u64,
    /// Persisted replication positions
    state_file: PathBuf,
    /// Accept TLS-mode streams
    trust_tls: bool,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    server: ServerConfig,
    /// PEM private key, generated on first start
    key_file: PathBuf,
    /// Where the server's public key is published
    key_identity: Option<ValueReference>,
    /// Address advertised in the site record; defaults to the listen address
    advertise: Option<IpAddr>,
    primary: bool,
    root: bool,
    num_servers: u32,
    hash_option: HashOption,
    description: Option<String>,
    resolver: ResolverConfig,
    /// Bootstrap handles for recursion
    bootstrap_file: Option<PathBuf>,
    /// Binary site records serving a prefix directly, keyed by prefix
    local_sites: BTreeMap<String, PathBuf>,
    /// Binary advertised-to-local address map
    local_address_file: Option<PathBuf>,
    /// Identities allowed to replicate from this server
    replicators: Vec<ValueReference>,
    replication: Option<ReplicationSettings>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            key_file: PathBuf::from("~/.hs/server.pem"),
            key_identity: None,
            advertise: None,
            primary: true,
            root: false,
            num_servers: 1,
            hash_option: HashOption::ByAll,
            description: None,
            resolver: ResolverConfig::default(),
            bootstrap_file: None,
            local_sites: BTreeMap::new(),
            local_address_file: None,
            replicators: Vec::new(),
            replication: None,
        }
    }
}

fn parse_refs(value: &toml::Value, what: &str) -> Result<Vec<ValueReference>> {
    value
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.parse().with_context(|| format!("Invalid {what} {s:?}")))
        .collect()
}

fn parse_hash_option(s: &str) -> Result<HashOption> {
    match s.to_ascii_lowercase().as_str() {
        "prefix" => Ok(HashOption::ByPrefix),
        "suffix" => Ok(HashOption::BySuffix),
        "all" => Ok(HashOption::ByAll),
        _ => anyhow::bail!("Unknown hash option {s:?}"),
    }
}

/// Parses the configuration text.
fn parse_config(content: &str) -> Result<DaemonConfig> {
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;
    let mut config = DaemonConfig::default();

    // [server]
    if let Some(server) = toml.get("server") {
        if let Some(listen) = server.get("listen").and_then(|v| v.as_str()) {
            config.server.listen_addr = listen.parse().context("Invalid listen address")?;
        }
        if let Some(id) = server.get("server_id").and_then(|v| v.as_integer()) {
            config.server.server_id = u32::try_from(id).context("Invalid server_id")?;
        }
        if let Some(secs) = server.get("session_timeout_secs").and_then(|v| v.as_integer()) {
            config.server.session_timeout_secs = u32::try_from(secs).context("Invalid session_timeout_secs")?;
        }
        if let Some(max) = server.get("max_sessions").and_then(|v| v.as_integer()) {
            config.server.max_sessions = usize::try_from(max).context("Invalid max_sessions")?;
        }
        if let Some(secs) = server.get("challenge_timeout_secs").and_then(|v| v.as_integer()) {
            config.server.challenge_timeout_secs = u64::try_from(secs).context("Invalid challenge_timeout_secs")?;
        }
        if let Some(recursion) = server.get("allow_recursion").and_then(|v| v.as_bool()) {
            config.server.allow_recursion = recursion;
        }
        if let Some(admins) = server.get("admins") {
            config.server.server_admins = parse_refs(admins, "server admin")?;
        }
        if let Some(key_file) = server.get("key_file").and_then(|v| v.as_str()) {
            config.key_file = PathBuf::from(key_file);
        }
        if let Some(identity) = server.get("key_identity").and_then(|v| v.as_str()) {
            config.key_identity = Some(identity.parse().context("Invalid key_identity")?);
        }
    }

    // [site]
    if let Some(site) = toml.get("site") {
        if let Some(address) = site.get("address").and_then(|v| v.as_str()) {
            config.advertise = Some(address.parse().context("Invalid site address")?);
        }
        if let Some(primary) = site.get("primary").and_then(|v| v.as_bool()) {
            config.primary = primary;
        }
        if let Some(root) = site.get("root").and_then(|v| v.as_bool()) {
            config.root = root;
        }
        if let Some(n) = site.get("num_servers").and_then(|v| v.as_integer()) {
            config.num_servers = u32::try_from(n).context("Invalid num_servers")?;
        }
        if let Some(hash) = site.get("hash_option").and_then(|v| v.as_str()) {
            config.hash_option = parse_hash_option(hash)?;
        }
        if let Some(description) = site.get("description").and_then(|v| v.as_str()) {
            config.description = Some(description.to_string());
        }
    }

    // [resolver]
    if let Some(resolver) = toml.get("resolver") {
        if let Some(bootstrap) = resolver.get("bootstrap_file").and_then(|v| v.as_str()) {
            config.bootstrap_file = Some(PathBuf::from(bootstrap));
        }
        if let Some(path) = resolver.get("local_address_file").and_then(|v| v.as_str()) {
            config.local_address_file = Some(PathBuf::from(path));
        }
        if let Some(sites) = resolver.get("local_sites").and_then(|v| v.as_table()) {
            for (prefix, path) in sites {
                let path = path
                    .as_str()
                    .with_context(|| format!("local site for {prefix:?} must be a file path"))?;
                config.local_sites.insert(prefix.clone(), PathBuf::from(path));
            }
        }
        config.resolver = resolver
            .clone()
            .try_into()
            .context("Invalid [resolver] section")?;
    }

    // [replication]
    if let Some(replication) = toml.get("replication") {
        if let Some(replicators) = replication.get("replicators") {
            config.replicators = parse_refs(replicators, "replicator")?;
        }
        if let Some(source) = replication.get("source").and_then(|v| v.as_str()) {
            let identity = replication
                .get("identity")
                .and_then(|v| v.as_str())
                .context("[replication] source needs an identity")?;
            let secret = replication
                .get("secret")
                .and_then(|v| v.as_str())
                .context("[replication] source needs a secret")?;
            config.replication = Some(ReplicationSettings {
                source: source.parse().context("Invalid replication source")?,
                identity: identity.parse().context("Invalid replication identity")?,
                secret: secret.to_string(),
                interval_secs: replication
                    .get("interval_secs")
                    .and_then(|v| v.as_integer())
                    .map(u64::try_from)
                    .transpose()
                    .context("Invalid interval_secs")?
                    .unwrap_or(60),
                state_file: replication
                    .get("state_file")
                    .and_then(|v| v.as_str())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("~/.hs/replication.json")),
                trust_tls: replication
                    .get("trust_tls")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            });
        }
    }

    Ok(config)
}

/// Load configuration from TOML file.
fn load_config(path: &Path) -> Result<DaemonConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!("No config file found at {:?}, using defaults", path);
        return Ok(DaemonConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    parse_config(&content)
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// RSA modulus size of generated server keys.
const SERVER_KEY_BITS: usize = 2048;

/// Load or generate the server key.
fn load_key(path: &Path, bits: usize) -> Result<PrivateKey> {
    let path = expand_tilde(path);

    if path.exists() {
        let pem = std::fs::read_to_string(&path).context("Failed to read key file")?;
        return PrivateKey::from_pkcs8_pem(&pem).context("Invalid key file");
    }

    info!("Generating new server key");
    let key = generate_rsa_key(bits).context("Failed to generate server key")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create key directory")?;
    }
    std::fs::write(&path, key.to_pkcs8_pem().context("Failed to encode server key")?)
        .context("Failed to write key file")?;
    info!("Saved new server key to {:?}", path);
    Ok(key)
}

/// The site record describing this server.
fn site_info(config: &DaemonConfig, key: &PrivateKey) -> SiteInfo {
    let listen = config.server.listen_addr;
    let port = listen.port();
    let mut site = SiteInfo::new(vec![ServerInfo {
        server_id: config.server.server_id,
        address: config.advertise.unwrap_or(listen.ip()),
        public_key: key.public_key().encode(),
        interfaces: vec![
            Interface::new(InterfaceType::Both, Protocol::Tcp, port),
            Interface::new(InterfaceType::Both, Protocol::Udp, port),
        ],
    }]);
    site.is_primary = config.primary;
    site.is_root = config.root;
    site.hash_option = config.hash_option;
    if let Some(description) = &config.description {
        site.attributes
            .push(("desc".as_bytes().to_vec().into(), description.as_bytes().to_vec().into()));
    }
    site
}

/// Applies local site overrides and address translations to a resolver.
fn apply_local_overrides(config: &DaemonConfig, resolver: &HandleResolver) -> Result<()> {
    for (prefix, path) in &config.local_sites {
        let path = expand_tilde(path);
        let bytes = std::fs::read(&path).with_context(|| format!("Failed to read site file {path:?}"))?;
        let site = SiteInfo::from_bytes(&bytes).with_context(|| format!("Invalid site file {path:?}"))?;
        let na = Handle::from(prefix.as_str()).na_handle();
        info!(%na, servers = site.servers.len(), "Local site override");
        resolver.set_local_sites(na, vec![site]);
    }
    if let Some(path) = &config.local_address_file {
        let path = expand_tilde(path);
        let bytes = std::fs::read(&path).with_context(|| format!("Failed to read address map {path:?}"))?;
        let map = AddressMap::from_bytes(&bytes).with_context(|| format!("Invalid address map {path:?}"))?;
        info!(entries = map.len(), "Local address map loaded");
        resolver.set_local_addresses(map);
    }
    Ok(())
}

fn load_bootstrap(path: &Path) -> Result<BootstrapHandles> {
    let path = expand_tilde(path);
    let json = std::fs::read_to_string(&path).with_context(|| format!("Failed to read bootstrap file {path:?}"))?;
    BootstrapHandles::from_json(&json).context("Invalid bootstrap file")
}

async fn run(config: DaemonConfig) -> Result<()> {
    let key = load_key(&config.key_file, SERVER_KEY_BITS)?;
    let storage: Arc<dyn HandleStorage> = Arc::new(MemoryStorage::new());
    let queues = Arc::new(TransactionQueueSet::new(Arc::new(MemoryTransactionQueue::new(""))));

    let processor = Arc::new(StorageRequestProcessor::new(
        storage.clone(),
        queues.clone(),
        config.server.server_admins.clone(),
    ));
    let mut replication = ReplicationService::new(storage.clone(), queues, config.replicators.clone());
    if let Some(identity) = &config.key_identity {
        replication = replication.with_signer(StreamSigner {
            key: key.clone(),
            identity: identity.clone(),
        });
    }
    let pause = replication.pause().clone();

    let mut server = HandleServer::new(config.server.clone(), processor)
        .with_streaming(Arc::new(replication))
        .with_site_info(site_info(&config, &key));
    if let Some(identity) = &config.key_identity {
        server = server.with_signing_key(key.clone(), identity.clone());
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.server.allow_recursion {
        match &config.bootstrap_file {
            Some(path) => {
                let resolver = HandleResolver::new(config.resolver.clone(), load_bootstrap(path)?);
                apply_local_overrides(&config, &resolver)?;
                tasks.push(RootInfoUpdater::new(resolver.clone()).spawn(cancel.clone()));
                server = server.with_resolver(resolver);
            }
            None => warn!("allow_recursion is set without a bootstrap_file, recursion disabled"),
        }
    }

    let handle = Arc::new(server).start().await.context("Failed to start server")?;
    info!(tcp = %handle.tcp_addr, udp = %handle.udp_addr, "Handle server listening");

    if let Some(settings) = &config.replication {
        let shard = ReplicaShard {
            hash_option: config.hash_option,
            num_servers: config.num_servers,
            server_num: config.server.server_id.saturating_sub(1),
        };
        let client = ReplicationClient::new(
            ReplicationSource {
                addr: settings.source,
                verifier: None,
                trust_tls: settings.trust_tls,
            },
            shard,
            AuthenticationInfo::secret_key(settings.identity.clone(), settings.secret.clone().into_bytes()),
            storage.clone(),
        )
        .with_pause(pause)
        .with_state_file(expand_tilde(&settings.state_file))
        .context("Failed to load replication state")?;
        info!(source = %settings.source, interval_secs = settings.interval_secs, "Replicating");
        tasks.push(Arc::new(client).spawn(Duration::from_secs(settings.interval_secs), cancel.clone()));
    }

    signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutting down...");
    cancel.cancel();
    handle.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task failed");
        }
    }
    handle.join().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let mut config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run { listen: None }) {
        Commands::Run { listen } => {
            if let Some(addr) = listen {
                config.server.listen_addr = addr;
            }
            run(config).await
        }
        Commands::CheckConfig => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_tilde(&path);
        assert!(!expanded.to_string_lossy().starts_with("~"));

        let absolute = PathBuf::from("/etc/hs.toml");
        assert_eq!(expand_tilde(&absolute), absolute);
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.listen_addr.port(), 2641);
        assert!(config.primary);
        assert!(config.replication.is_none());
    }

    #[test]
    fn test_parse_config_sections() {
        let config = parse_config(
            r#"
            [server]
            listen = "0.0.0.0:2641"
            server_id = 2
            allow_recursion = true
            admins = ["300:0.NA/10.1"]
            unknown = "ignored"

            [site]
            primary = false
            num_servers = 4
            hash_option = "prefix"

            [resolver]
            tcp_timeout_ms = 1500
            local_address_file = "/etc/hs/addresses.bin"

            [resolver.local_sites]
            "10.1000" = "/etc/hs/10.1000.site"

            [replication]
            replicators = ["300:0.NA/10.1"]
            source = "192.0.2.1:2641"
            identity = "300:0.NA/10.1"
            secret = "replicate"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.server_id, 2);
        assert!(config.server.allow_recursion);
        assert_eq!(config.server.server_admins, vec![ValueReference::new("0.NA/10.1", 300)]);
        assert!(!config.primary);
        assert_eq!(config.num_servers, 4);
        assert_eq!(config.hash_option, HashOption::ByPrefix);
        assert_eq!(config.resolver.tcp_timeout_ms, 1500);
        assert_eq!(config.local_sites["10.1000"], PathBuf::from("/etc/hs/10.1000.site"));
        assert_eq!(config.local_address_file, Some(PathBuf::from("/etc/hs/addresses.bin")));
        assert_eq!(config.replicators.len(), 1);
        let replication = config.replication.unwrap();
        assert_eq!(replication.secret, "replicate");
        assert_eq!(replication.interval_secs, 60);
    }

    #[test]
    fn test_replication_source_needs_identity() {
        let err = parse_config("[replication]\nsource = \"192.0.2.1:2641\"\n").unwrap_err();
        assert!(err.to_string().contains("identity"));
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.server.server_admins.is_empty());
    }

    #[test]
    fn test_key_generated_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/server.pem");
        let key = load_key(&path, 1024).unwrap();
        assert!(path.exists());
        let again = load_key(&path, 1024).unwrap();
        assert_eq!(key.public_key().encode(), again.public_key().encode());
    }
}
