//! The resolution engine.
//!
//! [`HandleResolver`] finds the sites responsible for a handle, then races
//! the request across their servers: a lane for recently preferred primaries
//! starting at once, and a lane for everything else starting after the Happy
//! Eyeballs delay (or as soon as the preferred lane gives up). Within a lane
//! protocols are tried in configured order, and within a protocol sites are
//! tried fastest first.
//!
//! A server that answers ends the race, whatever the response code; only
//! transport, decoding and security failures let the next candidate try.
//! Referrals are followed up to a configured number of hops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hs_core::crypto::PublicKey;
use hs_core::time::epoch_secs;
use hs_core::{ErrorKind, Handle, HandleError, HandleResult};
use hs_proto::bootstrap::{sites_of, ROOT_HANDLE};
use hs_proto::message::{KeyExchangeMode, RequestTracker};
use hs_proto::{
    types, AddressMap, Body, BootstrapHandles, HandleValue, Message, NamespaceInfo, OpFlags, Opcode, Protocol,
    RequestState, ResponseCode, ServerInfo, SiteInfo, MAX_NAMESPACE_DEPTH,
};
use hs_store::trust::verify_values;
use hs_store::{CacheConfig, CachedEntry, MemCache, TrustPolicy, TrustReport, TrustedKeys};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::auth::{answer_challenge, AuthenticationInfo};
use crate::config::ResolverConfig;
use crate::race::{race, BoxFuture, Lane};
use crate::selection::{PreferredPrimaries, ResponseTimes};
use crate::session::{
    open, seal, ClientSession, ClientSessionTracker, ClientSetup, SessionIdentity, SessionOptions,
};
use crate::transport::TransportSet;

/// One server interface a request may be sent to.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// `addr:port`, the key for statistics and sessions.
    pub key: String,
    /// Where to send.
    pub addr: SocketAddr,
    /// How to send.
    pub protocol: Protocol,
    /// The server.
    pub server: ServerInfo,
}

/// Resolves handles and sends requests to the servers responsible.
pub struct HandleResolver {
    config: ResolverConfig,
    bootstrap: RwLock<BootstrapHandles>,
    cache: MemCache,
    sessions: ClientSessionTracker,
    response_times: ResponseTimes,
    preferred: PreferredPrimaries,
    transports: TransportSet,
    local_sites: RwLock<HashMap<Handle, Vec<SiteInfo>>>,
    local_addresses: RwLock<AddressMap>,
    next_request_id: AtomicU32,
}

impl HandleResolver {
    /// Creates a resolver using UDP, TCP and HTTP.
    pub fn new(config: ResolverConfig, bootstrap: BootstrapHandles) -> Arc<Self> {
        let transports = TransportSet::standard(&config);
        Self::with_transports(config, bootstrap, transports)
    }

    /// Creates a resolver with explicit transports.
    pub fn with_transports(
        config: ResolverConfig,
        bootstrap: BootstrapHandles,
        transports: TransportSet,
    ) -> Arc<Self> {
        let cache = MemCache::new(CacheConfig {
            max_entries: config.cache_max_entries,
            ..Default::default()
        });
        Arc::new(Self {
            config,
            bootstrap: RwLock::new(bootstrap),
            cache,
            sessions: ClientSessionTracker::new(),
            response_times: ResponseTimes::new(),
            preferred: PreferredPrimaries::new(),
            transports,
            local_sites: RwLock::new(HashMap::new()),
            local_addresses: RwLock::new(AddressMap::new()),
            next_request_id: AtomicU32::new(rand::random::<u32>() >> 1),
        })
    }

    /// Configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Value cache.
    pub fn cache(&self) -> &MemCache {
        &self.cache
    }

    /// Client sessions.
    pub fn sessions(&self) -> &ClientSessionTracker {
        &self.sessions
    }

    /// Response-time statistics.
    pub fn response_times(&self) -> &ResponseTimes {
        &self.response_times
    }

    /// Preferred primaries.
    pub fn preferred_primaries(&self) -> &PreferredPrimaries {
        &self.preferred
    }

    /// Current bootstrap records.
    pub fn bootstrap(&self) -> BootstrapHandles {
        self.bootstrap.read().clone()
    }

    /// Replaces the bootstrap records.
    pub fn set_bootstrap(&self, bootstrap: BootstrapHandles) {
        *self.bootstrap.write() = bootstrap;
    }

    /// Serves every handle under the naming authority `na` from `sites`,
    /// skipping namespace resolution. An empty list removes the override.
    pub fn set_local_sites(&self, na: Handle, sites: Vec<SiteInfo>) {
        let mut local = self.local_sites.write();
        if sites.is_empty() {
            local.remove(&na);
        } else {
            local.insert(na, sites);
        }
    }

    /// Replaces the advertised-to-local address translations.
    pub fn set_local_addresses(&self, map: AddressMap) {
        *self.local_addresses.write() = map;
    }

    /// True if the bootstrap records are older than allowed.
    pub fn root_is_stale(&self) -> bool {
        self.bootstrap
            .read()
            .is_stale(epoch_secs() as u64, self.config.bootstrap_max_age_secs)
    }

    fn request_id(&self) -> u32 {
        match self.next_request_id.fetch_add(1, Ordering::Relaxed) {
            0 => self.next_request_id.fetch_add(1, Ordering::Relaxed),
            id => id,
        }
    }

    /// Resolves `handle`, optionally restricted to types and indexes.
    ///
    /// Unfiltered anonymous answers are cached, including "not found".
    pub async fn resolve_handle(
        self: &Arc<Self>,
        handle: &Handle,
        types: &[&[u8]],
        indexes: &[u32],
        auth: Option<&AuthenticationInfo>,
    ) -> HandleResult<Vec<HandleValue>> {
        self.resolve_at(handle, types, indexes, auth, 0).await
    }

    /// Resolves `handle` and checks its values against trusted signatures.
    pub async fn resolve_trusted(
        self: &Arc<Self>,
        handle: &Handle,
        trusted: &TrustedKeys,
        policy: &TrustPolicy,
    ) -> HandleResult<(Vec<HandleValue>, TrustReport)> {
        let values = self.resolve_handle(handle, &[], &[], None).await?;
        let report = verify_values(handle, &values, trusted, policy)?;
        Ok((values, report))
    }

    async fn resolve_at(
        self: &Arc<Self>,
        handle: &Handle,
        types: &[&[u8]],
        indexes: &[u32],
        auth: Option<&AuthenticationInfo>,
        depth: usize,
    ) -> HandleResult<Vec<HandleValue>> {
        let cacheable = auth.is_none();
        if cacheable {
            match self.cache.get_cached_values(handle) {
                Some(CachedEntry::Values(values)) => {
                    trace!(handle = %handle, "cache hit");
                    return Ok(filter_values(values, types, indexes));
                }
                Some(CachedEntry::NotFound) => {
                    trace!(handle = %handle, "cached not found");
                    return Err(not_found(handle));
                }
                None => {}
            }
        }

        let unfiltered = types.is_empty() && indexes.is_empty();
        let request = Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: handle.clone(),
                indexes: indexes.to_vec(),
                types: types.iter().map(|t| bytes::Bytes::copy_from_slice(t)).collect(),
            },
        );
        match self.process_at(request, auth, depth).await {
            Ok(response) => {
                let values = match response.body {
                    Body::Values { values, .. } => values,
                    other => {
                        return Err(HandleError::new(
                            ErrorKind::MessageFormatError,
                            format!("resolution answered with {other:?}"),
                        ))
                    }
                };
                if cacheable && unfiltered {
                    self.cache.set_cached_values(handle, values.clone());
                }
                Ok(filter_values(values, types, indexes))
            }
            Err(err) if err.kind() == ErrorKind::HandleDoesNotExist => {
                if cacheable {
                    self.cache.set_cached_not_found(handle);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Sends `request` to the service responsible for its handle and returns
    /// the successful response.
    pub async fn process_request(
        self: &Arc<Self>,
        request: Message,
        auth: Option<&AuthenticationInfo>,
    ) -> HandleResult<Message> {
        self.process_at(request, auth, 0).await
    }

    async fn process_at(
        self: &Arc<Self>,
        request: Message,
        auth: Option<&AuthenticationInfo>,
        depth: usize,
    ) -> HandleResult<Message> {
        let handle = request.body.handle().cloned().unwrap_or(ROOT_HANDLE);
        let sites = self.clone().service_sites_for(handle, depth).await?;
        self.send_to_sites(request, sites, auth).await?.into_result()
    }

    /// Sites of the service responsible for `handle`.
    pub async fn find_service_sites(self: &Arc<Self>, handle: &Handle) -> HandleResult<Vec<SiteInfo>> {
        self.clone().service_sites_for(handle.clone(), 0).await
    }

    fn service_sites_for(
        self: Arc<Self>,
        handle: Handle,
        depth: usize,
    ) -> BoxFuture<'static, HandleResult<Vec<SiteInfo>>> {
        Box::pin(async move {
            if depth > MAX_NAMESPACE_DEPTH {
                return Err(HandleError::depth_limit(MAX_NAMESPACE_DEPTH));
            }
            // Naming authority handles live on the root service.
            if handle.is_na_handle() {
                return self.bootstrap.read().root_sites();
            }
            let na = handle.na_handle();
            if let Some(sites) = self.local_sites.read().get(&na) {
                trace!(%na, "using local sites");
                return Ok(sites.clone());
            }
            if self.bootstrap.read().values(&na).is_some() {
                return self.bootstrap.read().resolve_service(&na);
            }
            let namespace = self.clone().namespace_info(na.clone(), depth).await?;
            self.namespace_sites(&namespace, depth).await
        })
    }

    /// Builds the namespace chain of a naming authority. A derived prefix
    /// without its own service values inherits from its parent prefix.
    fn namespace_info(
        self: Arc<Self>,
        na: Handle,
        depth: usize,
    ) -> BoxFuture<'static, HandleResult<Arc<NamespaceInfo>>> {
        Box::pin(async move {
            if depth > MAX_NAMESPACE_DEPTH {
                return Err(HandleError::depth_limit(MAX_NAMESPACE_DEPTH));
            }
            let values = match self.resolve_at(&na, &[], &[], None, depth + 1).await {
                Ok(values) => values,
                Err(err) if err.kind() == ErrorKind::HandleDoesNotExist => Vec::new(),
                Err(err) => return Err(err),
            };
            let has_service = values
                .iter()
                .any(|v| v.has_type(types::HS_SITE) || v.has_type(types::HS_SERV));
            match parent_prefix(&na) {
                Some(parent) if !has_service => {
                    let parent = self.clone().namespace_info(parent, depth + 1).await?;
                    Ok(Arc::new(NamespaceInfo::nested(na, values, parent)?))
                }
                _ => Ok(Arc::new(NamespaceInfo::root(na, values))),
            }
        })
    }

    async fn namespace_sites(
        self: &Arc<Self>,
        namespace: &NamespaceInfo,
        depth: usize,
    ) -> HandleResult<Vec<SiteInfo>> {
        let mut current = Some(namespace);
        while let Some(ns) = current {
            let sites = sites_of(ns.values())?;
            if !sites.is_empty() {
                return Ok(sites);
            }
            let servs: Vec<Handle> = ns
                .values()
                .iter()
                .filter(|v| v.has_type(types::HS_SERV))
                .map(|v| Handle::new(v.data.clone()))
                .collect();
            if !servs.is_empty() {
                let mut out = Vec::new();
                for serv in servs {
                    out.extend(self.clone().service_handle_sites(serv, depth + 1).await?);
                }
                return Ok(out);
            }
            current = ns.parent().map(|p| p.as_ref());
        }
        // Nothing delegated: the prefix is served by the root service.
        self.bootstrap.read().root_sites()
    }

    /// Sites described by a service handle, following `HS_SERV` chains.
    fn service_handle_sites(
        self: Arc<Self>,
        service: Handle,
        depth: usize,
    ) -> BoxFuture<'static, HandleResult<Vec<SiteInfo>>> {
        Box::pin(async move {
            if depth > MAX_NAMESPACE_DEPTH {
                return Err(HandleError::depth_limit(MAX_NAMESPACE_DEPTH));
            }
            if self.bootstrap.read().values(&service).is_some() {
                return self.bootstrap.read().resolve_service(&service);
            }
            let values = self.resolve_at(&service, &[], &[], None, depth + 1).await?;
            self.sites_from_values(&service, &values, depth).await
        })
    }

    async fn sites_from_values(
        self: &Arc<Self>,
        service: &Handle,
        values: &[HandleValue],
        depth: usize,
    ) -> HandleResult<Vec<SiteInfo>> {
        let sites = sites_of(values)?;
        if !sites.is_empty() {
            return Ok(sites);
        }
        let mut out = Vec::new();
        for serv in values.iter().filter(|v| v.has_type(types::HS_SERV)) {
            out.extend(
                self.clone()
                    .service_handle_sites(Handle::new(serv.data.clone()), depth + 1)
                    .await?,
            );
        }
        if out.is_empty() {
            return Err(HandleError::new(
                ErrorKind::ServiceNotFound,
                format!("{service} names no sites"),
            ));
        }
        Ok(out)
    }

    /// Orders the interfaces a request may use: by protocol preference,
    /// then fastest site first.
    pub fn candidates(&self, request: &Message, sites: &[SiteInfo]) -> HandleResult<Vec<Candidate>> {
        let admin = request.opcode.is_admin() || request.flags.has(OpFlags::AUTHORITATIVE);
        let handle = request.body.handle().cloned().unwrap_or(ROOT_HANDLE);
        let eligible: Vec<&SiteInfo> = sites
            .iter()
            .filter(|site| !admin || site.is_primary)
            .filter(|site| !self.filtered_by_keyword(site))
            .collect();

        let mut out = Vec::new();
        for protocol in &self.config.preferred_protocols {
            if !self.transports.supports(*protocol) {
                continue;
            }
            let mut group = Vec::new();
            for site in &eligible {
                if !site.has_usable_interface(*protocol, admin) {
                    continue;
                }
                let Some(server) = site.determine_server(&handle) else {
                    continue;
                };
                let Some(interface) = server.interface(*protocol, admin) else {
                    continue;
                };
                let addr = self
                    .local_addresses
                    .read()
                    .translate_socket(server.socket_addr(interface));
                if addr.is_ipv6() && !self.config.ipv6_fast_fallback {
                    continue;
                }
                group.push((
                    server.key(interface),
                    Candidate {
                        key: server.key(interface),
                        addr,
                        protocol: *protocol,
                        server: server.clone(),
                    },
                ));
            }
            out.extend(self.response_times.order(group).into_iter().map(|(_, c)| c));
        }
        if out.is_empty() {
            return Err(HandleError::new(
                ErrorKind::NoAcceptableInterfaces,
                format!("no usable interface for {} on {} sites", request.opcode, sites.len()),
            ));
        }
        Ok(out)
    }

    fn filtered_by_keyword(&self, site: &SiteInfo) -> bool {
        if self.config.site_keyword_filter.is_empty() {
            return false;
        }
        let Some(description) = site.description() else {
            return false;
        };
        let description = description.to_ascii_lowercase();
        self.config
            .site_keyword_filter
            .iter()
            .any(|word| description.contains(&word.to_ascii_lowercase()))
    }

    /// Races `request` across `sites`, following referrals. Returns the raw
    /// response, whatever its code.
    pub async fn send_to_sites(
        self: &Arc<Self>,
        request: Message,
        sites: Vec<SiteInfo>,
        auth: Option<&AuthenticationInfo>,
    ) -> HandleResult<Message> {
        let mut sites = sites;
        for hop in 0..=self.config.max_referrals {
            let response = self.race_sites(&request, &sites, auth).await?;
            if !response.response_code.is_referral() || request.flags.has(OpFlags::DO_NOT_REFER) {
                return Ok(response);
            }
            let Body::Referral { handle, values } = &response.body else {
                return Ok(response);
            };
            debug!(hop, referral = %handle, code = %response.response_code, "following referral");
            sites = self.sites_from_values(handle, values, 0).await?;
        }
        Err(HandleError::new(
            ErrorKind::ServiceReferralError,
            format!("more than {} referrals", self.config.max_referrals),
        ))
    }

    async fn race_sites(
        self: &Arc<Self>,
        request: &Message,
        sites: &[SiteInfo],
        auth: Option<&AuthenticationInfo>,
    ) -> HandleResult<Message> {
        let candidates = self.candidates(request, sites)?;
        let keys: Vec<String> = candidates.iter().map(|c| c.key.clone()).collect();
        let (preferred, general): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| self.preferred.is_preferred(&c.key));

        let general_delay = if preferred.is_empty() {
            Duration::ZERO
        } else {
            self.config.happy_eyeballs_delay()
        };
        let lanes = vec![
            self.lane("preferred-primary", Duration::ZERO, preferred, request, auth),
            self.lane("sites", general_delay, general, request, auth),
        ]
        .into_iter()
        .filter(|lane| !lane.is_empty())
        .collect();

        let winner = race(lanes).await?;
        let (response, candidate, elapsed) = winner.value;
        self.response_times.record(&candidate.key, elapsed);
        let untried: Vec<String> = keys.into_iter().filter(|k| *k != candidate.key).collect();
        self.response_times.after_success(elapsed, &untried);
        if request.opcode.is_admin() && !response.response_code.is_referral() {
            self.preferred.mark(&candidate.key);
        }
        debug!(
            lane = %winner.lane,
            server = %candidate.key,
            protocol = %candidate.protocol.name(),
            elapsed_ms = elapsed.as_millis() as u64,
            code = %response.response_code,
            "request answered"
        );
        Ok(response)
    }

    fn lane(
        self: &Arc<Self>,
        name: &str,
        delay: Duration,
        candidates: Vec<Candidate>,
        request: &Message,
        auth: Option<&AuthenticationInfo>,
    ) -> Lane<(Message, Candidate, Duration)> {
        let mut lane = Lane::new(name).delayed(delay);
        for candidate in candidates {
            let resolver = self.clone();
            let request = request.clone();
            let auth = auth.cloned();
            lane = lane.attempt(move |_cancel| async move {
                let started = Instant::now();
                let response = resolver
                    .send_to_server(&candidate, request, auth.as_ref())
                    .await?;
                Ok((response, candidate, started.elapsed()))
            });
        }
        lane
    }

    /// Sends `request` to one server, answering challenges and checking
    /// certified responses. Returns the response, whatever its code.
    pub async fn send_to_server(
        self: &Arc<Self>,
        candidate: &Candidate,
        mut request: Message,
        auth: Option<&AuthenticationInfo>,
    ) -> HandleResult<Message> {
        request.request_id = self.request_id();
        let wants_session = self.config.use_sessions
            || request.should_encrypt()
            || request.flags.has(OpFlags::ENCRYPT);

        let mut retried = false;
        loop {
            let session = if wants_session {
                Some(self.session_for(candidate, auth).await?)
            } else {
                None
            };
            let response = self
                .exchange(candidate, &request, auth, session.as_deref())
                .await?;

            if let Some(session) = &session {
                let rejected = matches!(
                    response.response_code,
                    ResponseCode::SessionTimeout | ResponseCode::SessionFailed
                );
                if rejected {
                    self.sessions.remove(&candidate.key, session.identity());
                    if !retried {
                        debug!(server = %candidate.key, "session rejected, setting up a new one");
                        retried = true;
                        continue;
                    }
                }
            }

            if request.flags.has(OpFlags::CERTIFY) && !response.response_code.is_referral() {
                let key = candidate.server.public_key()?;
                verify_certified(&response, &key)?;
            }
            if request.flags.has(OpFlags::RETURN_REQUEST_DIGEST) && !response.matches_request(&request) {
                return Err(HandleError::security_alert(
                    "response digest does not match the request",
                ));
            }
            return Ok(response);
        }
    }

    /// One request/response exchange, answering challenges as they come.
    async fn exchange(
        &self,
        candidate: &Candidate,
        request: &Message,
        auth: Option<&AuthenticationInfo>,
        session: Option<&ClientSession>,
    ) -> HandleResult<Message> {
        let transport = self.transports.get(candidate.protocol)?;
        let mut tracker = RequestTracker::new();
        let mut outgoing = request.clone();
        tracker.advance(RequestState::Sent)?;
        loop {
            let frame = match session {
                Some(session) => session.prepare(&mut outgoing)?,
                None => seal(&outgoing, None, false)?,
            };
            if self.config.trace_messages {
                debug!(server = %candidate.key, opcode = %outgoing.opcode, request_id = outgoing.request_id, "sending");
            }
            let reply = transport.exchange(candidate.addr, frame).await.map_err(|err| {
                tracker.advance(RequestState::Failed).ok();
                HandleError::from(err)
            })?;
            let response = match session {
                Some(session) => session.open(reply)?,
                None => open(reply, None)?,
            };
            if self.config.trace_messages {
                debug!(server = %candidate.key, code = %response.response_code, request_id = response.request_id, "received");
            }
            if response.request_id != request.request_id {
                return Err(HandleError::new(
                    ErrorKind::MessageFormatError,
                    format!(
                        "response id {} for request {}",
                        response.request_id, request.request_id
                    ),
                ));
            }
            if response.response_code != ResponseCode::AuthenticationNeeded {
                tracker.advance(RequestState::Completed)?;
                return Ok(response);
            }

            let Some(auth) = auth else {
                tracker.advance(RequestState::Failed)?;
                return Err(HandleError::new(
                    ErrorKind::UnableToAuthenticate,
                    format!("{} requires authentication", candidate.key),
                ));
            };
            tracker.challenge(auth.identity())?;
            debug!(server = %candidate.key, identity = %auth.identity(), "answering challenge");
            outgoing = answer_challenge(auth, request, &response)?;
            tracker.advance(RequestState::Answered)?;
        }
    }

    async fn session_for(
        &self,
        candidate: &Candidate,
        auth: Option<&AuthenticationInfo>,
    ) -> HandleResult<Arc<ClientSession>> {
        let identity = SessionIdentity::of(auth.map(|a| a.identity()));
        if let Some(session) = self.sessions.get(&candidate.key, &identity) {
            return Ok(session);
        }

        let options = SessionOptions {
            cipher: self.config.session_cipher,
            timeout_secs: self.config.session_timeout_secs,
            ..Default::default()
        };
        let dh = (options.mode == KeyExchangeMode::DiffieHellman)
            .then(|| self.sessions.dh_key_pair());
        let (setup, body) =
            ClientSetup::start_with(&options, auth.map(|a| a.identity().clone()), dh)?;
        let mut request = Message::request(Opcode::SessionSetup, Body::SessionSetup(body));
        request.request_id = self.request_id();
        let response = self
            .exchange(candidate, &request, auth, None)
            .await?
            .into_result()?;
        let Body::SessionSetupResponse { mode, data } = &response.body else {
            return Err(HandleError::new(
                ErrorKind::IncompleteSessionSetup,
                "unexpected session setup response",
            ));
        };
        let server_key = candidate.server.public_key().ok();
        let (key, wrapped) = setup.complete(*mode, data, server_key.as_ref())?;

        if let Some(encrypted_key) = wrapped {
            let mut exchange = Message::request(Opcode::SessionExchangeKey, Body::ExchangeKey { encrypted_key });
            exchange.request_id = self.request_id();
            exchange.session_id = response.session_id;
            self.exchange(candidate, &exchange, None, None)
                .await?
                .into_result()?;
        }

        let session = Arc::new(ClientSession::new(
            response.session_id,
            key,
            identity,
            Duration::from_secs(options.timeout_secs as u64),
            options.encrypt_all,
            options.authenticate_all,
        ));
        info!(server = %candidate.key, session_id = response.session_id, "session established");
        self.sessions.put(&candidate.key, session.clone());
        Ok(session)
    }

    /// Re-reads the root service handle from the root sites and stores it
    /// as the new bootstrap record.
    pub async fn refresh_root_info(self: &Arc<Self>) -> HandleResult<()> {
        let sites = self.bootstrap.read().root_sites()?;
        let request = Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: ROOT_HANDLE,
                indexes: Vec::new(),
                types: Vec::new(),
            },
        )
        .with_flag(OpFlags::CERTIFY);
        let response = self.send_to_sites(request, sites, None).await?.into_result()?;
        let Body::Values { values, .. } = response.body else {
            return Err(HandleError::new(
                ErrorKind::MessageFormatError,
                "root resolution returned no values",
            ));
        };
        if sites_of(&values)?.is_empty() {
            warn!("root record without sites, keeping the old one");
            return Err(HandleError::new(
                ErrorKind::ServiceNotFound,
                "root record lists no sites",
            ));
        }
        let mut bootstrap = self.bootstrap.write();
        bootstrap.set_values(&ROOT_HANDLE, values);
        bootstrap.last_update = epoch_secs() as u64;
        self.cache.remove_handle(&ROOT_HANDLE);
        info!("root info refreshed");
        Ok(())
    }
}

fn verify_certified(response: &Message, key: &PublicKey) -> HandleResult<()> {
    response.verify_signature(key).map_err(|err| {
        warn!(error = %err, "certified response failed verification");
        HandleError::security_alert(format!("certified response: {}", err.message))
    })
}

fn not_found(handle: &Handle) -> HandleError {
    HandleError::new(ErrorKind::HandleDoesNotExist, format!("{handle} not found"))
}

/// `0.NA/10.1000.5` -> `0.NA/10.1000`; `None` at the top of the tree.
fn parent_prefix(na: &Handle) -> Option<Handle> {
    let prefix = na.prefix();
    let start = if na.is_na_handle() {
        hs_core::handle::NA_HANDLE_PREFIX.len()
    } else {
        0
    };
    let dot = prefix[start..].iter().rposition(|&b| b == b'.')?;
    Some(Handle::new(bytes::Bytes::copy_from_slice(&prefix[..start + dot])))
}

fn filter_values(values: Vec<HandleValue>, types: &[&[u8]], indexes: &[u32]) -> Vec<HandleValue> {
    if types.is_empty() && indexes.is_empty() {
        return values;
    }
    values
        .into_iter()
        .filter(|v| indexes.contains(&v.index) || types.iter().any(|t| v.has_type(t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Frame, Transport, TransportError};
    use async_trait::async_trait;
    use hs_core::WireEncode;
    use hs_proto::{Interface, InterfaceType};
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn server(ip: IpAddr, protocols: &[Protocol]) -> ServerInfo {
        ServerInfo {
            server_id: 1,
            address: ip,
            public_key: bytes::Bytes::new(),
            interfaces: protocols
                .iter()
                .map(|p| Interface::new(InterfaceType::Both, *p, 2641))
                .collect(),
        }
    }

    fn site(ip: [u8; 4], primary: bool) -> SiteInfo {
        let mut site = SiteInfo::new(vec![server(IpAddr::V4(Ipv4Addr::from(ip)), &[Protocol::Tcp, Protocol::Udp])]);
        site.is_primary = primary;
        site
    }

    fn bootstrap_with(sites: &[SiteInfo]) -> BootstrapHandles {
        let mut bootstrap = BootstrapHandles::default();
        let values = sites
            .iter()
            .enumerate()
            .map(|(i, s)| HandleValue::new(i as u32 + 1, types::HS_SITE, s.to_bytes()))
            .collect();
        bootstrap.set_values(&ROOT_HANDLE, values);
        bootstrap.last_update = epoch_secs() as u64;
        bootstrap
    }

    /// Answers every request locally and counts what it saw.
    struct Canned {
        protocol: Protocol,
        seen: Mutex<Vec<(SocketAddr, Opcode)>>,
        answer: Box<dyn Fn(SocketAddr, &Message) -> Message + Send + Sync>,
    }

    #[async_trait]
    impl Transport for Canned {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        async fn exchange(&self, addr: SocketAddr, request: Frame) -> Result<Frame, TransportError> {
            let msg = open(request, None).map_err(|e| TransportError::Malformed(e.message))?;
            self.seen.lock().push((addr, msg.opcode));
            let reply = (self.answer)(addr, &msg);
            seal(&reply, None, false).map_err(|e| TransportError::Malformed(e.message))
        }
    }

    fn resolver_with(
        sites: &[SiteInfo],
        answer: impl Fn(SocketAddr, &Message) -> Message + Send + Sync + 'static,
    ) -> (Arc<HandleResolver>, Arc<Canned>) {
        let canned = Arc::new(Canned {
            protocol: Protocol::Tcp,
            seen: Mutex::new(Vec::new()),
            answer: Box::new(answer),
        });
        let resolver = HandleResolver::with_transports(
            ResolverConfig::default(),
            bootstrap_with(sites),
            TransportSet::new().with(canned.clone()),
        );
        (resolver, canned)
    }

    fn url_values(_addr: SocketAddr, req: &Message) -> Message {
        let handle = req.body.handle().cloned().unwrap_or_default();
        Message::response_to(
            req,
            ResponseCode::Success,
            Body::Values {
                handle,
                values: vec![
                    HandleValue::new(1, "URL", "https://example.org"),
                    HandleValue::new(2, "EMAIL", "info@example.org"),
                ],
            },
        )
    }

    #[tokio::test]
    async fn test_resolve_and_cache() {
        let (resolver, canned) = resolver_with(&[site([10, 0, 0, 1], true)], url_values);
        let handle = Handle::from("0.NA/10.1000");
        let values = resolver.resolve_handle(&handle, &[], &[], None).await.unwrap();
        assert_eq!(values.len(), 2);

        let urls = resolver
            .resolve_handle(&handle, &[b"URL".as_slice()], &[], None)
            .await
            .unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(canned.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_cached() {
        let (resolver, canned) = resolver_with(&[site([10, 0, 0, 1], true)], |_, req| {
            Message::response_to(req, ResponseCode::HandleNotFound, Body::error("no such handle"))
        });
        let handle = Handle::from("0.NA/10.9999");
        for _ in 0..2 {
            let err = resolver
                .resolve_handle(&handle, &[], &[], None)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::HandleDoesNotExist);
        }
        assert_eq!(canned.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_prefix_inherits_root_service() {
        // 0.NA/10.1000 has no service values: its handles go to the root.
        let (resolver, _) = resolver_with(&[site([10, 0, 0, 1], true)], |_, req| {
            let handle = req.body.handle().cloned().unwrap_or_default();
            Message::response_to(
                req,
                ResponseCode::Success,
                Body::Values {
                    handle,
                    values: vec![HandleValue::new(100, types::HS_ADMIN, vec![0u8; 10])],
                },
            )
        });
        let sites = resolver
            .find_service_sites(&Handle::from("10.1000/abc"))
            .await
            .unwrap();
        assert_eq!(sites.len(), 1);
    }

    #[tokio::test]
    async fn test_referral_followed() {
        let target = site([10, 0, 0, 2], true);
        let target_bytes = target.to_bytes();
        let (resolver, canned) = resolver_with(&[site([10, 0, 0, 1], true)], move |addr, req| {
            if addr.ip() == IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)) {
                return url_values(addr, req);
            }
            Message::response_to(
                req,
                ResponseCode::ServiceReferral,
                Body::Referral {
                    handle: Handle::from("0.NA/20.500"),
                    values: vec![HandleValue::new(1, types::HS_SITE, target_bytes.clone())],
                },
            )
        });
        let sites = resolver.bootstrap().root_sites().unwrap();
        let request = Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: Handle::from("20.500/x"),
                indexes: vec![],
                types: vec![],
            },
        );
        let response = resolver.send_to_sites(request, sites, None).await.unwrap();
        assert_eq!(response.response_code, ResponseCode::Success);
        let seen = canned.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[tokio::test]
    async fn test_authentication_needed_without_credentials() {
        let (resolver, _) = resolver_with(&[site([10, 0, 0, 1], true)], |_, req| {
            crate::auth::Challenge::issue(req).to_response(req)
        });
        let err = resolver
            .resolve_handle(&Handle::from("0.NA/10.1"), &[], &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnableToAuthenticate);
    }

    #[test]
    fn test_candidates_admin_primary_only() {
        let (resolver, _) = resolver_with(&[], url_values);
        let sites = vec![site([10, 0, 0, 1], false), site([10, 0, 0, 2], true)];
        let admin = Message::request(
            Opcode::AddValue,
            Body::Values {
                handle: Handle::from("10.1/1"),
                values: vec![],
            },
        );
        let candidates = resolver.candidates(&admin, &sites).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let query = Message::request(Opcode::Resolution, Body::Handle { handle: Handle::from("10.1/1") });
        assert_eq!(resolver.candidates(&query, &sites).unwrap().len(), 2);

        let err = resolver.candidates(&admin, &sites[..1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoAcceptableInterfaces);
    }

    #[test]
    fn test_candidates_keyword_and_ipv6_filters() {
        let mut config = ResolverConfig {
            site_keyword_filter: vec!["Mirror".into()],
            ipv6_fast_fallback: false,
            ..Default::default()
        };
        config.preferred_protocols = vec![Protocol::Tcp];
        let resolver = HandleResolver::with_transports(
            config,
            BootstrapHandles::default(),
            TransportSet::standard(&ResolverConfig::default()),
        );
        let mut mirror = site([10, 0, 0, 1], false);
        mirror.attributes.push((bytes::Bytes::from_static(b"desc"), bytes::Bytes::from_static(b"EU mirror")));
        let v6 = SiteInfo::new(vec![server(IpAddr::V6(Ipv6Addr::LOCALHOST), &[Protocol::Tcp])]);
        let plain = site([10, 0, 0, 3], false);
        let query = Message::request(Opcode::Resolution, Body::Handle { handle: Handle::from("10.1/1") });
        let candidates = resolver.candidates(&query, &[mirror, v6, plain]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[tokio::test]
    async fn test_local_sites_and_addresses() {
        let (resolver, canned) = resolver_with(&[site([10, 0, 0, 1], true)], url_values);
        let local = site([203, 0, 113, 9], true);
        resolver.set_local_sites(Handle::from("0.NA/10.1000"), vec![local.clone()]);
        let mut map = AddressMap::new();
        map.insert(
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)),
        );
        resolver.set_local_addresses(map);

        let sites = resolver
            .find_service_sites(&Handle::from("10.1000/abc"))
            .await
            .unwrap();
        assert_eq!(sites, vec![local]);
        assert!(canned.seen.lock().is_empty());

        let values = resolver
            .resolve_handle(&Handle::from("10.1000/abc"), &[], &[], None)
            .await
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(canned.seen.lock()[0].0.ip(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)));

        // Without the override the prefix goes through the root again.
        resolver.set_local_sites(Handle::from("0.NA/10.1000"), Vec::new());
        let sites = resolver
            .find_service_sites(&Handle::from("10.1000/other"))
            .await
            .unwrap();
        assert_eq!(sites[0].servers[0].address, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(canned.seen.lock().len() > 1);
    }

    #[test]
    fn test_parent_prefix() {
        assert_eq!(
            parent_prefix(&Handle::from("0.NA/10.1000.5")),
            Some(Handle::from("0.NA/10.1000"))
        );
        assert_eq!(parent_prefix(&Handle::from("0.NA/10")), None);
    }
}
