//! The Handle server.
//!
//! [`HandleServer`] listens on TCP and UDP. For every request it:
//!
//! 1. opens the frame, decrypting with the session key when it is encrypted
//! 2. checks the session MAC and counter
//! 3. answers session and challenge traffic itself
//! 4. challenges requests that need an authenticated identity
//! 5. hands the rest to a [`RequestProcessor`], or for dump and transaction
//!    requests over TCP to a [`StreamingHandler`]; recursive resolutions of
//!    handles not held here go to a [`HandleResolver`] when recursion is on
//! 6. signs the response when the request asked for a certified answer
//!
//! Failures at any step become error responses carrying the matching
//! response code; only frames that cannot be decoded at all are dropped.

mod processor;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use hs_core::crypto::{PrivateKey, PublicKey};
use bytes::Bytes;
use hs_core::{ErrorKind, Handle, HandleError, HandleResult, WireDecode};
use hs_proto::message::{CredentialKind, Envelope, MessageHeader};
use hs_proto::{
    types, Body, Message, OpFlags, Opcode, Protocol, ResponseCode, SiteInfo, ValueReference,
};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use processor::{RequestProcessor, StorageRequestProcessor};

use crate::auth::{verify_secret_key_answer, Challenge};
use crate::config::ServerConfig;
use crate::resolver::HandleResolver;
use crate::session::{open_payload, seal, ServerSessionManager, SessionKey, SessionSnapshot};
use crate::transport::tcp::{read_frame, write_frame};
use crate::transport::udp::{
    split_packets, PartialMessages, MAX_PARTIAL_MESSAGES, PARTIAL_MESSAGE_TIMEOUT,
};
use crate::transport::{Frame, TransportError};

/// Who sent a request and what they proved.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Peer address.
    pub peer: SocketAddr,
    /// Transport the request arrived on.
    pub protocol: Protocol,
    /// Session id, 0 outside a session.
    pub session_id: u32,
    /// Authenticated identity, through a challenge or an authenticated
    /// session.
    pub identity: Option<ValueReference>,
}

impl RequestContext {
    /// An unauthenticated request outside a session.
    pub fn anonymous(peer: SocketAddr, protocol: Protocol) -> Self {
        Self {
            peer,
            protocol,
            session_id: 0,
            identity: None,
        }
    }

    /// True once an identity is proven.
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

/// Writes a streamed response: messages first, then raw bytes.
pub struct ResponseStream<'a> {
    writer: &'a mut (dyn AsyncWrite + Unpin + Send),
    key: Option<SessionKey>,
    encrypted: bool,
    started: bool,
}

impl<'a> ResponseStream<'a> {
    fn new(writer: &'a mut (dyn AsyncWrite + Unpin + Send), key: Option<SessionKey>, encrypted: bool) -> Self {
        Self {
            writer,
            key,
            encrypted,
            started: false,
        }
    }

    /// Sends one response message.
    pub async fn send(&mut self, message: &Message) -> HandleResult<()> {
        let frame = seal(message, self.key.as_ref(), self.encrypted)?;
        write_frame(&mut *self.writer, &frame).await?;
        self.started = true;
        Ok(())
    }

    /// Writes raw stream bytes after the response message.
    pub async fn write_raw(&mut self, data: &[u8]) -> HandleResult<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(TransportError::from)?;
        self.started = true;
        Ok(())
    }

    /// Flushes buffered bytes.
    pub async fn flush(&mut self) -> HandleResult<()> {
        self.writer.flush().await.map_err(TransportError::from)?;
        Ok(())
    }

    /// True once anything was written.
    pub fn has_started(&self) -> bool {
        self.started
    }
}

impl AsyncWrite for ResponseStream<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.started = true;
        Pin::new(&mut *this.writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Answers dump and transaction requests with a stream.
#[async_trait]
pub trait StreamingHandler: Send + Sync {
    /// Streams the answer to an authenticated `request`.
    async fn stream(
        &self,
        ctx: &RequestContext,
        request: &Message,
        out: &mut ResponseStream<'_>,
    ) -> HandleResult<()>;
}

struct PendingChallenge {
    challenge: Challenge,
    request: Message,
}

/// Challenges waiting for an answer, keyed by peer address and request id.
pub struct ChallengeTable {
    pending: Mutex<HashMap<(IpAddr, u32), PendingChallenge>>,
    ttl: Duration,
}

impl ChallengeTable {
    /// Challenges expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Issues a challenge for `request` and returns the response carrying it.
    pub fn issue(&self, peer: IpAddr, request: &Message) -> Message {
        let challenge = Challenge::issue(request);
        let response = challenge.to_response(request);
        let mut pending = self.pending.lock();
        pending.retain(|_, p| !p.challenge.is_expired(self.ttl));
        pending.insert(
            (peer, request.request_id),
            PendingChallenge {
                challenge,
                request: request.clone(),
            },
        );
        response
    }

    /// Removes and returns the live challenge for an answer.
    pub fn take(&self, peer: IpAddr, request_id: u32) -> Option<(Challenge, Message)> {
        let pending = self.pending.lock().remove(&(peer, request_id))?;
        if pending.challenge.is_expired(self.ttl) {
            return None;
        }
        Some((pending.challenge, pending.request))
    }

    /// Challenges waiting.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// What the dispatcher decided.
enum Outcome {
    Reply(Message),
    Stream(RequestContext, Message),
}

/// The protocol server.
pub struct HandleServer {
    config: ServerConfig,
    processor: Arc<dyn RequestProcessor>,
    streaming: Option<Arc<dyn StreamingHandler>>,
    sessions: ServerSessionManager,
    challenges: ChallengeTable,
    signing: Option<(PrivateKey, ValueReference)>,
    site_info: Option<SiteInfo>,
    resolver: Option<Arc<HandleResolver>>,
}

impl HandleServer {
    /// Creates a server answering with `processor`.
    pub fn new(config: ServerConfig, processor: Arc<dyn RequestProcessor>) -> Self {
        let sessions = ServerSessionManager::new(config.max_sessions, config.session_timeout());
        let challenges = ChallengeTable::new(config.challenge_timeout());
        Self {
            config,
            processor,
            streaming: None,
            sessions,
            challenges,
            signing: None,
            site_info: None,
            resolver: None,
        }
    }

    /// Answers dump and transaction requests with `handler`.
    pub fn with_streaming(mut self, handler: Arc<dyn StreamingHandler>) -> Self {
        self.streaming = Some(handler);
        self
    }

    /// Signs certified responses and unwraps session keys with `key`,
    /// published at `identity`.
    pub fn with_signing_key(mut self, key: PrivateKey, identity: ValueReference) -> Self {
        self.signing = Some((key, identity));
        self
    }

    /// Answers site-info requests with `site`.
    pub fn with_site_info(mut self, site: SiteInfo) -> Self {
        self.site_info = Some(site);
        self
    }

    /// Resolves recursive requests for handles held elsewhere with
    /// `resolver`. Only used when `allow_recursion` is set.
    pub fn with_resolver(mut self, resolver: Arc<HandleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Session table.
    pub fn sessions(&self) -> &ServerSessionManager {
        &self.sessions
    }

    /// Pending challenges.
    pub fn challenges(&self) -> &ChallengeTable {
        &self.challenges
    }

    /// Handles one frame that is not part of a stream. Returns the reply
    /// frame, or `None` if the frame was undecodable.
    pub async fn handle_frame(&self, peer: SocketAddr, protocol: Protocol, frame: Frame) -> Option<Frame> {
        match self.handle(peer, protocol, frame).await? {
            Handled::Reply { response, key, encrypted } => self.seal_reply(&response, key.as_ref(), encrypted),
            Handled::Stream { request, key, encrypted, .. } => {
                let err = HandleError::new(
                    ErrorKind::MessageFormatError,
                    format!("{} needs a TCP stream", request.opcode),
                );
                self.seal_reply(&Message::error_response(&request, &err), key.as_ref(), encrypted)
            }
        }
    }

    fn seal_reply(&self, response: &Message, key: Option<&SessionKey>, encrypted: bool) -> Option<Frame> {
        match seal(response, key, encrypted) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, "could not seal response");
                None
            }
        }
    }

    async fn handle(&self, peer: SocketAddr, protocol: Protocol, frame: Frame) -> Option<Handled> {
        let session_id = frame.envelope.session_id;
        let encrypted = frame.envelope.is_encrypted();
        let session = (session_id != 0).then(|| self.sessions.get(session_id));
        let key = session
            .as_ref()
            .and_then(|s| s.as_ref().ok())
            .and_then(|s| s.key.clone());

        if encrypted && key.is_none() {
            // Undecryptable: answer in the clear so the client sets up anew.
            debug!(%peer, session_id, "encrypted request for an unknown session");
            let mut stub = Message::request(Opcode::Reserved, Body::Empty);
            stub.session_id = session_id;
            stub.request_id = frame.envelope.request_id;
            let response = Message::response_to(
                &stub,
                ResponseCode::SessionFailed,
                Body::error("unknown or expired session"),
            );
            return Some(Handled::Reply {
                response,
                key: None,
                encrypted: false,
            });
        }

        let envelope = frame.envelope;
        let payload = match open_payload(frame, key.as_ref()) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%peer, error = %err, "dropping unreadable request");
                return None;
            }
        };
        let request = match Message::decode_message(&envelope, payload.clone()) {
            Ok(request) => request,
            Err(err) => return malformed_body(peer, &envelope, payload, &err.to_string()),
        };
        trace!(%peer, opcode = %request.opcode, request_id = request.request_id, "request received");

        let session = match session {
            Some(Ok(snapshot)) => Some(snapshot),
            Some(Err(err)) => {
                let err = HandleError::from(err);
                return Some(Handled::Reply {
                    response: Message::error_response(&request, &err),
                    key: None,
                    encrypted: false,
                });
            }
            None => None,
        };
        let reply_encrypted = key.is_some()
            && (encrypted || session.as_ref().is_some_and(|s| s.encrypt_all));

        let outcome = match self.dispatch(peer, protocol, session.as_ref(), encrypted, &request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(%peer, opcode = %request.opcode, error = %err, "request failed");
                Outcome::Reply(Message::error_response(&request, &err))
            }
        };
        Some(match outcome {
            Outcome::Reply(response) => Handled::Reply {
                response: self.certify(response),
                key,
                encrypted: reply_encrypted,
            },
            Outcome::Stream(ctx, request) => Handled::Stream {
                ctx,
                request,
                key,
                encrypted: reply_encrypted,
            },
        })
    }

    fn certify(&self, mut response: Message) -> Message {
        if !response.flags.has(OpFlags::CERTIFY) {
            return response;
        }
        let Some((key, identity)) = &self.signing else {
            return response;
        };
        if let Err(err) = response.sign(key, identity.clone()) {
            warn!(error = %err, "could not sign response");
            let err = HandleError::new(ErrorKind::UnableToSignRequest, err.to_string());
            return Message::error_response(&response, &err);
        }
        response
    }

    async fn dispatch(
        &self,
        peer: SocketAddr,
        protocol: Protocol,
        session: Option<&SessionSnapshot>,
        sealed: bool,
        request: &Message,
    ) -> HandleResult<Outcome> {
        if !request.is_request() {
            return Err(HandleError::new(ErrorKind::MessageFormatError, "not a request"));
        }
        if request.is_expired() {
            return Err(HandleError::new(ErrorKind::GotExpiredMessage, "request expired"));
        }

        let mut ctx = RequestContext::anonymous(peer, protocol);
        let mut session_authenticated = false;
        if let Some(session) = session {
            ctx.session_id = session.id;
            session_authenticated = self.check_session_credential(session, sealed, request)?;
            if session_authenticated {
                ctx.identity = session.identity.clone();
            }
        }

        match request.opcode {
            Opcode::ChallengeResponse => self.answer(ctx, request).await,
            Opcode::VerifyChallenge => self.verify_challenge(request).await.map(Outcome::Reply),
            Opcode::SessionSetup => {
                let Body::SessionSetup(setup) = &request.body else {
                    return Err(malformed(request));
                };
                if setup.identity.is_some() && ctx.identity != setup.identity {
                    return Ok(Outcome::Reply(self.challenges.issue(peer.ip(), request)));
                }
                self.setup_session(&ctx, request).await.map(Outcome::Reply)
            }
            Opcode::SessionExchangeKey => self.exchange_key(request).map(Outcome::Reply),
            Opcode::SessionTerminate => {
                if !session_authenticated {
                    return Err(HandleError::new(
                        ErrorKind::UnableToAuthenticate,
                        "terminating a session needs the session key",
                    ));
                }
                self.sessions.terminate(request.session_id);
                Ok(Outcome::Reply(Message::response_to(request, ResponseCode::Success, Body::Empty)))
            }
            Opcode::GetSiteInfo => match &self.site_info {
                Some(site) => Ok(Outcome::Reply(Message::response_to(
                    request,
                    ResponseCode::Success,
                    Body::SiteInfo(site.clone()),
                ))),
                None => Ok(Outcome::Reply(Message::response_to(
                    request,
                    ResponseCode::OperationNotSupported,
                    Body::error("no site information configured"),
                ))),
            },
            _ => {
                if !ctx.is_authenticated() && self.processor.needs_authentication(request).await? {
                    debug!(%peer, opcode = %request.opcode, "issuing challenge");
                    return Ok(Outcome::Reply(self.challenges.issue(peer.ip(), request)));
                }
                self.run(ctx, request).await
            }
        }
    }

    /// Processes an authenticated (or public) request.
    async fn run(&self, ctx: RequestContext, request: &Message) -> HandleResult<Outcome> {
        if request.opcode.is_streaming() {
            return Ok(Outcome::Stream(ctx, request.clone()));
        }
        if request.opcode == Opcode::SessionSetup {
            return self.setup_session(&ctx, request).await.map(Outcome::Reply);
        }
        match self.processor.process(&ctx, request).await {
            Err(err) if err.kind() == ErrorKind::HandleDoesNotExist && self.may_recurse(request) => {
                self.recurse(request).await.map(Outcome::Reply)
            }
            other => other.map(Outcome::Reply),
        }
    }

    fn may_recurse(&self, request: &Message) -> bool {
        self.config.allow_recursion
            && self.resolver.is_some()
            && request.opcode == Opcode::Resolution
            && request.flags.has(OpFlags::RECURSIVE)
            && request.recursion_count > 0
    }

    /// Resolves a handle this server does not hold on the client's behalf.
    async fn recurse(&self, request: &Message) -> HandleResult<Message> {
        let Some(resolver) = &self.resolver else {
            return Err(malformed(request));
        };
        let (handle, indexes, types): (&Handle, &[u32], &[Bytes]) = match &request.body {
            Body::Handle { handle } => (handle, &[], &[]),
            Body::Resolution {
                handle,
                indexes,
                types,
            } => (handle, indexes, types),
            _ => return Err(malformed(request)),
        };
        debug!(handle = %handle, remaining = request.recursion_count, "resolving recursively");
        let type_filter: Vec<&[u8]> = types.iter().map(|t| t.as_ref()).collect();
        let values = resolver.resolve_handle(handle, &type_filter, indexes, None).await?;
        Ok(Message::response_to(
            request,
            ResponseCode::Success,
            Body::Values {
                handle: handle.clone(),
                values,
            },
        ))
    }

    /// True if the request proves possession of the session key, either by
    /// a valid MAC or by arriving encrypted under it.
    fn check_session_credential(
        &self,
        session: &SessionSnapshot,
        sealed: bool,
        request: &Message,
    ) -> HandleResult<bool> {
        let Some(key) = &session.key else {
            return Ok(false);
        };
        match request.credential.as_ref().map(|c| c.kind) {
            Some(CredentialKind::Mac { .. }) => {
                let counter = request.verify_mac(key.as_bytes())?;
                self.sessions.check_counter(session.id, counter)?;
                Ok(true)
            }
            _ if session.authenticate_all => Err(HandleError::new(
                ErrorKind::UnableToAuthenticate,
                "session requires authenticated requests",
            )),
            _ => Ok(sealed),
        }
    }

    async fn answer(&self, mut ctx: RequestContext, answer: &Message) -> HandleResult<Outcome> {
        let Body::ChallengeAnswer {
            auth_type,
            identity,
            response,
        } = &answer.body
        else {
            return Err(malformed(answer));
        };
        let Some((challenge, original)) = self.challenges.take(ctx.peer.ip(), answer.request_id) else {
            return Err(HandleError::new(
                ErrorKind::UnableToAuthenticate,
                "no pending challenge for this request",
            ));
        };
        let Some(stored) = self.processor.identity_value(identity).await? else {
            return Err(HandleError::new(
                ErrorKind::UnableToAuthenticate,
                format!("no key at {identity}"),
            ));
        };
        challenge.verify_answer(&original, auth_type, identity, response, &stored)?;
        info!(peer = %ctx.peer, %identity, opcode = %original.opcode, "challenge answered");
        ctx.identity = Some(identity.clone());
        self.run(ctx, &original).await
    }

    async fn verify_challenge(&self, request: &Message) -> HandleResult<Message> {
        let Body::VerifyChallenge {
            identity,
            nonce,
            request_digest,
            response,
        } = &request.body
        else {
            return Err(malformed(request));
        };
        let valid = match self.processor.identity_value(identity).await? {
            Some(stored) if stored.has_type(types::HS_SECKEY) => {
                verify_secret_key_answer(&stored.data, nonce, request_digest, response)
            }
            _ => false,
        };
        debug!(%identity, valid, "verified challenge answer for a peer");
        Ok(Message::response_to(
            request,
            ResponseCode::Success,
            Body::VerifyChallengeResponse { valid },
        ))
    }

    async fn setup_session(&self, ctx: &RequestContext, request: &Message) -> HandleResult<Message> {
        let Body::SessionSetup(setup) = &request.body else {
            return Err(malformed(request));
        };
        let peer_key = match &setup.key_ref {
            Some(key_ref) => match self.processor.identity_value(key_ref).await? {
                Some(value) if value.has_type(types::HS_PUBKEY) => Some(PublicKey::decode(&value.data)?),
                _ => None,
            },
            None => None,
        };
        let (id, data) = self
            .sessions
            .create(setup, ctx.identity.clone(), peer_key.as_ref())?;
        let mut response = Message::response_to(
            request,
            ResponseCode::Success,
            Body::SessionSetupResponse {
                mode: setup.mode,
                data,
            },
        );
        response.session_id = id;
        Ok(response)
    }

    fn exchange_key(&self, request: &Message) -> HandleResult<Message> {
        let Body::ExchangeKey { encrypted_key } = &request.body else {
            return Err(malformed(request));
        };
        let Some((key, _)) = &self.signing else {
            return Err(HandleError::new(
                ErrorKind::ServerCannotProcessSession,
                "server has no key to receive session keys",
            ));
        };
        self.sessions
            .exchange_key(request.session_id, encrypted_key, key)?;
        Ok(Message::response_to(request, ResponseCode::Success, Body::Empty))
    }

    /// Binds TCP and UDP on the configured address (UDP on the port TCP got)
    /// and serves until the returned handle is shut down.
    pub async fn start(self: Arc<Self>) -> HandleResult<ServerHandle> {
        let tcp = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| bind_error(self.config.listen_addr, e))?;
        let tcp_addr = tcp.local_addr().map_err(|e| bind_error(self.config.listen_addr, e))?;
        let udp = UdpSocket::bind(tcp_addr)
            .await
            .map_err(|e| bind_error(tcp_addr, e))?;
        let udp_addr = udp.local_addr().map_err(|e| bind_error(tcp_addr, e))?;
        info!(%tcp_addr, %udp_addr, server_id = self.config.server_id, "handle server listening");

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(self.clone().serve_tcp(tcp, cancel.clone())),
            tokio::spawn(self.serve_udp(Arc::new(udp), cancel.clone())),
        ];
        Ok(ServerHandle {
            tcp_addr,
            udp_addr,
            cancel,
            tasks,
        })
    }

    async fn serve_tcp(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = server.serve_connection(stream, peer) => {}
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        debug!("tcp listener stopped");
    }

    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    debug!(%peer, error = %e, "tcp read failed");
                    break;
                }
            };
            let Some(handled) = self.handle(peer, Protocol::Tcp, frame).await else {
                break;
            };
            match handled {
                Handled::Reply { response, key, encrypted } => {
                    let Some(frame) = self.seal_reply(&response, key.as_ref(), encrypted) else {
                        break;
                    };
                    if let Err(e) = write_frame(&mut stream, &frame).await {
                        debug!(%peer, error = %e, "tcp write failed");
                        break;
                    }
                }
                Handled::Stream { ctx, request, key, encrypted } => {
                    self.stream_response(&mut stream, ctx, request, key, encrypted).await;
                    break;
                }
            }
        }
        let _ = stream.shutdown().await;
    }

    async fn stream_response(
        &self,
        stream: &mut TcpStream,
        ctx: RequestContext,
        request: Message,
        key: Option<SessionKey>,
        encrypted: bool,
    ) {
        let mut out = ResponseStream::new(stream, key, encrypted);
        let result = match &self.streaming {
            Some(handler) => handler.stream(&ctx, &request, &mut out).await,
            None => Err(HandleError::new(
                ErrorKind::ReplicationError,
                format!("{} is not served here", request.opcode),
            )),
        };
        match result {
            Ok(()) => {
                let _ = out.flush().await;
                debug!(peer = %ctx.peer, opcode = %request.opcode, "stream finished");
            }
            Err(err) if !out.has_started() => {
                let _ = out.send(&Message::error_response(&request, &err)).await;
            }
            Err(err) => warn!(peer = %ctx.peer, error = %err, "stream aborted"),
        }
    }

    async fn serve_udp(self: Arc<Self>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
        let mut buf = vec![0u8; 65_536];
        let mut partial = PartialMessages::new(MAX_PARTIAL_MESSAGES, PARTIAL_MESSAGE_TIMEOUT);
        let mut sweep = tokio::time::interval(PARTIAL_MESSAGE_TIMEOUT);
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                now = sweep.tick() => {
                    let evicted = partial.evict_stale(now);
                    if evicted > 0 {
                        debug!(evicted, "dropped stale partial udp messages");
                    }
                    continue;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "udp receive failed");
                        continue;
                    }
                },
            };
            let frame = match partial.push(peer, &buf[..len], tokio::time::Instant::now()) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    debug!(%peer, error = %e, "bad udp packet");
                    continue;
                }
            };

            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let Some(reply) = server.handle_frame(peer, Protocol::Udp, frame).await else {
                    return;
                };
                for packet in split_packets(&reply) {
                    if let Err(e) = socket.send_to(&packet, peer).await {
                        debug!(%peer, error = %e, "udp send failed");
                        return;
                    }
                }
            });
        }
        debug!("udp listener stopped");
    }
}

enum Handled {
    Reply {
        response: Message,
        key: Option<SessionKey>,
        encrypted: bool,
    },
    Stream {
        ctx: RequestContext,
        request: Message,
        key: Option<SessionKey>,
        encrypted: bool,
    },
}

/// A running server.
pub struct ServerHandle {
    /// Bound TCP address.
    pub tcp_addr: SocketAddr,
    /// Bound UDP address.
    pub udp_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stops accepting and closes open connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for the listeners to stop.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn malformed(request: &Message) -> HandleError {
    HandleError::new(
        ErrorKind::MessageFormatError,
        format!("unexpected body for {}", request.opcode),
    )
}

/// Answers a request whose header decodes but whose body does not with a
/// format error. Anything that is not a readable request is dropped.
fn malformed_body(
    peer: SocketAddr,
    envelope: &Envelope,
    mut payload: Bytes,
    reason: &str,
) -> Option<Handled> {
    let header = match MessageHeader::decode(&mut payload) {
        Ok(header) if header.response_code == ResponseCode::Reserved => header,
        _ => {
            debug!(%peer, error = reason, "dropping undecodable message");
            return None;
        }
    };
    debug!(%peer, opcode = %header.opcode, error = reason, "malformed request body");
    let mut stub = Message::request(header.opcode, Body::Empty);
    stub.session_id = envelope.session_id;
    stub.request_id = envelope.request_id;
    let err = HandleError::new(ErrorKind::MessageFormatError, reason);
    Some(Handled::Reply {
        response: Message::error_response(&stub, &err),
        key: None,
        encrypted: false,
    })
}

fn bind_error(addr: SocketAddr, e: std::io::Error) -> HandleError {
    HandleError::new(ErrorKind::ConfigurationError, format!("cannot bind {addr}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{answer_challenge, AuthenticationInfo};
    use crate::session::{open, ClientSession, ClientSetup, SessionIdentity, SessionOptions};
    use hs_core::WireEncode;
    use hs_proto::message::KeyExchangeMode;
    use hs_proto::{AdminPermissions, AdminRecord, HandleValue};
    use hs_store::{HandleStorage, MemoryStorage, MemoryTransactionQueue, TransactionQueueSet};

    fn admin() -> ValueReference {
        ValueReference::new("0.NA/10.1", 300)
    }

    async fn server() -> HandleServer {
        let storage = Arc::new(MemoryStorage::new());
        let record = AdminRecord::new(admin(), AdminPermissions::ALL);
        storage
            .create_handle(
                &Handle::from("0.NA/10.1"),
                vec![
                    HandleValue::new(100, types::HS_ADMIN, record.to_bytes()),
                    HandleValue::new(300, types::HS_SECKEY, "pass").private(),
                ],
            )
            .await
            .unwrap();
        storage
            .create_handle(
                &Handle::from("10.1/x"),
                vec![
                    HandleValue::new(1, "URL", "https://x"),
                    HandleValue::new(100, types::HS_ADMIN, record.to_bytes()),
                ],
            )
            .await
            .unwrap();
        let queues = Arc::new(TransactionQueueSet::new(Arc::new(MemoryTransactionQueue::new(""))));
        let processor = Arc::new(StorageRequestProcessor::new(storage, queues, Vec::new()));
        HandleServer::new(ServerConfig::default(), processor)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    async fn roundtrip(server: &HandleServer, request: Message, id: u32) -> Message {
        roundtrip_from(server, peer(), request, id).await
    }

    async fn roundtrip_from(server: &HandleServer, from: SocketAddr, mut request: Message, id: u32) -> Message {
        request.request_id = id;
        let frame = seal(&request, None, false).unwrap();
        let reply = server.handle_frame(from, Protocol::Tcp, frame).await.unwrap();
        open(reply, None).unwrap()
    }

    /// Sets up a session for the admin identity through a challenge.
    async fn admin_session(server: &HandleServer, options: &SessionOptions, id: u32) -> (Message, ClientSetup) {
        let (setup, body) = ClientSetup::start(options, Some(admin())).unwrap();
        let mut request = Message::request(Opcode::SessionSetup, Body::SessionSetup(body));
        request.request_id = id;
        let challenge = roundtrip(server, request.clone(), id).await;
        assert_eq!(challenge.response_code, ResponseCode::AuthenticationNeeded);
        let auth = AuthenticationInfo::secret_key(admin(), b"pass".to_vec());
        let answer = answer_challenge(&auth, &request, &challenge).unwrap();
        let response = roundtrip(server, answer, id).await;
        assert_eq!(response.response_code, ResponseCode::Success);
        assert_ne!(response.session_id, 0);
        (response, setup)
    }

    #[tokio::test]
    async fn test_public_resolution() {
        let server = server().await;
        let request = Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: Handle::from("10.1/x"),
                indexes: vec![],
                types: vec![],
            },
        );
        let response = roundtrip(&server, request, 7).await;
        assert_eq!(response.response_code, ResponseCode::Success);
        assert_eq!(response.request_id, 7);
        assert_eq!(response.body.values().len(), 2);
    }

    #[tokio::test]
    async fn test_admin_request_challenged_then_answered() {
        let server = server().await;
        let mut request = Message::request(
            Opcode::AddValue,
            Body::Values {
                handle: Handle::from("10.1/x"),
                values: vec![HandleValue::new(2, "EMAIL", "x@example.org")],
            },
        )
        .with_flag(OpFlags::RETURN_REQUEST_DIGEST);
        request.request_id = 11;

        let challenge = roundtrip(&server, request.clone(), 11).await;
        assert_eq!(challenge.response_code, ResponseCode::AuthenticationNeeded);
        assert_eq!(server.challenges().len(), 1);

        let auth = AuthenticationInfo::secret_key(admin(), b"pass".to_vec());
        let answer = answer_challenge(&auth, &request, &challenge).unwrap();
        let response = roundtrip(&server, answer, 11).await;
        assert_eq!(response.response_code, ResponseCode::Success);
        assert!(response.matches_request(&request));
        assert!(server.challenges().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let server = server().await;
        let request = Message::request(Opcode::DeleteHandle, Body::Handle { handle: Handle::from("10.1/x") });
        let challenge = roundtrip(&server, request.clone(), 12).await;
        let mut request = request;
        request.request_id = 12;
        let auth = AuthenticationInfo::secret_key(admin(), b"wrong".to_vec());
        let answer = answer_challenge(&auth, &request, &challenge).unwrap();
        let response = roundtrip(&server, answer, 12).await;
        assert_eq!(response.response_code, ResponseCode::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_answer_without_challenge_rejected() {
        let server = server().await;
        let answer = Message::request(
            Opcode::ChallengeResponse,
            Body::ChallengeAnswer {
                auth_type: bytes::Bytes::from_static(types::HS_SECKEY),
                identity: admin(),
                response: bytes::Bytes::from_static(b"x"),
            },
        );
        let response = roundtrip(&server, answer, 13).await;
        assert_eq!(response.response_code, ResponseCode::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_session_counter_replay_rejected() {
        let server = server().await;
        let (setup, body) = ClientSetup::start(&SessionOptions::default(), None).unwrap();
        let response = roundtrip(&server, Message::request(Opcode::SessionSetup, Body::SessionSetup(body)), 20).await;
        let Body::SessionSetupResponse { mode, data } = &response.body else {
            panic!("unexpected {:?}", response.body);
        };
        let (key, _) = setup.complete(*mode, data, None).unwrap();
        let session = ClientSession::new(
            response.session_id,
            key,
            SessionIdentity::Anonymous,
            Duration::from_secs(60),
            false,
            true,
        );

        let mut request = Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: Handle::from("10.1/x"),
                indexes: vec![],
                types: vec![],
            },
        );
        request.request_id = 21;
        let frame = session.prepare(&mut request).unwrap();
        let replay = frame.clone();
        let reply = server.handle_frame(peer(), Protocol::Tcp, frame).await.unwrap();
        assert_eq!(session.open(reply).unwrap().response_code, ResponseCode::Success);

        let reply = server.handle_frame(peer(), Protocol::Tcp, replay).await.unwrap();
        assert_eq!(
            session.open(reply).unwrap().response_code,
            ResponseCode::SessionMessageRejected
        );
    }

    #[tokio::test]
    async fn test_session_id_alone_grants_no_identity() {
        let server = server().await;
        let stranger: SocketAddr = "10.9.9.9:4000".parse().unwrap();
        let keyless = SessionOptions {
            mode: KeyExchangeMode::None,
            ..Default::default()
        };
        let unmacked = SessionOptions {
            authenticate_all: false,
            ..Default::default()
        };
        for (i, options) in [keyless, unmacked].iter().enumerate() {
            let id = 50 + i as u32 * 10;
            let (response, _) = admin_session(&server, options, id).await;
            let session_id = response.session_id;
            let mut delete = Message::request(Opcode::DeleteHandle, Body::Handle { handle: Handle::from("10.1/x") });
            delete.session_id = session_id;
            let response = roundtrip_from(&server, stranger, delete, id + 1).await;
            assert_eq!(response.response_code, ResponseCode::AuthenticationNeeded);

            let mut terminate = Message::request(Opcode::SessionTerminate, Body::Empty);
            terminate.session_id = session_id;
            let response = roundtrip_from(&server, stranger, terminate, id + 2).await;
            assert_eq!(response.response_code, ResponseCode::AuthenticationFailed);
            assert!(server.sessions.get(session_id).is_ok());
        }
    }

    #[tokio::test]
    async fn test_session_mac_carries_identity() {
        let server = server().await;
        let options = SessionOptions::default();
        let (response, setup) = admin_session(&server, &options, 70).await;
        let Body::SessionSetupResponse { mode, data } = &response.body else {
            panic!("unexpected {:?}", response.body);
        };
        let (key, _) = setup.complete(*mode, data, None).unwrap();
        let session = ClientSession::new(
            response.session_id,
            key,
            SessionIdentity::of(Some(&admin())),
            Duration::from_secs(60),
            false,
            true,
        );

        let mut delete = Message::request(Opcode::DeleteHandle, Body::Handle { handle: Handle::from("10.1/x") });
        delete.request_id = 71;
        let frame = session.prepare(&mut delete).unwrap();
        let reply = server.handle_frame(peer(), Protocol::Tcp, frame).await.unwrap();
        assert_eq!(session.open(reply).unwrap().response_code, ResponseCode::Success);

        let mut terminate = Message::request(Opcode::SessionTerminate, Body::Empty);
        terminate.request_id = 72;
        let frame = session.prepare(&mut terminate).unwrap();
        let reply = server.handle_frame(peer(), Protocol::Tcp, frame).await.unwrap();
        assert_eq!(session.open(reply).unwrap().response_code, ResponseCode::Success);
        assert!(server.sessions.get(response.session_id).is_err());
    }

    #[tokio::test]
    async fn test_encrypted_request_for_unknown_session() {
        let server = server().await;
        let key = SessionKey::generate(hs_core::crypto::CipherAlgorithm::Aes);
        let mut request = Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: Handle::from("10.1/x"),
                indexes: vec![],
                types: vec![],
            },
        );
        request.session_id = 99;
        request.request_id = 30;
        let frame = seal(&request, Some(&key), true).unwrap();
        let reply = server.handle_frame(peer(), Protocol::Tcp, frame).await.unwrap();
        let response = open(reply, None).unwrap();
        assert_eq!(response.response_code, ResponseCode::SessionFailed);
        assert_eq!(response.request_id, 30);
    }

    #[tokio::test]
    async fn test_malformed_body_answered_with_format_error() {
        let server = server().await;
        // A create without its value list.
        let request = Message::request(Opcode::CreateHandle, Body::Handle { handle: Handle::from("10.1/new") });
        let response = roundtrip(&server, request, 80).await;
        assert_eq!(response.response_code, ResponseCode::ProtocolError);
        assert_eq!(response.opcode, Opcode::CreateHandle);
        assert_eq!(response.request_id, 80);

        let mut garbage = Message::request(Opcode::Resolution, Body::Empty);
        garbage.request_id = 81;
        let mut frame = seal(&garbage, None, false).unwrap();
        frame.payload = frame.payload.slice(..10);
        assert!(server.handle_frame(peer(), Protocol::Tcp, frame).await.is_none());
    }

    #[tokio::test]
    async fn test_site_info_unconfigured() {
        let server = server().await;
        let request = Message::request(Opcode::GetSiteInfo, Body::Empty);
        let response = roundtrip(&server, request, 40).await;
        assert_eq!(response.response_code, ResponseCode::OperationNotSupported);
    }
}
