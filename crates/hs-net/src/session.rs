//! Sessions: key agreement, per-message protection and replay defense.
//!
//! A session binds a server-assigned id to an optional symmetric key and an
//! optional authenticated identity. Inside a session a client may MAC every
//! request (with a strictly increasing counter the server checks against a
//! [`ReplayWindow`]) and encrypt message bytes under the session key.
//!
//! Key agreement modes:
//! - Diffie-Hellman (default): both sides contribute a public value.
//! - Client cipher: the server encrypts a fresh key with the client's key.
//! - Handle reference: as client cipher, with the client key looked up by
//!   the server from a `HS_PUBKEY` value.
//! - Server cipher: the client encrypts a fresh key with the server's key and
//!   delivers it in a follow-up exchange-key request.
//! - None: no key. Requests in such a session stay anonymous.
//!
//! A session's identity only applies to requests that carry a valid session
//! MAC or arrive encrypted under the session key. Session ids are random.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hs_core::crypto::{
    decrypt, encrypt, CipherAlgorithm, CryptoError, DhKeyPair, DhParams, PrivateKey, PublicKey,
};
use hs_core::{ErrorKind, Handle, HandleError, HandleResult, WireDecode, WireEncode};
use hs_proto::message::{DhExchange, KeyExchangeMode, SessionSetupRequest};
use hs_proto::{Message, OpFlags, ProtocolVersion, ValueReference};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::transport::Frame;

/// Counters remembered per session.
pub const REPLAY_WINDOW_SIZE: usize = 200;

/// Session errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session with this id
    #[error("unknown session {0}")]
    UnknownSession(u32),

    /// Session timed out
    #[error("session {0} expired")]
    Expired(u32),

    /// Counter already seen, or too old to tell
    #[error("duplicate session counter {0}")]
    DuplicateCounter(u32),

    /// Encryption needed but no session key
    #[error("no session key")]
    MissingKey,

    /// Key agreement failed
    #[error("session setup failed: {0}")]
    Setup(String),

    /// Session table full
    #[error("too many sessions")]
    TooManySessions,

    /// Crypto failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<SessionError> for HandleError {
    fn from(err: SessionError) -> Self {
        let kind = match &err {
            SessionError::UnknownSession(_)
            | SessionError::Expired(_)
            | SessionError::TooManySessions => ErrorKind::ServerCannotProcessSession,
            SessionError::DuplicateCounter(_) => ErrorKind::DuplicateSessionCounter,
            SessionError::MissingKey => ErrorKind::EncryptionError,
            SessionError::Setup(_) => ErrorKind::IncompleteSessionSetup,
            SessionError::Crypto(e) => return HandleError::from(e.clone()),
        };
        HandleError::new(kind, err.to_string())
    }
}

/// A symmetric session key.
#[derive(Clone)]
pub struct SessionKey {
    cipher: CipherAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl SessionKey {
    /// Wraps key bytes, checking the length for the cipher.
    pub fn new(cipher: CipherAlgorithm, key: Vec<u8>) -> Result<Self, SessionError> {
        if key.len() != cipher.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: cipher.key_len(),
                actual: key.len(),
            }
            .into());
        }
        Ok(Self {
            cipher,
            key: Zeroizing::new(key),
        })
    }

    /// A random key.
    pub fn generate(cipher: CipherAlgorithm) -> Self {
        let mut key = vec![0u8; cipher.key_len()];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            cipher,
            key: Zeroizing::new(key),
        }
    }

    /// Cipher the key is for.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// Raw key bytes, also the MAC key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Encrypts message bytes as a peer at `version` expects them.
    pub fn encrypt(&self, version: ProtocolVersion, plaintext: &[u8]) -> Result<Bytes, SessionError> {
        Ok(Bytes::from(encrypt(
            self.cipher,
            &self.key,
            plaintext,
            version.uses_cipher_iv(),
        )?))
    }

    /// Decrypts message bytes sent at `version`.
    pub fn decrypt(&self, version: ProtocolVersion, ciphertext: &[u8]) -> Result<Bytes, SessionError> {
        Ok(Bytes::from(decrypt(
            self.cipher,
            &self.key,
            ciphertext,
            version.uses_cipher_iv(),
        )?))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({:?}, <redacted>)", self.cipher)
    }
}

/// Encodes a message into a frame, encrypting the bytes when asked.
pub fn seal(message: &Message, key: Option<&SessionKey>, encrypted: bool) -> HandleResult<Frame> {
    let bytes = message.encode_message();
    let mut envelope = message.envelope(bytes.len());
    let payload = if encrypted {
        let key = key.ok_or(SessionError::MissingKey)?;
        envelope.set_encrypted(true);
        key.encrypt(message.version, &bytes)?
    } else {
        bytes
    };
    Ok(Frame::new(envelope, payload))
}

/// Decodes a frame, decrypting it first when the envelope says so.
pub fn open(frame: Frame, key: Option<&SessionKey>) -> HandleResult<Message> {
    let envelope = frame.envelope;
    let payload = open_payload(frame, key)?;
    Ok(Message::decode_message(&envelope, payload)?)
}

/// Decrypts a frame's payload without decoding the message.
pub fn open_payload(frame: Frame, key: Option<&SessionKey>) -> HandleResult<Bytes> {
    if frame.envelope.is_compressed() {
        return Err(HandleError::new(
            ErrorKind::MessageFormatError,
            "compressed messages are not supported",
        ));
    }
    if frame.envelope.is_encrypted() {
        Ok(key
            .ok_or(SessionError::MissingKey)?
            .decrypt(frame.envelope.version, &frame.payload)?)
    } else {
        Ok(frame.payload)
    }
}

/// Remembers the last [`REPLAY_WINDOW_SIZE`] counters of a session.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    seen: BTreeSet<u32>,
}

impl ReplayWindow {
    /// An empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a counter once. Counters older than everything in a full
    /// window are rejected since they can no longer be checked.
    pub fn check(&mut self, counter: u32) -> Result<(), SessionError> {
        if self.seen.contains(&counter) {
            return Err(SessionError::DuplicateCounter(counter));
        }
        if self.seen.len() >= REPLAY_WINDOW_SIZE
            && self.seen.first().is_some_and(|oldest| counter < *oldest)
        {
            return Err(SessionError::DuplicateCounter(counter));
        }
        self.seen.insert(counter);
        while self.seen.len() > REPLAY_WINDOW_SIZE {
            self.seen.pop_first();
        }
        Ok(())
    }

    /// Counters currently remembered.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True if nothing was seen yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Who a client session belongs to.
///
/// Anonymous sessions are a distinct key, so "no session yet" and "an
/// anonymous session" never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionIdentity {
    /// No authenticated identity.
    Anonymous,
    /// Authenticated as this identity.
    Identity(ValueReference),
}

impl SessionIdentity {
    /// Identity of an optional reference.
    pub fn of(identity: Option<&ValueReference>) -> Self {
        match identity {
            Some(r) => Self::Identity(r.clone()),
            None => Self::Anonymous,
        }
    }

    /// Signer reference put into session MACs.
    pub fn signer(&self) -> ValueReference {
        match self {
            Self::Identity(r) => r.clone(),
            Self::Anonymous => ValueReference::new(Handle::default(), 0),
        }
    }
}

/// Options for setting up a client session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Key agreement.
    pub mode: KeyExchangeMode,
    /// Session cipher.
    pub cipher: CipherAlgorithm,
    /// Requested lifetime, seconds.
    pub timeout_secs: u32,
    /// Encrypt every message.
    pub encrypt_all: bool,
    /// MAC every request.
    pub authenticate_all: bool,
    /// Where the server finds the client key, for handle-reference mode.
    pub key_ref: Option<ValueReference>,
    /// Client key for client-cipher and handle-reference modes.
    pub own_key: Option<PrivateKey>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: KeyExchangeMode::DiffieHellman,
            cipher: CipherAlgorithm::Aes,
            timeout_secs: 86_400,
            encrypt_all: false,
            authenticate_all: true,
            key_ref: None,
            own_key: None,
        }
    }
}

/// Client side of a session setup in progress.
pub struct ClientSetup {
    mode: KeyExchangeMode,
    cipher: CipherAlgorithm,
    dh: Option<Arc<DhKeyPair>>,
    own_key: Option<PrivateKey>,
}

impl ClientSetup {
    /// Starts a setup with a fresh key pair, returning the request body to
    /// send.
    pub fn start(
        options: &SessionOptions,
        identity: Option<ValueReference>,
    ) -> Result<(Self, SessionSetupRequest), SessionError> {
        Self::start_with(options, identity, None)
    }

    /// As [`start`](Self::start), agreeing with `dh` in Diffie-Hellman mode.
    pub fn start_with(
        options: &SessionOptions,
        identity: Option<ValueReference>,
        dh_pair: Option<Arc<DhKeyPair>>,
    ) -> Result<(Self, SessionSetupRequest), SessionError> {
        let mut dh = None;
        let exchange_data = match options.mode {
            KeyExchangeMode::DiffieHellman => {
                let pair = dh_pair.unwrap_or_else(|| Arc::new(DhKeyPair::generate(DhParams::default())));
                let data = DhExchange {
                    p: Bytes::from(pair.params().p_bytes()),
                    g: Bytes::from(pair.params().g_bytes()),
                    public: Bytes::from(pair.public_bytes()),
                }
                .to_bytes();
                dh = Some(pair);
                data
            }
            KeyExchangeMode::ClientCipher => options
                .own_key
                .as_ref()
                .ok_or_else(|| SessionError::Setup("client cipher mode needs a client key".into()))?
                .public_key()
                .encode(),
            KeyExchangeMode::HandleRef => {
                if options.key_ref.is_none() || options.own_key.is_none() {
                    return Err(SessionError::Setup(
                        "handle reference mode needs a key reference and a client key".into(),
                    ));
                }
                Bytes::new()
            }
            KeyExchangeMode::ServerCipher | KeyExchangeMode::None => Bytes::new(),
        };
        let request = SessionSetupRequest {
            mode: options.mode,
            key_ref: options.key_ref.clone(),
            exchange_data,
            timeout_secs: options.timeout_secs,
            cipher: options.cipher,
            identity,
            encrypt_all: options.encrypt_all,
            authenticate_all: options.authenticate_all,
        };
        Ok((
            Self {
                mode: options.mode,
                cipher: options.cipher,
                dh,
                own_key: options.own_key.clone(),
            },
            request,
        ))
    }

    /// Finishes key agreement from the server's answer.
    ///
    /// Returns the session key and, in server-cipher mode, the encrypted key
    /// to deliver with an exchange-key request.
    pub fn complete(
        self,
        mode: KeyExchangeMode,
        data: &[u8],
        server_key: Option<&PublicKey>,
    ) -> Result<(Option<SessionKey>, Option<Bytes>), SessionError> {
        if mode != self.mode {
            return Err(SessionError::Setup(format!(
                "server answered {mode:?} to a {:?} setup",
                self.mode
            )));
        }
        match mode {
            KeyExchangeMode::DiffieHellman => {
                let pair = self
                    .dh
                    .ok_or_else(|| SessionError::Setup("no local DH key".into()))?;
                let answer = DhExchange::from_bytes(data)
                    .map_err(|e| SessionError::Setup(e.to_string()))?;
                let key = pair.session_key(&answer.public, self.cipher.key_len())?;
                Ok((Some(SessionKey::new(self.cipher, key.to_vec())?), None))
            }
            KeyExchangeMode::ClientCipher | KeyExchangeMode::HandleRef => {
                let own = self
                    .own_key
                    .ok_or_else(|| SessionError::Setup("no client key".into()))?;
                let key = own.decrypt_key(data)?;
                Ok((Some(SessionKey::new(self.cipher, key)?), None))
            }
            KeyExchangeMode::ServerCipher => {
                let server_key = server_key
                    .ok_or_else(|| SessionError::Setup("server public key unknown".into()))?;
                let key = SessionKey::generate(self.cipher);
                let wrapped = server_key.encrypt_key(key.as_bytes())?;
                Ok((Some(key), Some(Bytes::from(wrapped))))
            }
            KeyExchangeMode::None => Ok((None, None)),
        }
    }
}

/// An established client session.
pub struct ClientSession {
    session_id: u32,
    key: Option<SessionKey>,
    identity: SessionIdentity,
    timeout: Duration,
    last_touch: Mutex<Instant>,
    counter: AtomicU32,
    encrypt_all: bool,
    authenticate_all: bool,
}

impl ClientSession {
    /// Creates a session as agreed with the server.
    pub fn new(
        session_id: u32,
        key: Option<SessionKey>,
        identity: SessionIdentity,
        timeout: Duration,
        encrypt_all: bool,
        authenticate_all: bool,
    ) -> Self {
        Self {
            session_id,
            key,
            identity,
            timeout,
            last_touch: Mutex::new(Instant::now()),
            counter: AtomicU32::new(0),
            encrypt_all,
            authenticate_all,
        }
    }

    /// Server-assigned id.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Session key.
    pub fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Owner.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Next counter; strictly increasing, starting at 1.
    pub fn next_counter(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Marks the session used now.
    pub fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    /// True if idle longer than the timeout at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.last_touch.lock()) > self.timeout
    }

    /// Tags, MACs and seals a request for this session.
    pub fn prepare(&self, message: &mut Message) -> HandleResult<Frame> {
        message.session_id = self.session_id;
        if let (true, Some(key)) = (self.authenticate_all, &self.key) {
            message.mac(key.as_bytes(), self.identity.signer(), self.next_counter());
        }
        let encrypted = self.key.is_some()
            && (self.encrypt_all
                || message.flags.has(OpFlags::ENCRYPT)
                || message.should_encrypt());
        self.touch();
        seal(message, self.key.as_ref(), encrypted)
    }

    /// Opens a response frame.
    pub fn open(&self, frame: Frame) -> HandleResult<Message> {
        open(frame, self.key.as_ref())
    }
}

struct TrackedSession {
    server: String,
    identity: SessionIdentity,
    session: Arc<ClientSession>,
}

/// Client sessions keyed by server and identity.
#[derive(Default)]
pub struct ClientSessionTracker {
    entries: Mutex<Vec<TrackedSession>>,
    dh: Mutex<Option<Arc<DhKeyPair>>>,
}

impl ClientSessionTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// The Diffie-Hellman key pair shared by every setup, generated the
    /// first time one is needed.
    pub fn dh_key_pair(&self) -> Arc<DhKeyPair> {
        self.dh
            .lock()
            .get_or_insert_with(|| Arc::new(DhKeyPair::generate(DhParams::default())))
            .clone()
    }

    /// Live session for `server` and `identity`.
    pub fn get(&self, server: &str, identity: &SessionIdentity) -> Option<Arc<ClientSession>> {
        self.get_at(server, identity, Instant::now())
    }

    /// As [`get`](Self::get), evicting sessions expired at `now`.
    pub fn get_at(
        &self,
        server: &str,
        identity: &SessionIdentity,
        now: Instant,
    ) -> Option<Arc<ClientSession>> {
        let mut entries = self.entries.lock();
        entries.retain(|e| {
            let live = !e.session.is_expired_at(now);
            if !live {
                debug!(server = %e.server, session_id = e.session.session_id, "evicting expired session");
            }
            live
        });
        entries
            .iter()
            .find(|e| e.server == server && &e.identity == identity)
            .map(|e| e.session.clone())
    }

    /// Stores a session, replacing any for the same server and identity.
    pub fn put(&self, server: &str, session: Arc<ClientSession>) {
        let identity = session.identity().clone();
        let mut entries = self.entries.lock();
        entries.retain(|e| !(e.server == server && e.identity == identity));
        entries.push(TrackedSession {
            server: server.to_string(),
            identity,
            session,
        });
    }

    /// Forgets a session.
    pub fn remove(&self, server: &str, identity: &SessionIdentity) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !(e.server == server && &e.identity == identity));
        entries.len() != before
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if none are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

struct ServerSession {
    key: Option<SessionKey>,
    cipher: CipherAlgorithm,
    identity: Option<ValueReference>,
    timeout: Duration,
    last_touch: Instant,
    replay: ReplayWindow,
    encrypt_all: bool,
    authenticate_all: bool,
}

/// What request handling needs to know about a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: u32,
    /// Session key, once agreed.
    pub key: Option<SessionKey>,
    /// Identity authenticated at setup.
    pub identity: Option<ValueReference>,
    /// Encrypt every message.
    pub encrypt_all: bool,
    /// Every request must carry a MAC.
    pub authenticate_all: bool,
}

/// Server-side session table.
pub struct ServerSessionManager {
    sessions: Mutex<HashMap<u32, ServerSession>>,
    max_sessions: usize,
    max_timeout: Duration,
}

impl ServerSessionManager {
    /// Creates a table holding at most `max_sessions`.
    pub fn new(max_sessions: usize, max_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            max_timeout,
        }
    }

    /// Creates a session for a setup request.
    ///
    /// `identity` is the identity the client proved, if any. `peer_key` is
    /// the client key looked up for handle-reference mode. Returns the new
    /// id and the data for the setup response.
    pub fn create(
        &self,
        request: &SessionSetupRequest,
        identity: Option<ValueReference>,
        peer_key: Option<&PublicKey>,
    ) -> Result<(u32, Bytes), SessionError> {
        let cipher = request.cipher;
        let (key, data) = match request.mode {
            KeyExchangeMode::DiffieHellman => {
                let offer = DhExchange::from_bytes(&request.exchange_data)
                    .map_err(|e| SessionError::Setup(e.to_string()))?;
                let pair = DhKeyPair::generate(DhParams::from_bytes(&offer.p, &offer.g)?);
                let key = pair.session_key(&offer.public, cipher.key_len())?;
                let data = DhExchange {
                    p: offer.p,
                    g: offer.g,
                    public: Bytes::from(pair.public_bytes()),
                }
                .to_bytes();
                (Some(SessionKey::new(cipher, key.to_vec())?), data)
            }
            KeyExchangeMode::ClientCipher | KeyExchangeMode::HandleRef => {
                let client_key = match request.mode {
                    KeyExchangeMode::ClientCipher => PublicKey::decode(&request.exchange_data)?,
                    _ => peer_key
                        .cloned()
                        .ok_or_else(|| SessionError::Setup("referenced key not found".into()))?,
                };
                let key = SessionKey::generate(cipher);
                let wrapped = client_key.encrypt_key(key.as_bytes())?;
                (Some(key), Bytes::from(wrapped))
            }
            KeyExchangeMode::ServerCipher | KeyExchangeMode::None => (None, Bytes::new()),
        };

        let timeout = match request.timeout_secs {
            0 => self.max_timeout,
            secs => Duration::from_secs(secs as u64).min(self.max_timeout),
        };

        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_sessions {
            let now = Instant::now();
            sessions.retain(|_, s| now.saturating_duration_since(s.last_touch) <= s.timeout);
        }
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::TooManySessions);
        }
        let mut rng = rand::thread_rng();
        let mut id = rng.gen::<u32>();
        while id == 0 || sessions.contains_key(&id) {
            id = rng.gen::<u32>();
        }
        sessions.insert(
            id,
            ServerSession {
                key,
                cipher,
                identity: identity.clone(),
                timeout,
                last_touch: Instant::now(),
                replay: ReplayWindow::new(),
                encrypt_all: request.encrypt_all,
                authenticate_all: request.authenticate_all,
            },
        );
        info!(session_id = id, mode = ?request.mode, identity = ?identity, "session established");
        Ok((id, data))
    }

    /// Installs the key a client sent in server-cipher mode.
    pub fn exchange_key(
        &self,
        id: u32,
        encrypted_key: &[u8],
        server_key: &PrivateKey,
    ) -> Result<(), SessionError> {
        let raw = server_key.decrypt_key(encrypted_key)?;
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::UnknownSession(id))?;
        session.key = Some(SessionKey::new(session.cipher, raw)?);
        session.last_touch = Instant::now();
        debug!(session_id = id, "session key installed");
        Ok(())
    }

    /// Looks up a live session, touching it.
    pub fn get(&self, id: u32) -> Result<SessionSnapshot, SessionError> {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        let session = sessions.get_mut(&id).ok_or(SessionError::UnknownSession(id))?;
        if now.saturating_duration_since(session.last_touch) > session.timeout {
            sessions.remove(&id);
            debug!(session_id = id, "session expired");
            return Err(SessionError::Expired(id));
        }
        session.last_touch = now;
        Ok(SessionSnapshot {
            id,
            key: session.key.clone(),
            identity: session.identity.clone(),
            encrypt_all: session.encrypt_all,
            authenticate_all: session.authenticate_all,
        })
    }

    /// Records a request counter, rejecting replays.
    pub fn check_counter(&self, id: u32, counter: u32) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::UnknownSession(id))?;
        session.replay.check(counter)
    }

    /// Ends a session.
    pub fn terminate(&self, id: u32) -> bool {
        let removed = self.sessions.lock().remove(&id).is_some();
        if removed {
            debug!(session_id = id, "session terminated");
        }
        removed
    }

    /// Live and expired-but-unswept sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// True if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
