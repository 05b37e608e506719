//! Handle System networking.
//!
//! - UDP, TCP and HTTP transports carrying framed messages
//! - sessions with symmetric keys, MACs and replay protection
//! - challenge/response authentication with secret and public keys
//! - a resolver that races sites Happy-Eyeballs style
//! - the server: request dispatch, challenges and streaming

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod auth;
pub mod config;
pub mod race;
pub mod resolver;
pub mod root_update;
pub mod selection;
pub mod server;
pub mod session;
pub mod transport;

pub use auth::{answer_challenge, AuthenticationInfo, Challenge};
pub use config::{ResolverConfig, ServerConfig};
pub use race::{race, Lane, Winner};
pub use resolver::HandleResolver;
pub use root_update::{RootInfoUpdater, RootSource, UpdateOutcome};
pub use server::{
    HandleServer, RequestContext, RequestProcessor, ResponseStream, ServerHandle,
    StorageRequestProcessor, StreamingHandler,
};
pub use session::{
    ClientSession, ClientSessionTracker, ServerSessionManager, SessionError, SessionIdentity,
    SessionKey, SessionOptions,
};
pub use transport::{Frame, Transport, TransportError, TransportSet};
