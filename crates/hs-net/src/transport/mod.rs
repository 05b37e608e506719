//! Transport trait and shared framing.
//!
//! A [`Frame`] is an envelope plus the (possibly encrypted) message bytes.
//! Transports move one request frame to a server and return the response
//! frame; they know nothing about sessions or message bodies.

pub mod http;
pub mod tcp;
pub mod tls_policy;
pub mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hs_core::{ErrorKind, HandleError};
use hs_proto::{Envelope, Protocol};
use thiserror::Error;

pub use http::HttpTransport;
pub use tcp::{read_frame, write_frame, TcpTransport};
pub use tls_policy::TlsPolicy;
pub use udp::{split_packets, PartialMessages, UdpReassembler, UdpTransport};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No response in time
    #[error("Connection timeout")]
    Timeout,

    /// Peer closed the connection
    #[error("Connection closed")]
    Closed,

    /// The attempt was cancelled by a faster sibling
    #[error("Cancelled")]
    Cancelled,

    /// Frame or HTTP framing was malformed
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// No transport for the protocol
    #[error("Unsupported protocol: {0}")]
    Unsupported(Protocol),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for HandleError {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::Malformed(_) => ErrorKind::MessageFormatError,
            TransportError::Unsupported(_) => ErrorKind::UnknownProtocol,
            TransportError::Cancelled => ErrorKind::InternalError,
            _ => ErrorKind::CannotConnectToServer,
        };
        HandleError::new(kind, err.to_string())
    }
}

/// An envelope and the message bytes it announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Envelope; `message_length` matches `payload`.
    pub envelope: Envelope,
    /// Message bytes, encrypted when the envelope says so.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame, fixing up the envelope length.
    pub fn new(mut envelope: Envelope, payload: Bytes) -> Self {
        envelope.message_length = payload.len() as u32;
        Self { envelope, payload }
    }
}

/// Moves request frames to servers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Protocol spoken.
    fn protocol(&self) -> Protocol;

    /// Sends `request` to `addr` and waits for the matching response.
    ///
    /// Dropping the returned future closes the underlying socket.
    async fn exchange(&self, addr: SocketAddr, request: Frame) -> Result<Frame, TransportError>;
}

/// One transport per protocol.
#[derive(Clone, Default)]
pub struct TransportSet {
    transports: HashMap<Protocol, Arc<dyn Transport>>,
}

impl TransportSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// UDP, TCP and HTTP with the resolver's timeouts.
    pub fn standard(config: &crate::ResolverConfig) -> Self {
        Self::new()
            .with(Arc::new(UdpTransport::new(config.udp_retry_schedule())))
            .with(Arc::new(TcpTransport::new(config.tcp_timeout())))
            .with(Arc::new(HttpTransport::new(config.tcp_timeout())))
    }

    /// Adds or replaces the transport for its protocol.
    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.protocol(), transport);
        self
    }

    /// Transport for `protocol`.
    pub fn get(&self, protocol: Protocol) -> Result<Arc<dyn Transport>, TransportError> {
        self.transports
            .get(&protocol)
            .cloned()
            .ok_or(TransportError::Unsupported(protocol))
    }

    /// True if `protocol` is available.
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.transports.contains_key(&protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            HandleError::from(TransportError::Timeout).kind(),
            ErrorKind::CannotConnectToServer
        );
        assert_eq!(
            HandleError::from(TransportError::Malformed("x".into())).kind(),
            ErrorKind::MessageFormatError
        );
        assert_eq!(
            HandleError::from(TransportError::Unsupported(Protocol::Https)).kind(),
            ErrorKind::UnknownProtocol
        );
    }

    #[test]
    fn test_transport_set() {
        let set = TransportSet::standard(&crate::ResolverConfig::default());
        assert!(set.supports(Protocol::Tcp));
        assert!(set.supports(Protocol::Udp));
        assert!(set.supports(Protocol::Http));
        assert!(matches!(
            set.get(Protocol::Https),
            Err(TransportError::Unsupported(Protocol::Https))
        ));
    }

    #[test]
    fn test_frame_length() {
        let frame = Frame::new(Envelope::default(), Bytes::from_static(b"abc"));
        assert_eq!(frame.envelope.message_length, 3);
    }
}
