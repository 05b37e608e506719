//! TCP framing: an envelope followed by exactly `message_length` bytes.
//!
//! A connection may carry several frames; streamed replication responses
//! are a sequence of frames on one connection.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hs_core::{WireDecode, MESSAGE_ENVELOPE_SIZE};
use hs_proto::{Envelope, Protocol};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use super::{Frame, Transport, TransportError};

/// Writes one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut envelope = frame.envelope;
    envelope.message_length = frame.payload.len() as u32;
    writer.write_all(&envelope.to_array()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. A clean end of stream before the envelope is
/// [`TransportError::Closed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; MESSAGE_ENVELOPE_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let envelope =
        Envelope::from_bytes(&header).map_err(|e| TransportError::Malformed(e.to_string()))?;
    let mut payload = vec![0u8; envelope.message_length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        envelope,
        payload: Bytes::from(payload),
    })
}

/// One connection per exchange.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    /// Creates a transport with a connect and response timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Opens a connection within the timeout.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn exchange(&self, addr: SocketAddr, request: Frame) -> Result<Frame, TransportError> {
        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, &request).await?;
        trace!(peer = %addr, bytes = request.payload.len(), "sent tcp request");
        loop {
            let frame = timeout(self.timeout, read_frame(&mut stream))
                .await
                .map_err(|_| TransportError::Timeout)??;
            if frame.envelope.request_id == request.envelope.request_id {
                return Ok(frame);
            }
            trace!(peer = %addr, request_id = frame.envelope.request_id, "ignoring unrelated frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn frame(request_id: u32, payload: &'static [u8]) -> Frame {
        Frame::new(
            Envelope {
                request_id,
                ..Default::default()
            },
            Bytes::from_static(payload),
        )
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &frame(1, b"hello")).await.unwrap();
        write_frame(&mut a, &frame(2, b"")).await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), frame(1, b"hello"));
        assert_eq!(read_frame(&mut b).await.unwrap(), frame(2, b""));
        assert!(matches!(read_frame(&mut b).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut env = Envelope::default();
        env.message_length = 10;
        a.write_all(&env.to_array()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_exchange_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let req = read_frame(&mut sock).await.unwrap();
            // An unrelated frame first; the client must skip it.
            write_frame(&mut sock, &frame(999, b"noise")).await.unwrap();
            write_frame(&mut sock, &Frame::new(req.envelope, Bytes::from_static(b"pong")))
                .await
                .unwrap();
        });

        let transport = TcpTransport::new(Duration::from_secs(5));
        let resp = transport.exchange(addr, frame(7, b"ping")).await.unwrap();
        assert_eq!(resp.envelope.request_id, 7);
        assert_eq!(&resp.payload[..], b"pong");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = TcpTransport::new(Duration::from_secs(2));
        assert!(transport.exchange(addr, frame(1, b"x")).await.is_err());
    }
}
