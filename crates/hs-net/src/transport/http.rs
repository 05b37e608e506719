//! HTTP transport: one `POST` per exchange.
//!
//! The body is the envelope and message bytes, sent as
//! `application/x-hdl-message`; the response body has the same shape.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hs_core::{WireDecode, MAX_MESSAGE_LENGTH, MESSAGE_ENVELOPE_SIZE};
use hs_proto::{Envelope, Protocol};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use super::{Frame, Transport, TransportError};

/// Content type of Handle messages over HTTP.
pub const CONTENT_TYPE: &str = "application/x-hdl-message";

const MAX_HEADER_LINES: usize = 64;

fn frame_body(frame: &Frame) -> Vec<u8> {
    let mut envelope = frame.envelope;
    envelope.message_length = frame.payload.len() as u32;
    let mut body = Vec::with_capacity(MESSAGE_ENVELOPE_SIZE + frame.payload.len());
    body.extend_from_slice(&envelope.to_array());
    body.extend_from_slice(&frame.payload);
    body
}

/// Parses an HTTP body back into a frame.
pub fn parse_frame_body(body: &[u8]) -> Result<Frame, TransportError> {
    if body.len() < MESSAGE_ENVELOPE_SIZE {
        return Err(TransportError::Malformed("http body shorter than an envelope".into()));
    }
    let envelope = Envelope::from_bytes(&body[..MESSAGE_ENVELOPE_SIZE])
        .map_err(|e| TransportError::Malformed(e.to_string()))?;
    let payload = &body[MESSAGE_ENVELOPE_SIZE..];
    if payload.len() != envelope.message_length as usize {
        return Err(TransportError::Malformed(format!(
            "envelope announces {} bytes, body has {}",
            envelope.message_length,
            payload.len()
        )));
    }
    Ok(Frame {
        envelope,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Encodes the `POST` request carrying `frame`.
pub fn encode_request(host: &str, frame: &Frame) -> Vec<u8> {
    let body = frame_body(frame);
    let mut out = format!(
        "POST / HTTP/1.1\r\nHost: {host}\r\nContent-Type: {CONTENT_TYPE}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);
    out
}

/// Encodes a `200 OK` response carrying `frame`.
pub fn encode_response(frame: &Frame) -> Vec<u8> {
    let body = frame_body(frame);
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {CONTENT_TYPE}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);
    out
}

/// A parsed HTTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    /// Request or status line.
    pub start_line: String,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpMessage {
    /// Status code, for responses.
    pub fn status(&self) -> Option<u16> {
        let mut parts = self.start_line.split_whitespace();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        parts.next()?.parse().ok()
    }
}

/// Reads a start line, headers and a `Content-Length` body.
pub async fn read_http_message<R>(reader: R) -> Result<HttpMessage, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut start_line = String::new();
    if reader.read_line(&mut start_line).await? == 0 {
        return Err(TransportError::Closed);
    }
    let start_line = start_line.trim_end().to_string();

    let mut content_length = None;
    for _ in 0..MAX_HEADER_LINES {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(TransportError::Malformed("headers not terminated".into()));
        }
        let line = line.trim_end();
        if line.is_empty() {
            let len: usize = content_length
                .ok_or_else(|| TransportError::Malformed("missing Content-Length".into()))?;
            if len > MAX_MESSAGE_LENGTH + MESSAGE_ENVELOPE_SIZE {
                return Err(TransportError::Malformed(format!("body of {len} bytes")));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            return Ok(HttpMessage { start_line, body });
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = Some(value.trim().parse().map_err(|_| {
                    TransportError::Malformed(format!("bad Content-Length {value:?}"))
                })?);
            }
        }
    }
    Err(TransportError::Malformed("too many header lines".into()))
}

/// HTTP client transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport with a connect and response timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn exchange(&self, addr: SocketAddr, request: Frame) -> Result<Frame, TransportError> {
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream
            .write_all(&encode_request(&addr.to_string(), &request))
            .await?;
        trace!(peer = %addr, "sent http request");

        let response = timeout(self.timeout, read_http_message(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout)??;
        match response.status() {
            Some(200) => parse_frame_body(&response.body),
            other => Err(TransportError::Malformed(format!(
                "http status {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn frame() -> Frame {
        Frame::new(
            Envelope {
                request_id: 9,
                ..Default::default()
            },
            Bytes::from_static(b"message bytes"),
        )
    }

    #[tokio::test]
    async fn test_request_parses() {
        let raw = encode_request("example.org:8000", &frame());
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("POST / HTTP/1.1\r\n"));
        assert!(text.contains("Content-Type: application/x-hdl-message\r\n"));

        let msg = read_http_message(&raw[..]).await.unwrap();
        assert_eq!(msg.start_line, "POST / HTTP/1.1");
        assert_eq!(msg.status(), None);
        assert_eq!(parse_frame_body(&msg.body).unwrap(), frame());
    }

    #[tokio::test]
    async fn test_missing_length_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: x\r\n\r\nabc";
        assert!(matches!(
            read_http_message(&raw[..]).await,
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_body_length_mismatch() {
        let mut body = frame_body(&frame());
        body.pop();
        assert!(parse_frame_body(&body).is_err());
    }

    #[tokio::test]
    async fn test_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (read, mut write) = sock.split();
            let req = read_http_message(read).await.unwrap();
            let frame = parse_frame_body(&req.body).unwrap();
            write.write_all(&encode_response(&frame)).await.unwrap();
        });

        let transport = HttpTransport::new(Duration::from_secs(5));
        assert_eq!(transport.exchange(addr, frame()).await.unwrap(), frame());
    }
}
