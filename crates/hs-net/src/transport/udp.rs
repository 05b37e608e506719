//! UDP transport.
//!
//! Messages are split into packets of at most 512 bytes, each carrying its
//! own envelope with a sequence number and the total message length. The
//! receiver reassembles by request id.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hs_core::{WireDecode, MAX_UDP_DATA_SIZE, MAX_UDP_PACKET_SIZE, MESSAGE_ENVELOPE_SIZE};
use hs_proto::{Envelope, Protocol};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::{Frame, Transport, TransportError};

/// Splits a frame into UDP packets.
pub fn split_packets(frame: &Frame) -> Vec<Bytes> {
    let total = frame.payload.len();
    let chunks: Vec<&[u8]> = if total == 0 {
        vec![&frame.payload[..0]]
    } else {
        frame.payload.chunks(MAX_UDP_DATA_SIZE).collect()
    };
    chunks
        .into_iter()
        .enumerate()
        .map(|(seq, chunk)| {
            let mut envelope = frame.envelope;
            envelope.sequence = seq as u32;
            envelope.message_length = total as u32;
            let mut packet = BytesMut::with_capacity(MESSAGE_ENVELOPE_SIZE + chunk.len());
            packet.extend_from_slice(&envelope.to_array());
            packet.extend_from_slice(chunk);
            packet.freeze()
        })
        .collect()
}

/// Collects the packets of one message.
#[derive(Debug, Default)]
pub struct UdpReassembler {
    envelope: Option<Envelope>,
    chunks: BTreeMap<u32, Bytes>,
    received: usize,
}

impl UdpReassembler {
    /// An empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request id of the message being assembled.
    pub fn request_id(&self) -> Option<u32> {
        self.envelope.map(|e| e.request_id)
    }

    /// Adds a packet. Returns the frame once every byte has arrived.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Frame>, TransportError> {
        if packet.len() < MESSAGE_ENVELOPE_SIZE {
            return Err(TransportError::Malformed(format!(
                "udp packet of {} bytes",
                packet.len()
            )));
        }
        let envelope = Envelope::from_bytes(&packet[..MESSAGE_ENVELOPE_SIZE])
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let data = &packet[MESSAGE_ENVELOPE_SIZE..];
        let total = envelope.message_length as usize;

        if let Some(first) = &self.envelope {
            if first.request_id != envelope.request_id || first.message_length != envelope.message_length {
                return Err(TransportError::Malformed(
                    "packet does not belong to this message".into(),
                ));
            }
        }

        let offset = (envelope.sequence as usize)
            .checked_mul(MAX_UDP_DATA_SIZE)
            .ok_or_else(|| TransportError::Malformed("sequence overflow".into()))?;
        let end = offset + data.len();
        let consistent = data.len() <= MAX_UDP_DATA_SIZE
            && end <= total
            && (end == total || data.len() == MAX_UDP_DATA_SIZE);
        if !consistent {
            return Err(TransportError::Malformed(format!(
                "packet {} with {} bytes does not fit a {total} byte message",
                envelope.sequence,
                data.len()
            )));
        }

        if self.envelope.is_none() {
            let mut first = envelope;
            first.sequence = 0;
            self.envelope = Some(first);
        }
        if !self.chunks.contains_key(&envelope.sequence) {
            self.received += data.len();
            self.chunks
                .insert(envelope.sequence, Bytes::copy_from_slice(data));
        }

        if self.received < total {
            return Ok(None);
        }
        let mut payload = BytesMut::with_capacity(total);
        for chunk in self.chunks.values() {
            payload.extend_from_slice(chunk);
        }
        let envelope = self
            .envelope
            .ok_or_else(|| TransportError::Malformed("empty message".into()))?;
        Ok(Some(Frame {
            envelope,
            payload: payload.freeze(),
        }))
    }
}

/// Most incomplete messages a server holds at once.
pub const MAX_PARTIAL_MESSAGES: usize = 1024;
/// How long an incomplete message waits for its remaining packets.
pub const PARTIAL_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

struct Partial {
    started: Instant,
    reassembler: UdpReassembler,
}

/// Incomplete messages keyed by sender and request id.
///
/// The table is bounded: stale entries go first, then the oldest.
pub struct PartialMessages {
    entries: HashMap<(SocketAddr, u32), Partial>,
    max_entries: usize,
    timeout: Duration,
}

impl PartialMessages {
    /// A table holding at most `max_entries` messages for `timeout` each.
    pub fn new(max_entries: usize, timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            timeout,
        }
    }

    /// Messages waiting for packets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a packet from `peer`. Returns the frame once its message is
    /// complete; a bad packet discards the message it claims to belong to.
    pub fn push(
        &mut self,
        peer: SocketAddr,
        packet: &[u8],
        now: Instant,
    ) -> Result<Option<Frame>, TransportError> {
        if packet.len() < MESSAGE_ENVELOPE_SIZE {
            return Err(TransportError::Malformed(format!(
                "udp packet of {} bytes",
                packet.len()
            )));
        }
        let envelope = Envelope::from_bytes(&packet[..MESSAGE_ENVELOPE_SIZE])
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let key = (peer, envelope.request_id);

        let Some(partial) = self.entries.get_mut(&key) else {
            let mut reassembler = UdpReassembler::new();
            if let Some(frame) = reassembler.push(packet)? {
                return Ok(Some(frame));
            }
            self.make_room(now);
            self.entries.insert(
                key,
                Partial {
                    started: now,
                    reassembler,
                },
            );
            return Ok(None);
        };
        match partial.reassembler.push(packet) {
            Ok(None) => Ok(None),
            done => {
                self.entries.remove(&key);
                done
            }
        }
    }

    /// Drops messages older than the timeout, returning how many.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries
            .retain(|_, p| now.saturating_duration_since(p.started) <= timeout);
        before - self.entries.len()
    }

    fn make_room(&mut self, now: Instant) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.evict_stale(now);
        if self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, p)| p.started)
            .map(|(key, _)| *key);
        if let Some((peer, request_id)) = oldest {
            trace!(%peer, request_id, "dropping oldest partial udp message");
            self.entries.remove(&(peer, request_id));
        }
    }
}

/// Datagram transport with a resend schedule.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    schedule: Vec<Duration>,
}

impl UdpTransport {
    /// Creates a transport waiting `schedule[i]` after the i-th send.
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn exchange(&self, addr: SocketAddr, request: Frame) -> Result<Frame, TransportError> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        let packets = split_packets(&request);
        let request_id = request.envelope.request_id;

        let mut reassembler = UdpReassembler::new();
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        for (attempt, wait) in self.schedule.iter().enumerate() {
            for packet in &packets {
                socket.send(packet).await?;
            }
            trace!(peer = %addr, attempt, packets = packets.len(), "sent udp request");

            let deadline = Instant::now() + *wait;
            loop {
                let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                let Ok(envelope) = Envelope::from_bytes(&buf[..n.min(MESSAGE_ENVELOPE_SIZE)]) else {
                    continue;
                };
                if envelope.request_id != request_id {
                    continue;
                }
                if let Some(frame) = reassembler.push(&buf[..n])? {
                    return Ok(frame);
                }
            }
            debug!(peer = %addr, attempt, "udp attempt timed out");
        }
        Err(TransportError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize) -> Frame {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Frame::new(
            Envelope {
                request_id: 42,
                ..Default::default()
            },
            Bytes::from(payload),
        )
    }

    #[test]
    fn test_split_sizes() {
        let packets = split_packets(&frame(1200));
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.len() <= MAX_UDP_PACKET_SIZE));
        assert_eq!(packets[0].len(), MAX_UDP_PACKET_SIZE);
        assert_eq!(split_packets(&frame(0)).len(), 1);
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let original = frame(1200);
        let packets = split_packets(&original);
        let mut r = UdpReassembler::new();
        assert!(r.push(&packets[2]).unwrap().is_none());
        assert!(r.push(&packets[0]).unwrap().is_none());
        // Duplicates are ignored.
        assert!(r.push(&packets[0]).unwrap().is_none());
        let done = r.push(&packets[1]).unwrap().unwrap();
        assert_eq!(done, original);
    }

    #[test]
    fn test_empty_message() {
        let original = frame(0);
        let mut r = UdpReassembler::new();
        assert_eq!(r.push(&split_packets(&original)[0]).unwrap(), Some(original));
    }

    #[test]
    fn test_rejects_inconsistent_packets() {
        let a = split_packets(&frame(1200));
        let mut other = frame(600);
        other.envelope.request_id = 43;
        let b = split_packets(&other);
        let mut r = UdpReassembler::new();
        r.push(&a[0]).unwrap();
        assert!(matches!(r.push(&b[0]), Err(TransportError::Malformed(_))));

        // A short packet that is not the last one.
        let mut short = a[0].to_vec();
        short.truncate(100);
        assert!(UdpReassembler::new().push(&short).is_err());
        assert!(UdpReassembler::new().push(&[0u8; 5]).is_err());
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_partial_messages_keyed_by_request() {
        let now = Instant::now();
        let mut table = PartialMessages::new(8, Duration::from_secs(10));
        let first = frame(1200);
        let mut second = frame(700);
        second.envelope.request_id = 43;
        let a = split_packets(&first);
        let b = split_packets(&second);

        // Interleaved messages from one peer both complete.
        assert!(table.push(peer(1), &a[0], now).unwrap().is_none());
        assert!(table.push(peer(1), &b[0], now).unwrap().is_none());
        assert!(table.push(peer(1), &a[1], now).unwrap().is_none());
        assert_eq!(table.len(), 2);
        assert_eq!(table.push(peer(1), &b[1], now).unwrap(), Some(second));
        assert_eq!(table.push(peer(1), &a[2], now).unwrap(), Some(first));
        assert!(table.is_empty());

        // Single-packet messages never wait.
        assert!(table.push(peer(2), &split_packets(&frame(100))[0], now).unwrap().is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_partial_messages_bounded_and_expire() {
        let start = Instant::now();
        let mut table = PartialMessages::new(2, Duration::from_secs(10));
        let packets = split_packets(&frame(1200));
        for port in 1..=3 {
            let at = start + Duration::from_secs(port as u64);
            table.push(peer(port), &packets[0], at).unwrap();
        }
        assert_eq!(table.len(), 2);
        // The oldest sender lost its message; the newest can finish.
        assert!(table.push(peer(1), &packets[1], start).unwrap().is_none());
        assert_eq!(table.len(), 2);
        table.push(peer(3), &packets[1], start).unwrap();
        assert!(table.push(peer(3), &packets[2], start).unwrap().is_some());

        assert_eq!(table.evict_stale(start + Duration::from_secs(60)), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_multi_packet() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
            let mut r = UdpReassembler::new();
            loop {
                let (n, peer) = server.recv_from(&mut buf).await.unwrap();
                if let Some(req) = r.push(&buf[..n]).unwrap() {
                    for p in split_packets(&req) {
                        server.send_to(&p, peer).await.unwrap();
                    }
                    break;
                }
            }
        });

        let transport = UdpTransport::new(vec![Duration::from_secs(2)]);
        let req = frame(1500);
        let resp = transport.exchange(addr, req.clone()).await.unwrap();
        assert_eq!(resp, req);
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(vec![Duration::from_millis(50), Duration::from_millis(50)]);
        let err = transport
            .exchange(silent.local_addr().unwrap(), frame(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }
}
