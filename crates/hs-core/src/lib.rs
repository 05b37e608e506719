//! HS Core - Core types, traits, and primitives for the Handle System protocol.
//!
//! This crate provides:
//! - Big-endian wire encoding primitives with decode-time bounds
//! - The flat error taxonomy shared by every layer
//! - Handle byte-string utilities (prefix normalization, server hashing)
//! - Cryptographic primitives (digests, MACs, block ciphers, signatures, DH)
//! - Timestamps and TTL arithmetic

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod encoding;
pub mod error;
pub mod handle;
pub mod time;

pub use encoding::{DecodeError, WireDecode, WireEncode};
pub use error::{ErrorKind, HandleError, HandleResult};
pub use handle::{Handle, HashOption};
pub use time::Timestamp;

/// Protocol major version.
pub const MAJOR_VERSION: u8 = 2;
/// Highest protocol minor version this implementation speaks.
pub const MINOR_VERSION: u8 = 11;

/// Size of the fixed message header in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 24;
/// Size of the message envelope in bytes.
pub const MESSAGE_ENVELOPE_SIZE: usize = 20;
/// Maximum encoded message length (header + body + credential).
pub const MAX_MESSAGE_LENGTH: usize = 262_144;
/// Maximum size of a single UDP packet, envelope included.
pub const MAX_UDP_PACKET_SIZE: usize = 512;
/// Maximum message bytes carried by a single UDP packet.
pub const MAX_UDP_DATA_SIZE: usize = MAX_UDP_PACKET_SIZE - MESSAGE_ENVELOPE_SIZE;

/// Largest array length accepted while decoding.
pub const MAX_ARRAY_SIZE: usize = 1_048_576;
/// Largest handle accepted while decoding.
pub const MAX_HANDLE_LENGTH: usize = 2048;

/// Offset into an encoded value at which digests and signatures start.
///
/// The first eight bytes hold the index and timestamp.
pub const VALUE_DIGEST_OFFSET: usize = 8;

/// TTLs above this many seconds are capped for staleness checks (2 days).
pub const MAX_RECOGNIZED_TTL: u32 = 172_800;

/// Maximum clock skew tolerated when checking message expiration (5 minutes).
pub const MAX_CLOCK_SKEW_MS: i64 = 300_000;
