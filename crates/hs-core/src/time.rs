//! Timestamps and expiration checks.
//!
//! Two clocks appear on the wire: transaction and replication dates are
//! milliseconds since the Unix epoch ([`Timestamp`]), while value timestamps
//! and message expirations are whole seconds ([`epoch_secs`]).

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::encoding::{DecodeError, WireDecode, WireEncode};
use crate::MAX_CLOCK_SKEW_MS;

/// Timestamp in milliseconds since Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// One day in milliseconds.
    pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    /// Creates a new timestamp from milliseconds since Unix epoch.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the current time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now()).unwrap_or_default()
    }

    /// Creates a timestamp from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1000)
    }

    /// Returns the milliseconds since Unix epoch.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns the seconds since Unix epoch (truncated).
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1000
    }

    /// Creates from a SystemTime.
    pub fn from_system_time(time: SystemTime) -> Option<Self> {
        time.duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| Self(d.as_millis() as i64))
    }

    /// Returns true if this timestamp is within acceptable clock skew of the reference.
    pub fn within_clock_skew(&self, reference: &Timestamp) -> bool {
        (self.0 - reference.0).abs() <= MAX_CLOCK_SKEW_MS
    }

    /// Adds a duration to this timestamp.
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as i64))
    }

    /// Subtracts a duration from this timestamp.
    pub fn sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as i64))
    }

    /// Returns the duration between two timestamps.
    pub fn duration_since(&self, earlier: &Timestamp) -> Option<Duration> {
        if self.0 >= earlier.0 {
            Some(Duration::from_millis((self.0 - earlier.0) as u64))
        } else {
            None
        }
    }
}

impl WireEncode for Timestamp {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl WireDecode for Timestamp {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(i64::decode(buf)?))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

/// Current time in whole seconds since the Unix epoch.
pub fn epoch_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Returns true if a message with the given expiration (epoch seconds) has
/// expired at `now_secs`, allowing for [`MAX_CLOCK_SKEW_MS`] of skew.
///
/// An expiration of zero means the message never expires.
pub fn message_expired(expiration_secs: u32, now_secs: u32) -> bool {
    if expiration_secs == 0 {
        return false;
    }
    let skew_secs = MAX_CLOCK_SKEW_MS / 1000;
    (expiration_secs as i64) + skew_secs < now_secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_big_endian() {
        let ts = Timestamp::new(1_700_000_000_000);
        assert_eq!(ts.to_bytes().to_vec(), hex::decode("0000018bcfe56800").unwrap());
        assert_eq!(Timestamp::from_bytes(&ts.to_bytes().to_vec()).unwrap(), ts);
    }

    #[test]
    fn test_timestamp_now() {
        // After 2024-01-01
        assert!(Timestamp::now().0 > 1_704_067_200_000);
        assert!(epoch_secs() > 1_704_067_200);
    }

    #[test]
    fn test_clock_skew() {
        let now = Timestamp::now();
        assert!(Timestamp::new(now.0 + 60_000).within_clock_skew(&now));
        assert!(!Timestamp::new(now.0 + 400_000).within_clock_skew(&now));
    }

    #[test]
    fn test_message_expiration() {
        let now = 1_700_000_000;
        assert!(!message_expired(0, now));
        assert!(!message_expired(now + 10, now));
        // Inside the skew allowance.
        assert!(!message_expired(now - 200, now));
        assert!(message_expired(now - 301, now));
    }

    #[test]
    fn test_duration_since() {
        let earlier = Timestamp::new(1_000_000);
        let later = earlier.add(Duration::from_millis(5000));
        assert_eq!(later.duration_since(&earlier).unwrap().as_millis(), 5000);
        assert!(earlier.duration_since(&later).is_none());
        assert_eq!(later.sub(Duration::from_millis(5000)), earlier);
    }
}
