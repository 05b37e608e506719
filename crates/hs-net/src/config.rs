//! Resolver and server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use hs_core::crypto::CipherAlgorithm;
use hs_proto::{Protocol, ValueReference};
use serde::{Deserialize, Serialize};

/// Client-side resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// TCP and HTTP connect plus response timeout, milliseconds
    pub tcp_timeout_ms: u64,
    /// Per-attempt UDP wait times, milliseconds; one resend per entry
    pub udp_retry_schedule_ms: Vec<u64>,
    /// Protocols to try, in order
    pub preferred_protocols: Vec<Protocol>,
    /// Also race IPv6 server addresses
    pub ipv6_fast_fallback: bool,
    /// Sites whose description contains any of these words are skipped
    pub site_keyword_filter: Vec<String>,
    /// Head start given to a preferred primary before other sites race
    pub happy_eyeballs_delay_ms: u64,
    /// Log every message sent and received
    pub trace_messages: bool,
    /// Run requests inside sessions
    pub use_sessions: bool,
    /// Session lifetime requested from servers, seconds
    pub session_timeout_secs: u32,
    /// Service-referral hops followed before giving up
    pub max_referrals: usize,
    /// Root info refresh period, seconds
    pub root_refresh_interval_secs: u64,
    /// Bootstrap data older than this triggers a refresh, seconds
    pub bootstrap_max_age_secs: u64,
    /// Cached handles
    pub cache_max_entries: usize,
    /// Cipher for session keys; not read from configuration files
    #[serde(skip)]
    pub session_cipher: CipherAlgorithm,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_ms: 60_000,
            udp_retry_schedule_ms: vec![1_000, 2_000, 3_000],
            preferred_protocols: vec![Protocol::Tcp, Protocol::Udp, Protocol::Http],
            ipv6_fast_fallback: true,
            site_keyword_filter: Vec::new(),
            happy_eyeballs_delay_ms: 250,
            trace_messages: false,
            use_sessions: false,
            session_timeout_secs: 86_400,
            max_referrals: 5,
            root_refresh_interval_secs: 86_400,
            bootstrap_max_age_secs: 7 * 86_400,
            cache_max_entries: 10_000,
            session_cipher: CipherAlgorithm::Aes,
        }
    }
}

impl ResolverConfig {
    /// TCP timeout.
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    /// UDP retry schedule.
    pub fn udp_retry_schedule(&self) -> Vec<Duration> {
        self.udp_retry_schedule_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    /// Happy Eyeballs head start.
    pub fn happy_eyeballs_delay(&self) -> Duration {
        Duration::from_millis(self.happy_eyeballs_delay_ms)
    }

    /// Root refresh period.
    pub fn root_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.root_refresh_interval_secs)
    }
}

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP and UDP listen address; port 0 picks ephemeral ports
    pub listen_addr: SocketAddr,
    /// This server's number within its site
    pub server_id: u32,
    /// Idle lifetime of a session, seconds
    pub session_timeout_secs: u32,
    /// Concurrent sessions before setup is refused
    pub max_sessions: usize,
    /// Seconds a challenge stays answerable
    pub challenge_timeout_secs: u64,
    /// Forward recursive requests for handles not served here
    pub allow_recursion: bool,
    /// Identities allowed to home naming authorities and replicate
    pub server_admins: Vec<ValueReference>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 2641)),
            server_id: 1,
            session_timeout_secs: 86_400,
            max_sessions: 10_000,
            challenge_timeout_secs: 60,
            allow_recursion: false,
            server_admins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Session lifetime.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs as u64)
    }

    /// Challenge lifetime.
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResolverConfig::default();
        assert_eq!(config.preferred_protocols[0], Protocol::Tcp);
        assert_eq!(config.udp_retry_schedule().len(), 3);
        assert_eq!(config.root_refresh_interval(), Duration::from_secs(86_400));
        assert_eq!(ServerConfig::default().challenge_timeout(), Duration::from_secs(60));
    }
}
