//! HTTPS cipher-suite policy.
//!
//! Picks the suites to offer from what a TLS library supports. The policy
//! is a preference list; suites with broken primitives are never offered
//! even when listed.

/// Suites offered by default, most preferred first.
pub const DEFAULT_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_256_GCM_SHA384",
    "TLS_AES_128_GCM_SHA256",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_DHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_DHE_RSA_WITH_AES_128_GCM_SHA256",
];

const FORBIDDEN_MARKERS: &[&str] = &["_NULL_", "_anon_", "_EXPORT", "_RC4_", "_DES_", "_MD5"];

/// Cipher-suite preference list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    preferred: Vec<String>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CIPHER_SUITES.iter().map(|s| s.to_string()).collect())
    }
}

impl TlsPolicy {
    /// A policy preferring `preferred`, in order.
    pub fn new(preferred: Vec<String>) -> Self {
        Self { preferred }
    }

    /// True if the suite uses a primitive that is never acceptable.
    pub fn is_forbidden(suite: &str) -> bool {
        FORBIDDEN_MARKERS.iter().any(|m| suite.contains(m))
    }

    /// Suites to enable: preferred suites the library supports, in
    /// preference order, minus forbidden ones.
    pub fn select<S: AsRef<str>>(&self, supported: &[S]) -> Vec<String> {
        self.preferred
            .iter()
            .filter(|p| !Self::is_forbidden(p))
            .filter(|p| supported.iter().any(|s| s.as_ref() == p.as_str()))
            .cloned()
            .collect()
    }
}
