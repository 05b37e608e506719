//! Feedback for server selection: response times and preferred primaries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// Preferred-primary marks older than this are ignored.
pub const PREFERRED_PRIMARY_EXPIRY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct ServerStats {
    last: Duration,
    average: Duration,
}

/// Latest and smoothed response time per server (`addr:port`).
#[derive(Debug, Default)]
pub struct ResponseTimes {
    stats: Mutex<HashMap<String, ServerStats>>,
}

impl ResponseTimes {
    /// No statistics yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a response time.
    pub fn record(&self, server: &str, elapsed: Duration) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(server.to_string()).or_insert(ServerStats {
            last: elapsed,
            average: elapsed,
        });
        entry.last = elapsed;
        entry.average = (entry.average * 7 + elapsed) / 8;
    }

    /// Latest response time.
    pub fn last(&self, server: &str) -> Option<Duration> {
        self.stats.lock().get(server).map(|s| s.last)
    }

    /// Smoothed response time.
    pub fn average(&self, server: &str) -> Option<Duration> {
        self.stats.lock().get(server).map(|s| s.average)
    }

    /// Orders candidates fastest first. Servers never measured sort first so
    /// they get tried; ties keep the given order.
    pub fn order<T>(&self, mut candidates: Vec<(String, T)>) -> Vec<(String, T)> {
        let stats = self.stats.lock();
        candidates.sort_by_key(|(key, _)| stats.get(key).map(|s| s.last).unwrap_or_default());
        candidates
    }

    /// After `elapsed` from the server just used, nudges every untried
    /// server at least twice as slow down by 1/128, so slow servers are
    /// retried now and then.
    pub fn after_success(&self, elapsed: Duration, untried: &[String]) {
        let mut stats = self.stats.lock();
        for key in untried {
            if let Some(s) = stats.get_mut(key) {
                if s.last >= elapsed * 2 {
                    s.last -= s.last / 128;
                    trace!(server = %key, last_ms = s.last.as_millis() as u64, "response time nudged");
                }
            }
        }
    }
}

/// Servers that recently answered an admin request, tried first next time.
#[derive(Debug, Default)]
pub struct PreferredPrimaries {
    marks: Mutex<HashMap<String, Instant>>,
}

impl PreferredPrimaries {
    /// No preferences.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefers `server` from now on.
    pub fn mark(&self, server: &str) {
        self.marks.lock().insert(server.to_string(), Instant::now());
    }

    /// True if `server` was marked within the expiry.
    pub fn is_preferred(&self, server: &str) -> bool {
        self.is_preferred_at(server, Instant::now())
    }

    /// As [`is_preferred`](Self::is_preferred) at `now`.
    pub fn is_preferred_at(&self, server: &str, now: Instant) -> bool {
        self.marks
            .lock()
            .get(server)
            .is_some_and(|marked| now.saturating_duration_since(*marked) < PREFERRED_PRIMARY_EXPIRY)
    }

    /// Drops the mark for `server`.
    pub fn forget(&self, server: &str) {
        self.marks.lock().remove(server);
    }
}
