//! Proxy metrics collection.
//!
//! Aggregate counters only; no per-destination or per-client data is
//! retained, so the metrics are safe to expose for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Proxy metrics collector.
pub struct LocalMetrics {
    /// Proxy start time
    start_time: Instant,
    /// Total sessions accepted
    total_sessions: AtomicU64,
    /// Currently live sessions
    active_sessions: AtomicU64,
    /// Sessions tunneled through a relay
    relayed_sessions: AtomicU64,
    /// Sessions dialed directly via the bypass ACL
    bypassed_sessions: AtomicU64,
    /// Sessions dropped for SOCKS5 violations
    protocol_errors: AtomicU64,
    /// Sessions dropped by the connect or idle timer
    timeouts: AtomicU64,
    /// Plaintext bytes shipped client → upstream
    bytes_up: AtomicU64,
    /// Plaintext bytes shipped upstream → client
    bytes_down: AtomicU64,
}

impl LocalMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_sessions: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            relayed_sessions: AtomicU64::new(0),
            bypassed_sessions: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Count an accepted session.
    pub fn session_opened(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished session.
    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a session that went through a relay.
    pub fn session_relayed(&self) {
        self.relayed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an ACL-bypassed session.
    pub fn session_bypassed(&self) {
        self.bypassed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a SOCKS5 protocol violation.
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connect or idle timer firing.
    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Add client → upstream plaintext bytes.
    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add upstream → client plaintext bytes.
    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total sessions accepted.
    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    /// Get currently live sessions.
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Get relayed session count.
    pub fn relayed_sessions(&self) -> u64 {
        self.relayed_sessions.load(Ordering::Relaxed)
    }

    /// Get bypassed session count.
    pub fn bypassed_sessions(&self) -> u64 {
        self.bypassed_sessions.load(Ordering::Relaxed)
    }

    /// Get protocol violation count.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Get timer-eviction count.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Get client → upstream byte total.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get upstream → client byte total.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

impl Default for LocalMetrics {
    fn default() -> Self {
        Self::new()
    }
}
