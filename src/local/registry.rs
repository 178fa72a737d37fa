//! Session registry.
//!
//! Tracks every live session so shutdown can account for all of them
//! and operators can see what is in flight. Entries are removed by a
//! guard on every exit path, so the registry never holds a dead
//! session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// Unique session identifier.
pub type SessionId = u64;

/// What the registry knows about one live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Client peer address.
    pub peer_addr: SocketAddr,
    /// When the session was accepted.
    pub started_at: Instant,
}

/// Registry of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new session; the returned guard removes the entry
    /// when dropped.
    pub fn register(registry: &Arc<Self>, peer_addr: SocketAddr) -> RegistryGuard {
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        registry.sessions.write().insert(
            id,
            SessionEntry {
                peer_addr,
                started_at: Instant::now(),
            },
        );
        RegistryGuard {
            registry: Arc::clone(registry),
            id,
        }
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of all live entries.
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.sessions.read().values().cloned().collect()
    }

    fn remove(&self, id: SessionId) {
        self.sessions.write().remove(&id);
    }
}

/// Removes its session's registry entry on drop.
///
/// Held by the session task for its whole life, so error returns,
/// timeouts, and shutdown aborts all clear the entry.
#[derive(Debug)]
pub struct RegistryGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl RegistryGuard {
    /// The registered session id.
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(SessionRegistry::new());
        assert!(registry.is_empty());

        let first = SessionRegistry::register(&registry, peer());
        let second = SessionRegistry::register(&registry, peer());
        assert_eq!(registry.count(), 2);
        assert_ne!(first.id(), second.id());

        drop(first);
        assert_eq!(registry.count(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_entries_snapshot() {
        let registry = Arc::new(SessionRegistry::new());
        let _guard = SessionRegistry::register(&registry, peer());

        let entries = registry.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].peer_addr, peer());
    }
}
