//! Process-wide set of live sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use tether_core::ids::ConnectionId;

/// Bookkeeping kept per live connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Remote address, when the transport reports one.
    pub peer: Option<SocketAddr>,
    /// When the connection was registered.
    pub connected_at: DateTime<Utc>,
}

/// Live connections keyed by id. Membership changes are point operations.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Returns `false` if the id was already present.
    pub fn add(&self, id: ConnectionId, peer: Option<SocketAddr>) -> bool {
        let info = ConnectionInfo {
            peer,
            connected_at: Utc::now(),
        };
        self.connections.insert(id, info).is_none()
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Register a connection for the lifetime of the returned guard.
    pub fn register(self: &Arc<Self>, id: ConnectionId, peer: Option<SocketAddr>) -> Registration {
        let _ = self.add(id.clone(), peer);
        debug!(connection_id = %id, "connection registered");
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Bookkeeping for `id`, if registered.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

/// Deregisters its connection when dropped, including during unwinding.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(&self.id) {
            debug!(connection_id = %self.id, "connection deregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::from("conn_a");
        assert!(registry.add(id.clone(), None));
        assert!(!registry.add(id.clone(), None));
        assert!(registry.contains(&id));
        assert_eq!(registry.count(), 1);

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn keeps_peer_address() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let _ = registry.add(id.clone(), Some(peer));
        assert_eq!(registry.get(&id).unwrap().peer, Some(peer));
        assert!(registry.get(&ConnectionId::new()).is_none());
    }

    #[test]
    fn guard_deregisters_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = ConnectionId::from("conn_g");
        let guard = registry.register(id.clone(), None);
        assert!(registry.contains(&id));
        drop(guard);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn guard_deregisters_on_panic() {
        let registry = Arc::new(ConnectionRegistry::new());
        let inner = Arc::clone(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.register(ConnectionId::from("conn_p"), None);
            panic!("session body failed");
        }));
        assert!(result.is_err());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn concurrent_membership() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let id = ConnectionId::from(format!("conn_{i}_{j}").as_str());
                        let _ = registry.add(id.clone(), None);
                        if j % 2 == 0 {
                            let _ = registry.remove(&id);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.count(), 8 * 25);
    }
}
