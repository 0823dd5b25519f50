//! Process-wide connection registry and username bindings.
//!
//! Read-heavy: lookups take the shared lock, registration and association
//! take the exclusive lock briefly. A username is bound to at most one live
//! connection; binding it again evicts and disconnects the previous holder
//! after the lock is released.

use crate::service::connection::Connection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

#[derive(Default)]
struct HubInner {
    connections: HashMap<u64, Arc<Connection>>,
    username_to_id: HashMap<String, u64>,
    id_to_username: HashMap<u64, String>,
}

#[derive(Default)]
pub struct ConnectionHub {
    next_id: AtomicU64,
    inner: RwLock<HubInner>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a stable identifier for a connection about to be built.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        debug!(connection = conn.id(), peer = %conn.remote_addr(), "Connection registered");
        inner.connections.insert(conn.id(), conn);
    }

    /// Remove a connection and any username binding it held.
    pub fn unregister(&self, id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.connections.remove(&id);
        if let Some(username) = inner.id_to_username.remove(&id) {
            inner.username_to_id.remove(&username);
        }
    }

    /// Bind a username to a connection. A prior binding on the same
    /// connection is replaced; a prior binding of the same username on a
    /// different connection is evicted and that connection disconnected.
    pub fn associate_username(&self, conn: &Arc<Connection>, username: &str) {
        let evicted = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

            let evicted = match inner.username_to_id.get(username) {
                Some(&holder_id) if holder_id != conn.id() => {
                    inner.id_to_username.remove(&holder_id);
                    inner.connections.get(&holder_id).cloned()
                }
                _ => None,
            };

            if let Some(previous) = inner.id_to_username.insert(conn.id(), username.to_string()) {
                inner.username_to_id.remove(&previous);
            }
            inner.username_to_id.insert(username.to_string(), conn.id());
            evicted
        };

        if let Some(previous) = evicted {
            info!(
                username,
                evicted = previous.id(),
                replacement = conn.id(),
                "Username taken over; evicting previous session"
            );
            previous.disconnect();
        }
    }

    /// Drop the username binding for a connection, keeping the connection
    /// registered.
    pub fn dissociate(&self, id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(username) = inner.id_to_username.remove(&id) {
            inner.username_to_id.remove(&username);
        }
    }

    pub fn username_of(&self, id: u64) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.id_to_username.get(&id).cloned()
    }

    pub fn connection_of(&self, username: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let id = inner.username_to_id.get(username)?;
        inner.connections.get(id).cloned()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.connections.get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::core::pool::ObjectPool;
    use crate::utils::metrics::Metrics;

    fn conn(hub: &ConnectionHub) -> Arc<Connection> {
        let id = hub.allocate_id();
        let (conn, _rx) = Connection::new(
            id,
            "127.0.0.1:40000".parse().expect("addr"),
            ObjectPool::new(4),
            Arc::new(Metrics::new()),
            4,
            &LimitsConfig::default(),
        );
        hub.register(Arc::clone(&conn));
        conn
    }

    #[test]
    fn register_and_lookup() {
        let hub = ConnectionHub::new();
        let a = conn(&hub);
        assert_eq!(hub.len(), 1);
        assert!(hub.get(a.id()).is_some());
        hub.unregister(a.id());
        assert!(hub.is_empty());
    }

    #[test]
    fn association_resolves_both_ways() {
        let hub = ConnectionHub::new();
        let a = conn(&hub);
        hub.associate_username(&a, "alice");
        assert_eq!(hub.username_of(a.id()).as_deref(), Some("alice"));
        assert_eq!(hub.connection_of("alice").expect("bound").id(), a.id());
    }

    #[test]
    fn reassociation_replaces_prior_name() {
        let hub = ConnectionHub::new();
        let a = conn(&hub);
        hub.associate_username(&a, "alice");
        hub.associate_username(&a, "alyce");
        assert_eq!(hub.username_of(a.id()).as_deref(), Some("alyce"));
        assert!(hub.connection_of("alice").is_none());
    }

    #[test]
    fn username_takeover_evicts_previous_holder() {
        let hub = ConnectionHub::new();
        let a = conn(&hub);
        let b = conn(&hub);
        hub.associate_username(&a, "alice");
        hub.associate_username(&b, "alice");

        assert_eq!(hub.connection_of("alice").expect("bound").id(), b.id());
        assert!(hub.username_of(a.id()).is_none());
        assert!(a.is_closing());
        assert!(!b.is_closing());
    }

    #[test]
    fn unregister_clears_binding() {
        let hub = ConnectionHub::new();
        let a = conn(&hub);
        hub.associate_username(&a, "alice");
        hub.unregister(a.id());
        assert!(hub.connection_of("alice").is_none());
    }
}
