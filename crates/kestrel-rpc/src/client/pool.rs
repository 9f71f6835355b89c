//! Endpoint to connection registry.
//!
//! Every mutation publishes a fresh immutable [`PoolSnapshot`]. Strategies
//! derive senders from a snapshot, so a derived sender never observes a pool
//! that changes underneath it; the client re-derives when the snapshot
//! version moves.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::sender::RpcSender;

/// Identity of one registered connection, unique per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

#[derive(Clone)]
struct PoolEntry {
    id: ConnectionId,
    sender: Arc<dyn RpcSender>,
}

/// Immutable view of the pool at one version.
#[derive(Clone, Default)]
pub struct PoolSnapshot {
    version: u64,
    entries: HashMap<SocketAddr, PoolEntry>,
}

impl PoolSnapshot {
    /// Incremented on every membership change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<Arc<dyn RpcSender>> {
        self.entries.get(endpoint).map(|entry| entry.sender.clone())
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn connection_id(&self, endpoint: &SocketAddr) -> Option<ConnectionId> {
        self.entries.get(endpoint).map(|entry| entry.id)
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for PoolSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSnapshot")
            .field("version", &self.version)
            .field("endpoints", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Live connections keyed by endpoint, at most one per endpoint.
pub struct ConnectionPool {
    state: watch::Sender<Arc<PoolSnapshot>>,
    next_id: AtomicU64,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(PoolSnapshot::default()));
        Self {
            state,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a live connection, replacing any previous one for `endpoint`.
    pub fn put(&self, endpoint: SocketAddr, sender: Arc<dyn RpcSender>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.send_modify(|snapshot| {
            let mut next = PoolSnapshot::clone(snapshot);
            next.version += 1;
            if next.entries.insert(endpoint, PoolEntry { id, sender }).is_some() {
                debug!("Replaced pooled connection to {}", endpoint);
            }
            *snapshot = Arc::new(next);
        });
        id
    }

    /// Deregister whatever is registered for `endpoint`.
    pub fn remove(&self, endpoint: &SocketAddr) -> bool {
        self.modify_if(|next| next.entries.remove(endpoint).is_some())
    }

    /// Deregister `endpoint` only if it still maps to connection `id`.
    pub fn remove_connection(&self, endpoint: &SocketAddr, id: ConnectionId) -> bool {
        self.modify_if(|next| match next.entries.get(endpoint) {
            Some(entry) if entry.id == id => {
                next.entries.remove(endpoint);
                true
            }
            _ => false,
        })
    }

    pub fn clear(&self) {
        self.modify_if(|next| {
            let changed = !next.entries.is_empty();
            next.entries.clear();
            changed
        });
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<Arc<dyn RpcSender>> {
        self.state.borrow().get(endpoint)
    }

    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.state.borrow().clone()
    }

    /// Receiver notified on every membership change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PoolSnapshot>> {
        self.state.subscribe()
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.state.borrow().endpoints()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().is_empty()
    }

    /// Apply `change` to a copy of the current snapshot and publish it if
    /// `change` reports a modification.
    fn modify_if(&self, change: impl FnOnce(&mut PoolSnapshot) -> bool) -> bool {
        self.state.send_if_modified(|snapshot| {
            let mut next = PoolSnapshot::clone(snapshot);
            if !change(&mut next) {
                return false;
            }
            next.version += 1;
            *snapshot = Arc::new(next);
            true
        })
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionPool")
            .field(&*self.state.borrow())
            .finish()
    }
}
