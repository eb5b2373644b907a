//! Directory of live clients.
//!
//! # Responsibilities
//! - Map peer address → client handle for every connection between
//!   "registered" and "deregistered"
//! - Broadcast close to every live client during forced drain
//!
//! # Design Decisions
//! - Sharded map (dashmap); insert/remove are linearizable per key
//! - Removal is compare-and-remove, so a stale handler can never delete the
//!   entry of a newer connection that reused its peer address
//! - `close_all` works on a snapshot and never holds a shard lock while
//!   calling into a client

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;

use crate::observability::metrics;
use crate::protocol::{Client, ClientStats};

/// Concurrency-safe map of live clients keyed by peer address.
pub struct ConnectionRegistry<C> {
    clients: DashMap<SocketAddr, Arc<C>>,
}

impl<C: Client> ConnectionRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register `client` under `key`.
    ///
    /// Returns the client previously registered under the same key, if any.
    pub fn insert(&self, key: SocketAddr, client: Arc<C>) -> Option<Arc<C>> {
        let previous = self.clients.insert(key, client);
        if previous.is_none() {
            metrics::record_client_registered();
        }
        previous
    }

    /// Remove the entry for `key`, but only if it still refers to `client`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, key: &SocketAddr, client: &Arc<C>) -> bool {
        let removed = self
            .clients
            .remove_if(key, |_, current| Arc::ptr_eq(current, client))
            .is_some();
        if removed {
            metrics::record_client_deregistered();
        }
        removed
    }

    /// Look up the client registered for `key`.
    pub fn get(&self, key: &SocketAddr) -> Option<Arc<C>> {
        self.clients.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Ask every registered client to close.
    ///
    /// Entries are left in place; each handler removes its own once its I/O
    /// loop returns. Returns how many clients were signalled.
    pub fn close_all(&self) -> usize {
        let snapshot: Vec<Arc<C>> = self.clients.iter().map(|entry| Arc::clone(entry.value())).collect();

        for client in &snapshot {
            if let Err(e) = client.close() {
                tracing::warn!(
                    client_id = %client.id(),
                    peer_addr = %client.peer_addr(),
                    error = %e,
                    "Failed to close client"
                );
            }
        }
        snapshot.len()
    }

    /// Stats for every registered client, scoped to `scope`.
    pub fn snapshot(&self, scope: &str) -> Vec<ClientStats> {
        let snapshot: Vec<Arc<C>> = self.clients.iter().map(|entry| Arc::clone(entry.value())).collect();
        snapshot.iter().map(|client| client.stats(scope)).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl<C: Client> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
