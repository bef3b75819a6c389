use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::client::{ClientHandle, ConnectionId};
use crate::error::{RelayError, Result};

/// Thread-safe set of live clients, keyed by connection id.
///
/// The lock is only held for the map operation itself. Broadcasting works on
/// a [`snapshot`](Self::snapshot) so no network write ever happens under it.
pub struct ClientRegistry {
    clients: RwLock<BTreeMap<ConnectionId, ClientHandle>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection id
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a new client
    pub async fn add(&self, handle: ClientHandle) -> Result<()> {
        let mut clients = self.clients.write().await;

        if handle.is_retired() {
            return Err(RelayError::RetiredConnection(handle.id()));
        }
        if clients.contains_key(&handle.id()) {
            return Err(RelayError::DuplicateConnection(handle.id()));
        }

        let id = handle.id();
        clients.insert(id, handle);
        tracing::debug!("Client {} registered. Total clients: {}", id, clients.len());
        Ok(())
    }

    /// Deregister a client. Removing an unknown id is a no-op returning `false`.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut clients = self.clients.write().await;

        match clients.remove(&id) {
            Some(handle) => {
                handle.retire();
                tracing::debug!("Client {} removed. Remaining: {}", id, clients.len());
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the registered clients, ordered by id
    pub async fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Remove every client at once, returning what was registered
    pub async fn drain(&self) -> Vec<ClientHandle> {
        let mut clients = self.clients.write().await;
        let drained = std::mem::take(&mut *clients);

        drained
            .into_values()
            .inspect(|handle| {
                handle.retire();
            })
            .collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
