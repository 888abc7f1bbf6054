//! Connection registry: the single source of truth for who is connected
//!
//! Maps each [`ConnectionId`] to the live transport handle used to write to
//! that connection. Every operation is individually atomic, so I/O tasks
//! accepting, reading and dropping connections can use the registry
//! concurrently without an outer lock.

use dashmap::DashMap;
use log::{debug, error};
use shared::ConnectionId;

#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    connections: DashMap<ConnectionId, H>,
}

impl<H: Clone> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Associates `handle` with `id`.
    ///
    /// An existing entry is an anomaly (identities are never reused) and is
    /// logged, but the new handle still replaces the old one. The replaced
    /// handle is returned.
    pub fn register(&self, id: ConnectionId, handle: H) -> Option<H> {
        let previous = self.connections.insert(id, handle);
        if previous.is_some() {
            error!("There was an existing connection for id: {}", id);
        } else {
            debug!("Registered connection {}", id);
        }
        previous
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<H> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Removes the entry for `id`. Removing an unknown id is a no-op.
    ///
    /// Only the caller that actually removed the entry gets `Some`, which
    /// lets concurrent close paths agree on who reports the drop.
    pub fn remove(&self, id: &ConnectionId) -> Option<H> {
        self.connections.remove(id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Removes every entry, returning what was registered
    pub fn remove_all(&self) -> Vec<(ConnectionId, H)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(&id).map(|handle| (id, handle)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<H: Clone> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
