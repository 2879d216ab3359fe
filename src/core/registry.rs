// src/core/registry.rs

//! The authoritative, concurrently-updated set of live client connections.

use crate::connection::ClientConnection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of the registry at one instant. Immutable; safe to iterate while
/// the registry keeps changing underneath.
pub type RegistrySnapshot = Arc<HashMap<u64, Arc<ClientConnection>>>;

/// Maps connection identity (its id, not the username — usernames are not
/// unique) to the live connection. The map is published as an immutable `Arc`
/// replaced atomically on every add/remove, so readers always iterate a
/// consistent snapshot and never observe a connection mid-add or mid-remove.
/// The lock only guards the pointer swap; it is never held across I/O.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<RegistrySnapshot>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&self, conn: Arc<ClientConnection>) {
        let mut slot = self.clients.lock();
        let mut next = HashMap::clone(&slot);
        next.insert(conn.id(), conn);
        *slot = Arc::new(next);
    }

    /// Removes the connection with the given id. Returns it only if it was
    /// still present, so racing removals yield exactly one winner — the
    /// caller that gets `Some` fires the disconnected notification.
    pub fn remove(&self, id: u64) -> Option<Arc<ClientConnection>> {
        let mut slot = self.clients.lock();
        if !slot.contains_key(&id) {
            return None;
        }
        let mut next = HashMap::clone(&slot);
        let removed = next.remove(&id);
        *slot = Arc::new(next);
        removed
    }

    /// The current set of clients, as one consistent snapshot.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.clients.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
