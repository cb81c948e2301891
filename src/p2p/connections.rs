//! Connection registry: node identity to live transport handle.
//!
//! At most one handle per identity is authoritative for outbound sends. A
//! duplicate handshake for an already-connected identity supersedes the old
//! handle; dropping its sender closes the stale writer. Removal is
//! generation-checked so a superseded connection's teardown cannot evict its
//! replacement.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::identity::NodeIdentity;
use crate::p2p::message::Envelope;

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

#[derive(Clone)]
pub struct ConnectionHandle {
    pub identity: NodeIdentity,
    pub sender: mpsc::Sender<Envelope>,
    pub connection_id: u64,
}

pub struct ConnectionRegistry {
    inner: DashMap<String, ConnectionHandle>,
    next_connection_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Register a new live connection, superseding any existing handle for
    /// the same identity. Returns the new handle and the writer's queue
    /// receiver.
    pub fn insert(&self, identity: NodeIdentity) -> (ConnectionHandle, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle {
            identity: identity.clone(),
            sender,
            connection_id,
        };
        if let Some(old) = self.inner.insert(identity.id.clone(), handle.clone()) {
            debug!(
                peer = %identity,
                old_connection_id = old.connection_id,
                new_connection_id = connection_id,
                "superseding stale connection"
            );
        }
        (handle, receiver)
    }

    /// Remove the entry for `node_id` only if `connection_id` still owns it.
    /// Returns true when an entry was actually removed.
    pub fn remove_if_current(&self, node_id: &str, connection_id: u64) -> bool {
        self.inner
            .remove_if(node_id, |_, handle| handle.connection_id == connection_id)
            .is_some()
    }

    pub fn sender_for(&self, node_id: &str) -> Option<mpsc::Sender<Envelope>> {
        self.inner.get(node_id).map(|h| h.sender.clone())
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.inner.contains_key(node_id)
    }

    pub fn identities(&self) -> Vec<NodeIdentity> {
        self.inner.iter().map(|e| e.identity.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
