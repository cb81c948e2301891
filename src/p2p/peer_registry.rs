//! Peer registry: last-known catalog version and contents per peer.
//!
//! The stored `seq` for a peer never decreases while the entry lives. A
//! snapshot only applies when its version is strictly greater than the
//! stored one, and that condition is re-checked under the entry lock at
//! apply time, so duplicated and reordered gossip cannot regress or tear
//! the catalog.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::identity::NodeIdentity;
use crate::resource::{ResourceInfo, ResourcePath};

/// A remote node plus the locally-cached view of its catalog.
#[derive(Debug, Clone)]
pub struct Peer {
    pub identity: NodeIdentity,
    pub seq: u32,
    /// Whole-snapshot catalog; replaced atomically, never patched in place.
    pub catalog: Arc<HashMap<String, ResourceInfo>>,
}

pub struct PeerRegistry {
    inner: DashMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Ensure an entry exists for a freshly-connected peer. Catalog state
    /// starts empty at version 0 so any real announcement triggers a sync.
    pub fn note_connected(&self, identity: &NodeIdentity) {
        self.inner
            .entry(identity.id.clone())
            .or_insert_with(|| Peer {
                identity: identity.clone(),
                seq: 0,
                catalog: Arc::new(HashMap::new()),
            });
    }

    /// Drop a disconnected peer's entry; its resources are no longer
    /// routable and a reconnecting peer may legitimately restart its
    /// catalog version from scratch.
    pub fn remove(&self, node_id: &str) {
        if let Some((_, peer)) = self.inner.remove(node_id) {
            debug!(peer = %peer.identity, seq = peer.seq, "pruned peer catalog");
        }
    }

    /// Is `announced` newer than what we have for this peer?
    pub fn has_changed(&self, node_id: &str, announced: u32) -> bool {
        match self.inner.get(node_id) {
            Some(peer) => announced > peer.seq,
            None => true,
        }
    }

    /// Replace the peer's whole snapshot if `seq` is still strictly newer.
    /// Returns true when the snapshot was applied.
    pub fn apply_snapshot(
        &self,
        identity: &NodeIdentity,
        seq: u32,
        catalog: HashMap<String, ResourceInfo>,
    ) -> bool {
        let mut entry = self
            .inner
            .entry(identity.id.clone())
            .or_insert_with(|| Peer {
                identity: identity.clone(),
                seq: 0,
                catalog: Arc::new(HashMap::new()),
            });
        if seq <= entry.seq {
            debug!(peer = %identity, announced = seq, cached = entry.seq, "snapshot not newer, ignored");
            return false;
        }
        info!(
            peer = %identity,
            seq,
            resources = catalog.len(),
            "catalog updated"
        );
        entry.seq = seq;
        entry.catalog = Arc::new(catalog);
        true
    }

    pub fn get(&self, node_id: &str) -> Option<Peer> {
        self.inner.get(node_id).map(|p| p.value().clone())
    }

    /// Find the peer advertising `path`, if any.
    pub fn find_owner(&self, path: &ResourcePath) -> Option<NodeIdentity> {
        let key = path.to_string();
        self.inner
            .iter()
            .find(|peer| peer.catalog.contains_key(&key))
            .map(|peer| peer.identity.clone())
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.iter().map(|p| p.value().clone()).collect()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn identity(id: &str) -> NodeIdentity {
        let addr: SocketAddr = "127.0.0.1:8942".parse().unwrap();
        NodeIdentity::new(id.to_string(), addr)
    }

    fn catalog(paths: &[&str]) -> HashMap<String, ResourceInfo> {
        paths
            .iter()
            .map(|p| {
                (
                    p.to_string(),
                    ResourceInfo {
                        path: p.to_string(),
                        stub_type: "memory".to_string(),
                        properties: HashMap::new(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn merge_is_monotonic_and_idempotent() {
        let registry = PeerRegistry::new();
        let peer = identity("n1");

        assert!(registry.apply_snapshot(&peer, 3, catalog(&["a/b/c"])));
        assert_eq!(registry.get("n1").unwrap().seq, 3);

        // same version: unchanged
        assert!(!registry.apply_snapshot(&peer, 3, catalog(&["x/y/z"])));
        assert!(registry.get("n1").unwrap().catalog.contains_key("a/b/c"));

        // lower version: unchanged
        assert!(!registry.apply_snapshot(&peer, 2, catalog(&["x/y/z"])));
        assert_eq!(registry.get("n1").unwrap().seq, 3);

        // higher version: wholesale replacement, old entries pruned
        assert!(registry.apply_snapshot(&peer, 5, catalog(&["x/y/z"])));
        let applied = registry.get("n1").unwrap();
        assert_eq!(applied.seq, 5);
        assert!(applied.catalog.contains_key("x/y/z"));
        assert!(!applied.catalog.contains_key("a/b/c"));
    }

    #[test]
    fn has_changed_gates_on_strictly_greater() {
        let registry = PeerRegistry::new();
        let peer = identity("n1");

        // unknown peer: anything counts as changed
        assert!(registry.has_changed("n1", 1));

        registry.apply_snapshot(&peer, 5, catalog(&[]));
        assert!(!registry.has_changed("n1", 4));
        assert!(!registry.has_changed("n1", 5));
        assert!(registry.has_changed("n1", 6));
    }

    #[test]
    fn find_owner_scans_catalogs() {
        let registry = PeerRegistry::new();
        registry.apply_snapshot(&identity("n1"), 1, catalog(&["net1/chainA/resX"]));
        registry.apply_snapshot(&identity("n2"), 1, catalog(&["net2/chainB/resY"]));

        let path: ResourcePath = "net2/chainB/resY".parse().unwrap();
        assert_eq!(registry.find_owner(&path).unwrap().id, "n2");
        let missing: ResourcePath = "net9/chainZ/none".parse().unwrap();
        assert!(registry.find_owner(&missing).is_none());
    }

    #[test]
    fn remove_prunes_entry() {
        let registry = PeerRegistry::new();
        registry.apply_snapshot(&identity("n1"), 4, catalog(&["a/b/c"]));
        registry.remove("n1");
        assert!(registry.get("n1").is_none());
        // reconnect starts fresh: low seq accepted again
        assert!(registry.has_changed("n1", 1));
    }
}
