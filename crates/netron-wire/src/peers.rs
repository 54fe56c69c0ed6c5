//! Peer table: tracks every remote node this node has talked to.
//!
//! The [`PeerRegistry`] keeps one [`RemotePeer`] per remote node id for the
//! lifetime of the relationship. Entries are never replaced on reconnect,
//! so definitions, interfaces, meta and event listeners carry over.

use crate::peer::{Peer, PeerStatus, RemotePeer};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe table of known peers.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, Arc<RemotePeer>>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The peer for `node_id`, created with `make` on first contact.
    pub fn get_or_create(
        &self,
        node_id: &str,
        make: impl FnOnce() -> Arc<RemotePeer>,
    ) -> Arc<RemotePeer> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(peers.entry(node_id.to_string()).or_insert_with(make))
    }

    /// Get a specific peer.
    pub fn get_peer(&self, node_id: &str) -> Option<Arc<RemotePeer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node_id).cloned()
    }

    /// Forget an offline peer entirely. Online peers are kept.
    pub fn remove_peer(&self, node_id: &str) -> Option<Arc<RemotePeer>> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get(node_id) {
            Some(peer) if peer.status() == PeerStatus::Offline => peers.remove(node_id),
            _ => None,
        }
    }

    /// Get all online peers.
    pub fn online_peers(&self) -> Vec<Arc<RemotePeer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.status() == PeerStatus::Online)
            .cloned()
            .collect()
    }

    /// Get all peers (online + offline).
    pub fn all_peers(&self) -> Vec<Arc<RemotePeer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Online peers publishing a context named `ctx_id`.
    pub fn find_context(&self, ctx_id: &str) -> Vec<Arc<RemotePeer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.status() == PeerStatus::Online && p.has_context(ctx_id))
            .cloned()
            .collect()
    }

    /// Number of online peers.
    pub fn online_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.status() == PeerStatus::Online)
            .count()
    }

    /// Total number of peers (including offline).
    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
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
    use crate::message::WireMessage;
    use crate::peer::PeerLink;
    use crate::registry::DefinitionRegistry;
    use netron_types::{ContextDescriptor, Definition, NetronConfig};
    use tokio::sync::{mpsc, watch};

    fn make_peer(registry: &Arc<DefinitionRegistry>, node_id: &str) -> Arc<RemotePeer> {
        RemotePeer::new(node_id, registry, &NetronConfig::default())
    }

    fn bring_online(
        peer: &RemotePeer,
        contexts: Vec<Definition>,
    ) -> mpsc::UnboundedReceiver<WireMessage> {
        let (outbox, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        peer.begin_connect().unwrap();
        peer.connected(
            PeerLink {
                node_name: format!("{}-name", peer.id()),
                remote_addr: None,
                outbox,
                subscription: 0,
                shutdown,
            },
            contexts,
        );
        rx
    }

    #[test]
    fn test_get_or_create_reuses_peer() {
        let defs = Arc::new(DefinitionRegistry::new(16));
        let registry = PeerRegistry::new();
        let first = registry.get_or_create("node-1", || make_peer(&defs, "node-1"));
        let again = registry.get_or_create("node-1", || make_peer(&defs, "node-1"));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_remove_only_offline() {
        let defs = Arc::new(DefinitionRegistry::new(16));
        let registry = PeerRegistry::new();
        let peer = registry.get_or_create("node-1", || make_peer(&defs, "node-1"));
        let _rx = bring_online(&peer, vec![]);

        assert!(registry.remove_peer("node-1").is_none());
        peer.disconnect();
        assert!(registry.remove_peer("node-1").is_some());
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_online_counts() {
        let defs = Arc::new(DefinitionRegistry::new(16));
        let registry = PeerRegistry::new();
        let one = registry.get_or_create("node-1", || make_peer(&defs, "node-1"));
        registry.get_or_create("node-2", || make_peer(&defs, "node-2"));
        let _rx = bring_online(&one, vec![]);

        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.total_count(), 2);
        assert_eq!(registry.online_peers()[0].id(), "node-1");

        one.disconnect();
        assert_eq!(registry.online_count(), 0);
        assert_eq!(registry.all_peers().len(), 2);
    }

    #[test]
    fn test_find_context_skips_offline() {
        let defs = Arc::new(DefinitionRegistry::new(16));
        let registry = PeerRegistry::new();
        let calc = Definition::strong(1, "calc", &ContextDescriptor::new("Calculator"));
        let one = registry.get_or_create("node-1", || make_peer(&defs, "node-1"));
        let two = registry.get_or_create("node-2", || make_peer(&defs, "node-2"));
        let _rx1 = bring_online(&one, vec![calc.clone()]);
        let _rx2 = bring_online(&two, vec![calc]);

        assert_eq!(registry.find_context("calc").len(), 2);
        two.disconnect();
        let found = registry.find_context("calc");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "node-1");
        assert!(registry.find_context("missing").is_empty());
    }
}
