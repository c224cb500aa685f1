//! Concurrent node storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::key::Key;
use crate::node::{Node, NodeState};

/// The node table: a concurrent mapping from key to its memoization record.
///
/// The table itself is guarded by one `RwLock`; each node carries its own
/// `Mutex` so state transitions are fine-grained. The graph also owns the
/// global change-version counter stamped onto values when they change.
pub(crate) struct Graph {
    nodes: RwLock<HashMap<Key, Arc<Mutex<Node>>, ahash::RandomState>>,
    version: AtomicU64,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::default()),
            version: AtomicU64::new(0),
        }
    }

    /// Get the node for a key, creating an unbuilt record on first reference.
    pub(crate) fn node(&self, key: Key) -> Arc<Mutex<Node>> {
        if let Some(node) = self.nodes.read().get(&key) {
            return node.clone();
        }
        let mut nodes = self.nodes.write();
        nodes
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Node::new(key))))
            .clone()
    }

    /// Get the node for a key if it exists.
    pub(crate) fn get(&self, key: Key) -> Option<Arc<Mutex<Node>>> {
        self.nodes.read().get(&key).cloned()
    }

    /// Clone a node's current record, if it exists.
    pub(crate) fn snapshot(&self, key: Key) -> Option<Node> {
        self.get(key).map(|node| node.lock().clone())
    }

    /// All keys currently stored.
    pub(crate) fn keys(&self) -> Vec<Key> {
        self.nodes.read().keys().copied().collect()
    }

    /// Allocate the next change version. Versions start at 1; 0 means "never
    /// changed".
    pub(crate) fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Remove a node if nothing depends on it.
    ///
    /// Returns true if the node was removed. The node's forward edges are
    /// detached from its dependencies' reverse sets. Must only be called
    /// while no evaluation round is active.
    pub(crate) fn evict_if_unused(&self, key: Key) -> bool {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get(&key) else {
            return false;
        };
        let deps: Vec<Key> = {
            let node = node.lock();
            if !node.rdeps.is_empty() || node.state == NodeState::Building {
                return false;
            }
            node.deps.iter().map(|e| e.key).collect()
        };
        nodes.remove(&key);
        for dep in deps {
            if let Some(dep_node) = nodes.get(&dep) {
                dep_node.lock().rdeps.remove(&key);
            }
        }
        true
    }
}
