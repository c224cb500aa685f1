//! Dirty propagation across reverse-dependency edges.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, trace};

use crate::graph::Graph;
use crate::key::{Interner, Key};
use crate::node::NodeState;
use crate::observer::EvalObserver;

/// Mark externally-changed keys and their transitive dependents stale.
///
/// Directly-changed keys become `Changed`: their functions must re-run even if
/// every recorded dependency re-verifies. Everything reachable from them over
/// reverse edges becomes `Dirty`: eligible for change pruning on the next
/// round. Neither marking discards the previous value or dependency list.
/// Each node is visited at most once per sweep; returns the number of nodes
/// whose marking changed.
pub(crate) fn sweep(
    graph: &Graph,
    interner: &Interner,
    observer: &dyn EvalObserver,
    changed: &[Key],
) -> usize {
    let mut visited: HashSet<Key, ahash::RandomState> = HashSet::default();
    let mut frontier: VecDeque<Key> = VecDeque::new();
    let mut dirtied = 0usize;

    for &key in changed {
        if !visited.insert(key) {
            continue;
        }
        let Some(node_arc) = graph.get(key) else {
            // Never referenced; there is nothing memoized to discard.
            continue;
        };
        let mut node = node_arc.lock();
        match node.state {
            NodeState::Done | NodeState::Error | NodeState::Dirty => {
                node.state = NodeState::Changed;
                dirtied += 1;
                observer.on_dirtied(&interner.resolve(key), true);
                debug!(key = %interner.debug_repr(key), "invalidated");
            }
            NodeState::Changed | NodeState::Unbuilt => {}
            NodeState::Building => {
                debug_assert!(false, "invalidation sweep during an evaluation round");
            }
        }
        for rdep in node.rdeps.iter() {
            frontier.push_back(*rdep);
        }
    }

    while let Some(key) = frontier.pop_front() {
        if !visited.insert(key) {
            continue;
        }
        let Some(node_arc) = graph.get(key) else {
            continue;
        };
        let mut node = node_arc.lock();
        match node.state {
            NodeState::Done | NodeState::Error => {
                node.state = NodeState::Dirty;
                dirtied += 1;
                observer.on_dirtied(&interner.resolve(key), false);
                trace!(key = %interner.debug_repr(key), "marked dirty");
            }
            _ => {}
        }
        for rdep in node.rdeps.iter() {
            if !visited.contains(rdep) {
                frontier.push_back(*rdep);
            }
        }
    }

    dirtied
}
