//! Per-key node records.

use std::collections::HashSet;

use smallvec::SmallVec;

use crate::error::EvalError;
use crate::key::Key;
use crate::value::Value;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Created on first reference, never evaluated.
    Unbuilt,
    /// An evaluation of this key is in flight (possibly suspended).
    Building,
    /// Evaluated; `value` holds the memoized result.
    Done,
    /// Possibly stale: a dependency was invalidated. The previous value and
    /// dependency list are retained so the node can be change-pruned.
    Dirty,
    /// Known stale: the key itself was invalidated, so its function must be
    /// re-run regardless of dependency verification.
    Changed,
    /// Evaluation failed; `error` holds the failure.
    Error,
}

impl NodeState {
    /// Terminal until the next invalidation sweep.
    pub fn is_settled(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Error)
    }
}

/// A forward dependency edge with the dependency's version observed when this
/// node was last built.
///
/// Edge order is the request order of the last successful evaluation; dirty
/// nodes re-verify their edges in exactly that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEdge {
    /// The dependency's key.
    pub key: Key,
    /// The dependency's change version at build time; `0` if the dependency
    /// had not settled with a value when the edge was recorded.
    pub version: u64,
}

/// The mutable record tracking one key's state, value, and dependency edges.
///
/// A node's fields are mutated only by the single in-flight evaluation
/// permitted for its key, or by an invalidation sweep running between rounds.
#[derive(Debug, Clone)]
pub struct Node {
    /// The key this node memoizes.
    pub key: Key,
    /// Current lifecycle state.
    pub state: NodeState,
    /// Memoized value; present iff `state` is `Done` (retained through
    /// `Dirty`/`Changed` for pruning).
    pub value: Option<Value>,
    /// Failure record; present iff `state` is `Error`.
    pub error: Option<EvalError>,
    /// Forward dependency edges, in request order of the last evaluation.
    pub deps: SmallVec<[DepEdge; 4]>,
    /// Keys that depend on this node; the exact inverse of `deps` across the
    /// graph at quiescent points.
    pub rdeps: HashSet<Key, ahash::RandomState>,
    /// Incremented each time the node completes a full re-evaluation.
    pub generation: u64,
    /// Global version counter value when the node's value last changed.
    pub version: u64,
}

impl Node {
    /// Create an unbuilt node for a key.
    pub(crate) fn new(key: Key) -> Self {
        Self {
            key,
            state: NodeState::Unbuilt,
            value: None,
            error: None,
            deps: SmallVec::new(),
            rdeps: HashSet::default(),
            generation: 0,
            version: 0,
        }
    }

    /// Returns true if an edge to `dep` is already recorded.
    pub(crate) fn has_dep(&self, dep: Key) -> bool {
        self.deps.iter().any(|e| e.key == dep)
    }
}
