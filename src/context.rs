//! The dependency requester passed to functions while they run.

use std::collections::HashSet;

use smallvec::SmallVec;

use crate::driver::{DepResolution, Round};
use crate::key::{Key, KeyData};
use crate::node::DepEdge;
use crate::value::Value;

/// Result of requesting a dependency value.
#[derive(Debug, Clone)]
pub enum Fetched {
    /// The dependency has settled; its memoized value is returned
    /// synchronously.
    Ready(Value),
    /// The dependency is not ready yet. The driver has scheduled it (or
    /// joined an in-flight evaluation) and registered the requester as a
    /// waiter; the current invocation should return
    /// [`Step::NotReady`](crate::Step).
    Pending,
}

impl Fetched {
    /// The value, if ready.
    pub fn ready(self) -> Option<Value> {
        match self {
            Fetched::Ready(value) => Some(value),
            Fetched::Pending => None,
        }
    }

    /// Returns true if the dependency was not ready.
    pub fn is_pending(&self) -> bool {
        matches!(self, Fetched::Pending)
    }
}

/// Execution context handed to a [`Function`](crate::Function) invocation.
///
/// Every dependency obtained through [`request`](EvalContext::request) is
/// recorded; when the invocation completes, the recorded set becomes the
/// node's forward-dependency list (in first-request order, without
/// duplicates).
pub struct EvalContext<'a> {
    round: &'a Round<'a>,
    key: Key,
    recorded: Vec<DepEdge>,
    recorded_set: HashSet<Key, ahash::RandomState>,
    pending_seen: bool,
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(round: &'a Round<'a>, key: Key) -> Self {
        Self {
            round,
            key,
            recorded: Vec::new(),
            recorded_set: HashSet::default(),
            pending_seen: false,
        }
    }

    /// The key currently being evaluated.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Intern key data, e.g. to mint a dependency key.
    pub fn intern(&self, data: KeyData) -> Key {
        self.round.interner().intern(data)
    }

    /// Request the value of another key.
    ///
    /// Returns [`Fetched::Ready`] with the memoized value when the dependency
    /// has settled, otherwise [`Fetched::Pending`]. After any `Pending`
    /// response the invocation should finish with
    /// [`Step::NotReady`](crate::Step); it is restarted once every pending
    /// dependency has settled.
    pub fn request(&mut self, dep: Key) -> Fetched {
        match self.round.resolve_dep(self.key, dep) {
            DepResolution::Ready { value, version } => {
                if self.recorded_set.insert(dep) {
                    self.recorded.push(DepEdge { key: dep, version });
                }
                Fetched::Ready(value)
            }
            DepResolution::Pending => {
                self.pending_seen = true;
                Fetched::Pending
            }
        }
    }

    /// Request several keys at once.
    ///
    /// All unavailable dependencies are scheduled before this returns, so a
    /// batched request costs at most one suspension instead of one per
    /// dependency.
    pub fn request_all(&mut self, deps: &[Key]) -> Vec<Fetched> {
        deps.iter().map(|dep| self.request(*dep)).collect()
    }

    pub(crate) fn saw_pending(&self) -> bool {
        self.pending_seen
    }

    pub(crate) fn into_edges(self) -> SmallVec<[DepEdge; 4]> {
        SmallVec::from_vec(self.recorded)
    }
}
