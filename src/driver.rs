//! The evaluation driver: worker pool, suspension, restart, and settlement.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::context::EvalContext;
use crate::error::EvalError;
use crate::graph::Graph;
use crate::invalidation;
use crate::key::{FunctionKind, Interner, Key, KeyData};
use crate::node::{DepEdge, NodeState};
use crate::observer::{EvalObserver, NoopObserver, SettleOutcome};
use crate::registry::{Function, FunctionRegistry, Step};
use crate::value::Value;

/// Error propagation policy for one evaluation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Abort the whole round on the first error and surface it immediately.
    FailFast,
    /// Record errors per node, continue unaffected subgraphs, and report every
    /// root's outcome.
    KeepGoing,
}

/// Handle for cancelling an evaluation round from another thread.
///
/// Cancellation is prompt but cooperative: workers finish or abandon their
/// current invocation, in-flight nodes revert to a re-runnable state, and the
/// round returns [`EvalError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-root outcomes of a keep-going round.
#[derive(Debug)]
pub struct EvalResults {
    results: Vec<(Key, Result<Value, EvalError>)>,
}

impl EvalResults {
    /// The outcome for one root key.
    pub fn get(&self, key: Key) -> Option<&Result<Value, EvalError>> {
        self.results
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, r)| r)
    }

    /// Iterate over roots in request order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &Result<Value, EvalError>)> {
        self.results.iter().map(|(k, r)| (*k, r))
    }

    /// Number of roots.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if there were no roots.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns true if every root produced a value.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }
}

impl IntoIterator for EvalResults {
    type Item = (Key, Result<Value, EvalError>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// Builder for [`Evaluator`].
pub struct EvaluatorBuilder {
    registry: FunctionRegistry,
    interner: Arc<Interner>,
    observer: Arc<dyn EvalObserver>,
    parallelism: usize,
}

impl Default for EvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluatorBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            registry: FunctionRegistry::new(),
            interner: Arc::new(Interner::new()),
            observer: Arc::new(NoopObserver),
            parallelism,
        }
    }

    /// Register the function for a key kind.
    pub fn function(mut self, kind: FunctionKind, function: impl Function) -> Self {
        self.registry.register(kind, function);
        self
    }

    /// Set the default worker pool size used by [`Evaluator::evaluate`].
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Install an observer for progress events.
    pub fn observer(mut self, observer: impl EvalObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Share an existing interner instead of creating a fresh one.
    pub fn interner(mut self, interner: Arc<Interner>) -> Self {
        self.interner = interner;
        self
    }

    /// Build the evaluator.
    pub fn build(self) -> Evaluator {
        Evaluator {
            graph: Graph::new(),
            registry: self.registry,
            interner: self.interner,
            observer: self.observer,
            default_parallelism: self.parallelism,
            round_guard: Mutex::new(()),
        }
    }
}

/// Drives sets of root keys to completion over a dynamically-discovered
/// dependency graph, memoizing every node along the way.
///
/// Evaluation rounds, invalidation sweeps, and eviction are mutually
/// exclusive; calls from multiple threads serialize on an internal guard.
pub struct Evaluator {
    graph: Graph,
    registry: FunctionRegistry,
    interner: Arc<Interner>,
    observer: Arc<dyn EvalObserver>,
    default_parallelism: usize,
    round_guard: Mutex<()>,
}

impl Evaluator {
    /// Create a builder.
    pub fn builder() -> EvaluatorBuilder {
        EvaluatorBuilder::new()
    }

    /// The shared key interner.
    pub fn interner(&self) -> &Arc<Interner> {
        &self.interner
    }

    /// Intern key data through the evaluator's interner.
    pub fn intern(&self, data: KeyData) -> Key {
        self.interner.intern(data)
    }

    /// Evaluate roots with the default parallelism.
    pub fn evaluate(&self, roots: &[Key], mode: EvalMode) -> Result<EvalResults, EvalError> {
        self.evaluate_with(roots, mode, self.default_parallelism)
    }

    /// Evaluate roots with an explicit worker pool size.
    ///
    /// In fail-fast mode the first error aborts the round and is returned as
    /// `Err`; in keep-going mode every root settles and the per-root outcomes
    /// are returned. Cancellation and invariant violations return `Err` in
    /// either mode.
    pub fn evaluate_with(
        &self,
        roots: &[Key],
        mode: EvalMode,
        parallelism: usize,
    ) -> Result<EvalResults, EvalError> {
        self.evaluate_with_token(roots, mode, parallelism, &CancelToken::new())
    }

    /// Evaluate roots with an explicit pool size and cancellation token.
    pub fn evaluate_with_token(
        &self,
        roots: &[Key],
        mode: EvalMode,
        parallelism: usize,
        token: &CancelToken,
    ) -> Result<EvalResults, EvalError> {
        let _guard = self.round_guard.lock();

        let mut seen: HashSet<Key, ahash::RandomState> = HashSet::default();
        let root_list: Vec<Key> = roots.iter().copied().filter(|k| seen.insert(*k)).collect();
        if root_list.is_empty() {
            return Ok(EvalResults { results: Vec::new() });
        }

        let workers = parallelism.max(1);
        let started = Instant::now();
        debug!(roots = root_list.len(), ?mode, workers, "evaluation round started");

        let round = Round::new(self, mode, &root_list, token.clone());
        let mut unsettled = 0usize;
        for &root in &root_list {
            if round.schedule_root(root) {
                unsettled += 1;
            }
        }
        round.roots_remaining.store(unsettled, Ordering::Release);

        if unsettled > 0 && round.round_error.lock().is_none() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| EvalError::Inconsistency(format!("worker pool: {e}")))?;
            pool.scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|_| round.worker());
                }
            });
        }

        round.revert_inflight();

        if let Some(err) = round.round_error.lock().take() {
            debug!(error = %err, elapsed = ?started.elapsed(), "evaluation round aborted");
            return Err(err);
        }

        let mut results = Vec::with_capacity(root_list.len());
        for &root in &root_list {
            let snapshot = self.graph.snapshot(root).ok_or_else(|| {
                EvalError::Inconsistency(format!("root {} vanished", self.interner.debug_repr(root)))
            })?;
            let outcome = match snapshot.state {
                NodeState::Done => match snapshot.value {
                    Some(value) => Ok(value),
                    None => {
                        return Err(EvalError::Inconsistency(format!(
                            "{} settled without a value",
                            self.interner.debug_repr(root)
                        )))
                    }
                },
                NodeState::Error => match snapshot.error {
                    Some(error) => Err(error),
                    None => {
                        return Err(EvalError::Inconsistency(format!(
                            "{} settled without an error record",
                            self.interner.debug_repr(root)
                        )))
                    }
                },
                other => {
                    return Err(EvalError::Inconsistency(format!(
                        "root {} finished the round in state {:?}",
                        self.interner.debug_repr(root),
                        other
                    )))
                }
            };
            results.push((root, outcome));
        }
        debug!(elapsed = ?started.elapsed(), "evaluation round finished");
        Ok(EvalResults { results })
    }

    /// Mark externally-changed keys and their transitive reverse-dependency
    /// closure as stale before the next round.
    ///
    /// The changed keys themselves will re-run their functions; transitive
    /// dependents re-verify their dependencies first and are change-pruned
    /// when nothing actually changed. Returns the number of nodes newly
    /// marked stale.
    pub fn invalidate(&self, changed: &[Key]) -> usize {
        let _guard = self.round_guard.lock();
        invalidation::sweep(&self.graph, &self.interner, self.observer.as_ref(), changed)
    }

    /// Remove a node if nothing depends on it; see it as host-driven cache
    /// retention, not part of normal evaluation.
    pub fn evict_if_unused(&self, key: Key) -> bool {
        let _guard = self.round_guard.lock();
        self.graph.evict_if_unused(key)
    }

    /// All keys with a node in the graph.
    pub fn keys(&self) -> Vec<Key> {
        self.graph.keys()
    }

    /// The node's current state, if it exists.
    pub fn state_of(&self, key: Key) -> Option<NodeState> {
        self.graph.snapshot(key).map(|n| n.state)
    }

    /// The node's stored value. Retained through `Dirty`/`Changed` for change
    /// pruning, so this can be `Some` for stale nodes.
    pub fn value_of(&self, key: Key) -> Option<Value> {
        self.graph.snapshot(key).and_then(|n| n.value)
    }

    /// The node's recorded failure, if it is in the error state.
    pub fn error_of(&self, key: Key) -> Option<EvalError> {
        self.graph.snapshot(key).and_then(|n| n.error)
    }

    /// The global version at which the node's value last changed.
    pub fn version_of(&self, key: Key) -> Option<u64> {
        self.graph.snapshot(key).map(|n| n.version)
    }

    /// How many full re-evaluations the node has completed.
    pub fn generation_of(&self, key: Key) -> Option<u64> {
        self.graph.snapshot(key).map(|n| n.generation)
    }

    /// Forward dependencies recorded by the node's last evaluation, in
    /// request order.
    pub fn deps_of(&self, key: Key) -> Option<Vec<Key>> {
        self.graph
            .snapshot(key)
            .map(|n| n.deps.iter().map(|e| e.key).collect())
    }

    /// Keys currently depending on this node.
    pub fn rdeps_of(&self, key: Key) -> Option<Vec<Key>> {
        self.graph
            .snapshot(key)
            .map(|n| n.rdeps.iter().copied().collect())
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }
}

/// Outcome of resolving one dependency request.
pub(crate) enum DepResolution {
    Ready { value: Value, version: u64 },
    Pending,
}

enum Plan {
    Build,
    Verify,
}

#[derive(Clone, Copy)]
enum Next {
    Park,
    Retry,
    Fail,
}

struct FailItem {
    key: Key,
    error: EvalError,
    edges: SmallVec<[DepEdge; 4]>,
}

#[derive(Default)]
struct Blocked {
    missing: usize,
    awaiting: SmallVec<[Key; 4]>,
    /// Awaited dependencies that settled with an error; recorded as forward
    /// edges on failure so fixing them re-dirties this node.
    failed_deps: SmallVec<[Key; 2]>,
    parked: bool,
    failure: Option<EvalError>,
}

impl Blocked {
    fn note_failed_dep(&mut self, dep: Key) {
        if !self.failed_deps.contains(&dep) {
            self.failed_deps.push(dep);
        }
    }

    /// Edges for an error settle: everything still awaited plus every
    /// dependency that already failed.
    fn error_edges(&self) -> SmallVec<[DepEdge; 4]> {
        let mut edges: SmallVec<[DepEdge; 4]> = self
            .awaiting
            .iter()
            .map(|k| DepEdge { key: *k, version: 0 })
            .collect();
        for dep in &self.failed_deps {
            if !edges.iter().any(|e| e.key == *dep) {
                edges.push(DepEdge { key: *dep, version: 0 });
            }
        }
        edges
    }
}

#[derive(Default)]
struct PendingState {
    /// Keys enqueued or in flight this round, cleared when they settle.
    scheduled: HashSet<Key, ahash::RandomState>,
    /// Requesters with outstanding dependency waits.
    blocked: HashMap<Key, Blocked, ahash::RandomState>,
    /// Dependency -> requesters to signal when it settles.
    waiters: HashMap<Key, Vec<Key>, ahash::RandomState>,
}

impl PendingState {
    /// Search the waiting relation for a path `from -> ... -> target`.
    fn wait_cycle(&self, from: Key, target: Key) -> Option<Vec<Key>> {
        let mut visited: HashSet<Key, ahash::RandomState> = HashSet::default();
        let mut path = Vec::new();
        if self.wait_dfs(from, target, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn wait_dfs(
        &self,
        current: Key,
        target: Key,
        visited: &mut HashSet<Key, ahash::RandomState>,
        path: &mut Vec<Key>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }
        path.push(current);
        if current == target {
            return true;
        }
        if let Some(blocked) = self.blocked.get(&current) {
            for &next in &blocked.awaiting {
                if self.wait_dfs(next, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }
}

/// State for one evaluation round, shared by every worker.
pub(crate) struct Round<'a> {
    eval: &'a Evaluator,
    mode: EvalMode,
    queue: Mutex<VecDeque<Key>>,
    queue_cv: Condvar,
    pending: Mutex<PendingState>,
    /// Pre-`Building` state of every in-flight node, for resumption planning
    /// and cancellation rollback.
    inflight: Mutex<HashMap<Key, NodeState, ahash::RandomState>>,
    roots: HashSet<Key, ahash::RandomState>,
    roots_remaining: AtomicUsize,
    busy: AtomicUsize,
    done: AtomicBool,
    cancel: CancelToken,
    round_error: Mutex<Option<EvalError>>,
}

impl<'a> Round<'a> {
    fn new(eval: &'a Evaluator, mode: EvalMode, roots: &[Key], cancel: CancelToken) -> Self {
        Self {
            eval,
            mode,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            pending: Mutex::new(PendingState::default()),
            inflight: Mutex::new(HashMap::default()),
            roots: roots.iter().copied().collect(),
            roots_remaining: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            cancel,
            round_error: Mutex::new(None),
        }
    }

    pub(crate) fn interner(&self) -> &Interner {
        self.eval.interner.as_ref()
    }

    /// Returns true if the root still needs work this round.
    fn schedule_root(&self, root: Key) -> bool {
        let node_arc = self.eval.graph().node(root);
        let node = node_arc.lock();
        match node.state {
            NodeState::Done | NodeState::Error => false,
            NodeState::Building => {
                self.abort_with(EvalError::Inconsistency(format!(
                    "{} was left building by a previous round",
                    self.interner().debug_repr(root)
                )));
                false
            }
            _ => {
                let mut pending = self.pending.lock();
                if pending.scheduled.insert(root) {
                    self.queue.lock().push_back(root);
                    self.eval.observer.on_enqueue(&self.interner().resolve(root));
                }
                true
            }
        }
    }

    fn worker(&self) {
        loop {
            let Some(key) = self.next_work() else { return };
            self.process(key);
            self.busy.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn next_work(&self) -> Option<Key> {
        let mut queue = self.queue.lock();
        loop {
            if self.done.load(Ordering::Acquire) {
                return None;
            }
            if self.cancel.is_cancelled() {
                drop(queue);
                self.abort_with(EvalError::Cancelled);
                return None;
            }
            if let Some(key) = queue.pop_front() {
                self.busy.fetch_add(1, Ordering::AcqRel);
                return Some(key);
            }
            if self.busy.load(Ordering::Acquire) == 0 {
                // Every worker is idle and nothing is queued; either the
                // round is complete or some wakeup was lost.
                if self.roots_remaining.load(Ordering::Acquire) > 0 {
                    drop(queue);
                    self.abort_with(EvalError::Inconsistency(
                        "evaluation stalled with unsettled roots".into(),
                    ));
                } else {
                    self.finish();
                }
                return None;
            }
            // Bounded wait so cancellation is noticed even while idle.
            self.queue_cv.wait_for(&mut queue, Duration::from_millis(25));
        }
    }

    fn process(&self, key: Key) {
        let node_arc = self.eval.graph().node(key);
        let plan = {
            let mut node = node_arc.lock();
            match node.state {
                NodeState::Done | NodeState::Error => None,
                NodeState::Building => {
                    // Resumption of a suspended evaluation.
                    let prior = self.inflight.lock().get(&key).copied();
                    match prior {
                        Some(NodeState::Dirty) if node.value.is_some() => Some(Plan::Verify),
                        Some(_) => Some(Plan::Build),
                        None => {
                            drop(node);
                            self.abort_with(EvalError::Inconsistency(format!(
                                "concurrent evaluation attempt for {}",
                                self.interner().debug_repr(key)
                            )));
                            return;
                        }
                    }
                }
                NodeState::Dirty if node.value.is_some() => {
                    self.inflight.lock().insert(key, node.state);
                    node.state = NodeState::Building;
                    Some(Plan::Verify)
                }
                NodeState::Unbuilt | NodeState::Changed | NodeState::Dirty => {
                    self.inflight.lock().insert(key, node.state);
                    node.state = NodeState::Building;
                    Some(Plan::Build)
                }
            }
        };
        match plan {
            Some(Plan::Build) => self.run_function(key),
            Some(Plan::Verify) => self.verify_deps(key),
            None => {}
        }
    }

    /// Change pruning: re-resolve the previously recorded deps in order; only
    /// re-run the function if one of them changed.
    fn verify_deps(&self, key: Key) {
        let edges: SmallVec<[DepEdge; 4]> = {
            let node_arc = self.eval.graph().node(key);
            let node = node_arc.lock();
            node.deps.clone()
        };
        for edge in &edges {
            match self.resolve_dep(key, edge.key) {
                DepResolution::Ready { version, .. } => {
                    if version != edge.version {
                        trace!(
                            key = %self.interner().debug_repr(key),
                            dep = %self.interner().debug_repr(edge.key),
                            "dependency changed, rebuilding"
                        );
                        self.run_function(key);
                        return;
                    }
                }
                DepResolution::Pending => {
                    self.after_not_ready(key);
                    return;
                }
            }
        }
        self.settle_pruned(key);
    }

    fn run_function(&self, key: Key) {
        let key_data = self.interner().resolve(key);
        let Some(function) = self.eval.registry.lookup(key_data.kind()) else {
            self.abort_with(EvalError::Inconsistency(format!(
                "no function registered for kind `{}`",
                key_data.kind().name()
            )));
            return;
        };
        self.eval.observer.on_compute_start(&key_data);
        trace!(key = %key_data.debug_repr(), "invoking function");

        let mut ctx = EvalContext::new(self, key);
        match function.compute(&key_data, &mut ctx) {
            Ok(Step::Done(value)) => {
                if ctx.saw_pending() {
                    self.abort_with(EvalError::Inconsistency(format!(
                        "{} completed with unresolved dependency requests",
                        key_data.debug_repr()
                    )));
                    return;
                }
                self.settle_value(key, value, ctx.into_edges());
            }
            Ok(Step::NotReady) => {
                if !ctx.saw_pending() {
                    self.abort_with(EvalError::Inconsistency(format!(
                        "{} suspended without requesting dependencies",
                        key_data.debug_repr()
                    )));
                    return;
                }
                self.after_not_ready(key);
            }
            Err(reason) => {
                let error = EvalError::FunctionFailure {
                    key: key_data.debug_repr(),
                    reason: Arc::new(reason),
                };
                if self.mode == EvalMode::FailFast {
                    self.abort_with(error.clone());
                }
                self.settle_error(key, error, ctx.into_edges());
            }
        }
    }

    /// Resolve one dependency for `parent`, scheduling or joining it when it
    /// is not settled yet.
    pub(crate) fn resolve_dep(&self, parent: Key, dep: Key) -> DepResolution {
        let dep_arc = self.eval.graph().node(dep);
        let mut deferred: Vec<FailItem> = Vec::new();
        let resolution = {
            let mut dep_node = dep_arc.lock();
            match dep_node.state {
                NodeState::Done => match dep_node.value.clone() {
                    Some(value) => DepResolution::Ready {
                        value,
                        version: dep_node.version,
                    },
                    None => {
                        drop(dep_node);
                        self.abort_with(EvalError::Inconsistency(format!(
                            "{} is done without a value",
                            self.interner().debug_repr(dep)
                        )));
                        DepResolution::Pending
                    }
                },
                NodeState::Error => {
                    let error = dep_node.error.clone().unwrap_or_else(|| {
                        EvalError::Inconsistency(format!(
                            "{} failed without an error record",
                            self.interner().debug_repr(dep)
                        ))
                    });
                    match self.mode {
                        EvalMode::FailFast => self.abort_with(error),
                        EvalMode::KeepGoing => {
                            let mut pending = self.pending.lock();
                            let repr = self.interner().debug_repr(parent);
                            let blocked = pending.blocked.entry(parent).or_default();
                            blocked.note_failed_dep(dep);
                            if blocked.failure.is_none() {
                                blocked.failure = Some(EvalError::DependencyFailure {
                                    key: repr,
                                    cause: Box::new(error),
                                });
                            }
                        }
                    }
                    DepResolution::Pending
                }
                state => {
                    let mut pending = self.pending.lock();
                    let blocked = pending.blocked.entry(parent).or_default();
                    let newly_awaited = if blocked.awaiting.contains(&dep) {
                        false
                    } else {
                        blocked.awaiting.push(dep);
                        blocked.missing += 1;
                        true
                    };
                    if newly_awaited {
                        let waiters = pending.waiters.entry(dep).or_default();
                        if !waiters.contains(&parent) {
                            waiters.push(parent);
                        }
                    }
                    if state == NodeState::Building {
                        // The dependency is itself waiting; a wait edge onto
                        // our own ancestry is a dynamic cycle.
                        if let Some(path) = pending.wait_cycle(dep, parent) {
                            self.fail_cycle(&mut pending, parent, path, &mut deferred);
                        }
                    } else if pending.scheduled.insert(dep) {
                        self.queue.lock().push_back(dep);
                        self.queue_cv.notify_one();
                        self.eval.observer.on_enqueue(&self.interner().resolve(dep));
                    }
                    DepResolution::Pending
                }
            }
        };
        self.drain_failures(deferred);
        resolution
    }

    /// Fail every key on a detected cycle. Parked members settle immediately;
    /// running members settle when their invocation returns.
    fn fail_cycle(
        &self,
        pending: &mut PendingState,
        parent: Key,
        mut path: Vec<Key>,
        deferred: &mut Vec<FailItem>,
    ) {
        let mut cycle = Vec::with_capacity(path.len() + 1);
        cycle.push(parent);
        cycle.append(&mut path);
        let reprs: Vec<String> = cycle.iter().map(|k| self.interner().debug_repr(*k)).collect();
        warn!(path = %reprs.join(" -> "), "dependency cycle detected");
        let error = EvalError::Cycle { path: reprs };

        let members = &cycle[..cycle.len() - 1];
        for &member in members {
            let blocked = pending.blocked.entry(member).or_default();
            if blocked.failure.is_none() {
                blocked.failure = Some(error.clone());
            }
        }
        for &member in members {
            let parked = pending
                .blocked
                .get(&member)
                .map(|b| b.parked)
                .unwrap_or(false);
            if !parked {
                continue;
            }
            if let Some(blocked) = pending.blocked.remove(&member) {
                for dep in &blocked.awaiting {
                    if let Some(waiters) = pending.waiters.get_mut(dep) {
                        waiters.retain(|k| *k != member);
                    }
                }
                let edges = blocked.error_edges();
                deferred.push(FailItem {
                    key: member,
                    error: blocked.failure.unwrap_or_else(|| error.clone()),
                    edges,
                });
            }
        }
    }

    /// Decide what happens to an invocation that returned without a value:
    /// settle with a recorded failure, retry immediately if every awaited
    /// dependency already settled, or park until the last one does.
    fn after_not_ready(&self, key: Key) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut fail_edges: SmallVec<[DepEdge; 4]> = SmallVec::new();
        let mut failure = None;
        let next = {
            let mut pending = self.pending.lock();
            let next = match pending.blocked.get(&key) {
                None => Next::Retry,
                Some(blocked) if blocked.failure.is_some() => Next::Fail,
                Some(blocked) if blocked.missing == 0 => Next::Retry,
                Some(_) => Next::Park,
            };
            match next {
                Next::Fail => {
                    if let Some(blocked) = pending.blocked.remove(&key) {
                        for dep in &blocked.awaiting {
                            if let Some(waiters) = pending.waiters.get_mut(dep) {
                                waiters.retain(|k| *k != key);
                            }
                        }
                        fail_edges = blocked.error_edges();
                        failure = blocked.failure;
                    }
                }
                Next::Retry => {
                    pending.blocked.remove(&key);
                }
                Next::Park => {
                    if let Some(blocked) = pending.blocked.get_mut(&key) {
                        blocked.parked = true;
                    }
                }
            }
            next
        };
        match next {
            Next::Fail => match failure {
                Some(error) => self.settle_error(key, error, fail_edges),
                None => self.enqueue_resume(key),
            },
            Next::Retry => {
                trace!(key = %self.interner().debug_repr(key), "restarting");
                self.enqueue_resume(key);
            }
            Next::Park => {
                trace!(key = %self.interner().debug_repr(key), "suspended");
            }
        }
    }

    fn enqueue_resume(&self, key: Key) {
        self.queue.lock().push_back(key);
        self.queue_cv.notify_one();
    }

    fn settle_value(&self, key: Key, value: Value, edges: SmallVec<[DepEdge; 4]>) {
        let node_arc = self.eval.graph().node(key);
        let (old_deps, changed) = {
            let mut node = node_arc.lock();
            if node.state != NodeState::Building {
                self.abort_with(EvalError::Inconsistency(format!(
                    "{} settled while not building",
                    self.interner().debug_repr(key)
                )));
                return;
            }
            let changed = match &node.value {
                Some(old) => *old != value,
                None => true,
            };
            if changed {
                node.version = self.eval.graph().next_version();
                node.value = Some(value);
            }
            node.error = None;
            let old_deps: SmallVec<[Key; 4]> = node.deps.iter().map(|e| e.key).collect();
            node.deps = edges.clone();
            node.state = NodeState::Done;
            node.generation += 1;
            (old_deps, changed)
        };
        for old in old_deps {
            if !edges.iter().any(|e| e.key == old) {
                if let Some(dep) = self.eval.graph().get(old) {
                    dep.lock().rdeps.remove(&key);
                }
            }
        }
        for edge in &edges {
            self.eval.graph().node(edge.key).lock().rdeps.insert(key);
        }
        self.inflight.lock().remove(&key);
        self.eval
            .observer
            .on_settled(&self.interner().resolve(key), SettleOutcome::Built { changed });
        trace!(key = %self.interner().debug_repr(key), changed, "built");
        let fails = self.notify_settled(key, None);
        self.drain_failures(fails);
    }

    /// Every dependency re-verified unchanged: keep the value, the version,
    /// and the edges without re-running the function.
    fn settle_pruned(&self, key: Key) {
        {
            let node_arc = self.eval.graph().node(key);
            let mut node = node_arc.lock();
            if node.state != NodeState::Building {
                self.abort_with(EvalError::Inconsistency(format!(
                    "{} settled while not building",
                    self.interner().debug_repr(key)
                )));
                return;
            }
            node.state = NodeState::Done;
            node.error = None;
        }
        self.inflight.lock().remove(&key);
        self.eval
            .observer
            .on_settled(&self.interner().resolve(key), SettleOutcome::Pruned);
        trace!(key = %self.interner().debug_repr(key), "change-pruned");
        let fails = self.notify_settled(key, None);
        self.drain_failures(fails);
    }

    fn settle_error(&self, key: Key, error: EvalError, edges: SmallVec<[DepEdge; 4]>) {
        self.drain_failures(vec![FailItem { key, error, edges }]);
    }

    fn drain_failures(&self, mut work: Vec<FailItem>) {
        while let Some(item) = work.pop() {
            let more = self.apply_error(item);
            work.extend(more);
        }
    }

    fn apply_error(&self, item: FailItem) -> Vec<FailItem> {
        let FailItem { key, error, mut edges } = item;
        {
            let mut pending = self.pending.lock();
            if let Some(blocked) = pending.blocked.remove(&key) {
                for dep in &blocked.awaiting {
                    if let Some(waiters) = pending.waiters.get_mut(dep) {
                        waiters.retain(|k| *k != key);
                    }
                }
                for extra in blocked.error_edges() {
                    if !edges.iter().any(|e| e.key == extra.key) {
                        edges.push(extra);
                    }
                }
            }
        }
        let node_arc = self.eval.graph().node(key);
        let added: Vec<Key> = {
            let mut node = node_arc.lock();
            if node.state != NodeState::Building {
                return Vec::new();
            }
            node.state = NodeState::Error;
            node.error = Some(error.clone());
            node.value = None;
            node.generation += 1;
            // Error nodes keep a superset of edges so fixing any input along
            // the failure path re-dirties them; exact edges are restored on
            // the next successful build.
            let mut added = Vec::new();
            for edge in &edges {
                if !node.has_dep(edge.key) {
                    node.deps.push(*edge);
                    added.push(edge.key);
                }
            }
            added
        };
        for dep in added {
            self.eval.graph().node(dep).lock().rdeps.insert(key);
        }
        self.inflight.lock().remove(&key);
        self.eval
            .observer
            .on_settled(&self.interner().resolve(key), SettleOutcome::Failed);
        debug!(key = %self.interner().debug_repr(key), error = %error, "failed");
        self.notify_settled(key, Some(&error))
    }

    /// Signal every waiter of a settled key. Requesters whose last awaited
    /// dependency settled are woken (or failed, when an awaited dependency
    /// errored in keep-going mode). Returns failures for the caller to drain.
    fn notify_settled(&self, key: Key, error: Option<&EvalError>) -> Vec<FailItem> {
        let mut fails = Vec::new();
        let mut wakes = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.scheduled.remove(&key);
            let parents = pending.waiters.remove(&key).unwrap_or_default();
            for parent in parents {
                let Some(blocked) = pending.blocked.get_mut(&parent) else {
                    continue;
                };
                let Some(pos) = blocked.awaiting.iter().position(|k| *k == key) else {
                    continue;
                };
                blocked.awaiting.remove(pos);
                blocked.missing -= 1;
                if let Some(error) = error {
                    if self.mode == EvalMode::KeepGoing {
                        blocked.note_failed_dep(key);
                        if blocked.failure.is_none() {
                            blocked.failure = Some(EvalError::DependencyFailure {
                                key: self.interner().debug_repr(parent),
                                cause: Box::new(error.clone()),
                            });
                        }
                    }
                }
                if blocked.parked && blocked.missing == 0 {
                    if let Some(blocked) = pending.blocked.remove(&parent) {
                        match blocked.failure {
                            Some(ref failure) => fails.push(FailItem {
                                key: parent,
                                error: failure.clone(),
                                edges: blocked.error_edges(),
                            }),
                            None => wakes.push(parent),
                        }
                    }
                }
            }
        }
        for parent in wakes {
            trace!(key = %self.interner().debug_repr(parent), "resuming");
            self.enqueue_resume(parent);
        }
        if self.roots.contains(&key) && self.roots_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
        fails
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.queue_cv.notify_all();
    }

    fn abort_with(&self, error: EvalError) {
        {
            let mut slot = self.round_error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.done.store(true, Ordering::Release);
        self.queue_cv.notify_all();
    }

    /// Return any node still building to its pre-round schedulable state, so
    /// an aborted round leaves nothing half-memoized.
    fn revert_inflight(&self) {
        let leftovers: Vec<(Key, NodeState)> = self.inflight.lock().drain().collect();
        for (key, prior) in leftovers {
            if let Some(node_arc) = self.eval.graph().get(key) {
                let mut node = node_arc.lock();
                if node.state == NodeState::Building {
                    trace!(key = %self.interner().debug_repr(key), ?prior, "reverted");
                    node.state = prior;
                }
            }
        }
    }
}
