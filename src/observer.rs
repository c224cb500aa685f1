//! Observation hooks for evaluation progress.
//!
//! Hosts can watch scheduling, settlement, and invalidation to drive progress
//! UIs or external cache-retention policies. The default [`NoopObserver`] has
//! no cost beyond a virtual call.

use crate::key::KeyData;

/// How a node settled at the end of an evaluation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The function ran to completion; `changed` is false when the produced
    /// value equaled the previous one (early cutoff).
    Built {
        /// Whether the node's value changed.
        changed: bool,
    },
    /// All dependencies re-verified unchanged; the function was not invoked.
    Pruned,
    /// The node settled with an error.
    Failed,
}

/// Callbacks invoked by the driver and the invalidation sweep.
///
/// Callbacks run inline on worker threads and must be cheap and non-blocking.
pub trait EvalObserver: Send + Sync + 'static {
    /// A key was enqueued for evaluation.
    fn on_enqueue(&self, key: &KeyData) {
        let _ = key;
    }

    /// A function invocation attempt is starting.
    fn on_compute_start(&self, key: &KeyData) {
        let _ = key;
    }

    /// A node reached a settled state.
    fn on_settled(&self, key: &KeyData, outcome: SettleOutcome) {
        let _ = (key, outcome);
    }

    /// A node was marked stale by an invalidation sweep; `direct` is true for
    /// the externally-changed keys themselves.
    fn on_dirtied(&self, key: &KeyData, direct: bool) {
        let _ = (key, direct);
    }
}

/// An observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl EvalObserver for NoopObserver {}
