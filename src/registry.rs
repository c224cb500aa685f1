//! Function registry: mapping key kinds to their evaluation logic.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::EvalContext;
use crate::key::{FunctionKind, KeyData};
use crate::value::Value;

/// What a function invocation produced.
#[derive(Debug)]
pub enum Step {
    /// The key's value is complete.
    Done(Value),
    /// Some requested dependencies were not ready; the invocation will be
    /// restarted from the beginning once they are.
    NotReady,
}

/// Evaluation logic for one key kind.
///
/// A function receives the key it is evaluating and a dependency requester.
/// It must be deterministic given the values of its requested dependencies:
/// the driver restarts suspended invocations from scratch, serving
/// already-resolved dependencies from memo, and prunes re-evaluation when
/// dependency values re-verify unchanged. For the same reason a function must
/// not perform non-idempotent side effects before all of its dependencies for
/// the current run are resolved.
///
/// Returning `Err` records a failure for the key; use `?` with any error
/// convertible to [`anyhow::Error`].
pub trait Function: Send + Sync + 'static {
    /// Run one invocation attempt.
    fn compute(&self, key: &KeyData, ctx: &mut EvalContext<'_>) -> anyhow::Result<Step>;
}

impl<F> Function for F
where
    F: Fn(&KeyData, &mut EvalContext<'_>) -> anyhow::Result<Step> + Send + Sync + 'static,
{
    fn compute(&self, key: &KeyData, ctx: &mut EvalContext<'_>) -> anyhow::Result<Step> {
        self(key, ctx)
    }
}

/// Maps a key's kind tag to the function that evaluates it.
///
/// The registry is populated through [`EvaluatorBuilder`](crate::EvaluatorBuilder)
/// before any evaluation starts and is immutable afterwards.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<FunctionKind, Arc<dyn Function>, ahash::RandomState>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the function for a kind, replacing any earlier registration.
    pub fn register(&mut self, kind: FunctionKind, function: impl Function) {
        self.functions.insert(kind, Arc::new(function));
    }

    /// Look up the function for a kind.
    pub fn lookup(&self, kind: FunctionKind) -> Option<Arc<dyn Function>> {
        self.functions.get(&kind).cloned()
    }

    /// The registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = FunctionKind> + '_ {
        self.functions.keys().copied()
    }
}
