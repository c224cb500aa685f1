//! Memoized evaluation results.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::key::DynEq;

/// Trait object bound for stored values.
///
/// Automatically implemented for all types that implement
/// `Eq + Debug + Send + Sync + 'static`. Equality is required for change
/// pruning: downstream nodes are re-verified against the previous value.
pub trait AnyValue: DynEq + Debug + Send + Sync {
    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Eq + Debug + Send + Sync + 'static> AnyValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An immutable, type-erased result produced by evaluating a key.
///
/// Clone is cheap; the payload is shared behind an `Arc`. Equality compares
/// the underlying values structurally, so two values are equal only when they
/// are the same concrete type with equal contents.
#[derive(Clone)]
pub struct Value(Arc<dyn AnyValue>);

impl Value {
    /// Wrap a concrete value.
    pub fn new<T: Eq + Debug + Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast to the concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }

    /// Returns true if both handles share the same allocation.
    ///
    /// Change pruning and early cutoff reuse the previous allocation, so this
    /// distinguishes "recomputed to an equal value" from "never recomputed".
    pub fn ptr_eq(a: &Value, b: &Value) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_any())
    }
}

impl Eq for Value {}
