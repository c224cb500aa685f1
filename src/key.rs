//! Canonical computation identifiers and the process-wide interner.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;
use parking_lot::RwLock;
use slab::Slab;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Compare self with another value for equality.
    ///
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types that can serve as key arguments.
///
/// Automatically implemented for all types that implement
/// `Hash + Eq + Debug + Send + Sync + 'static`. The trait is object-safe so
/// that an `Arc<dyn KeyPart>` can be hashed and compared structurally.
pub trait KeyPart: DynHash + DynEq + Debug + Send + Sync {
    /// Get the argument as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> KeyPart for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// Enable Hash for dyn KeyPart using the dyn-hash crate
dyn_hash::hash_trait_object!(KeyPart);

/// Tag selecting the function that knows how to evaluate a key.
///
/// Kinds are compared by name; use one `const` per function so every key of
/// that function carries the same tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKind(&'static str);

impl FunctionKind {
    /// Create a new kind tag.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Get the kind's name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The structural form of a key: a function kind plus its argument.
///
/// Two `KeyData` are equal when their kinds match and their arguments are the
/// same concrete type with equal value. Interning (see [`Interner`]) maps each
/// distinct `KeyData` to one canonical [`Key`] handle.
#[derive(Clone)]
pub struct KeyData {
    kind: FunctionKind,
    arg: Arc<dyn KeyPart>,
}

impl KeyData {
    /// Create key data from a kind tag and an argument value.
    pub fn new<A: KeyPart + 'static>(kind: FunctionKind, arg: A) -> Self {
        Self {
            kind,
            arg: Arc::new(arg),
        }
    }

    /// The function kind this key is evaluated by.
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// Downcast the argument to its original type.
    pub fn downcast<A: 'static>(&self) -> Option<&A> {
        self.arg.as_any().downcast_ref()
    }

    /// Get the display representation of this key, `kind(arg)`.
    pub fn debug_repr(&self) -> String {
        format!("{}({:?})", self.kind.0, self.arg)
    }
}

impl Debug for KeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.kind.0, self.arg)
    }
}

impl Hash for KeyData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.arg.hash(state);
    }
}

impl PartialEq for KeyData {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.arg.dyn_eq(other.arg.as_any())
    }
}

impl Eq for KeyData {}

/// Interned key handle.
///
/// Handles are cheap to copy and compare; two structurally-equal keys interned
/// through the same [`Interner`] always yield the same handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(u32);

impl Key {
    /// The arena index backing this handle.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

#[derive(Default)]
struct InternerInner {
    table: HashMap<KeyData, Key, ahash::RandomState>,
    arena: Slab<KeyData>,
}

/// Canonicalizes keys so structurally-equal keys share one handle.
///
/// The canonical table only grows during a run; handles stay valid for the
/// lifetime of the interner. All operations take only a momentary lock on the
/// backing table.
#[derive(Default)]
pub struct Interner {
    inner: RwLock<InternerInner>,
}

impl Interner {
    /// Create a new empty interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern key data, returning the canonical handle.
    ///
    /// Returns the existing handle if an equal key was interned before,
    /// otherwise stores the candidate and returns a fresh handle.
    pub fn intern(&self, data: KeyData) -> Key {
        if let Some(key) = self.inner.read().table.get(&data) {
            return *key;
        }
        let mut inner = self.inner.write();
        if let Some(key) = inner.table.get(&data) {
            return *key;
        }
        let index = inner.arena.insert(data.clone());
        let key = Key(index as u32);
        inner.table.insert(data, key);
        key
    }

    /// Look up the handle for key data without interning it.
    pub fn get(&self, data: &KeyData) -> Option<Key> {
        self.inner.read().table.get(data).copied()
    }

    /// Resolve a handle back to its key data.
    ///
    /// # Panics
    ///
    /// Panics if the handle was not produced by this interner.
    pub fn resolve(&self, key: Key) -> KeyData {
        self.inner.read().arena[key.index()].clone()
    }

    /// Display representation of an interned key.
    pub fn debug_repr(&self, key: Key) -> String {
        self.resolve(key).debug_repr()
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.inner.read().arena.len()
    }

    /// Returns true if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: FunctionKind = FunctionKind::new("module");
    const FILE: FunctionKind = FunctionKind::new("file");

    #[test]
    fn test_intern_is_idempotent() {
        let interner = Interner::new();
        let a = interner.intern(KeyData::new(MODULE, ("lib".to_string(), 1u32)));
        let b = interner.intern(KeyData::new(MODULE, ("lib".to_string(), 1u32)));
        assert_eq!(a, b);
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_distinct_args_get_distinct_handles() {
        let interner = Interner::new();
        let a = interner.intern(KeyData::new(MODULE, ("lib".to_string(), 1u32)));
        let b = interner.intern(KeyData::new(MODULE, ("lib".to_string(), 2u32)));
        assert_ne!(a, b);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_kind_distinguishes_keys() {
        let interner = Interner::new();
        let a = interner.intern(KeyData::new(MODULE, "lib".to_string()));
        let b = interner.intern(KeyData::new(FILE, "lib".to_string()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_arg_type_distinguishes_keys() {
        let interner = Interner::new();
        let a = interner.intern(KeyData::new(FILE, 1u32));
        let b = interner.intern(KeyData::new(FILE, 1i32));
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolve_round_trips() {
        let interner = Interner::new();
        let data = KeyData::new(FILE, "lib/a.cfg".to_string());
        let key = interner.intern(data.clone());
        let resolved = interner.resolve(key);
        assert_eq!(resolved, data);
        assert_eq!(resolved.downcast::<String>().unwrap(), "lib/a.cfg");
        assert_eq!(resolved.debug_repr(), "file(\"lib/a.cfg\")");
    }

    #[test]
    fn test_get_does_not_intern() {
        let interner = Interner::new();
        let data = KeyData::new(FILE, "a".to_string());
        assert!(interner.get(&data).is_none());
        let key = interner.intern(data.clone());
        assert_eq!(interner.get(&data), Some(key));
    }
}
