//! Invalidation, change pruning, and early cutoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use reef::{
    EvalContext, EvalMode, Evaluator, Function, FunctionKind, Key, KeyData, NodeState, Step, Value,
};

const SOURCE: FunctionKind = FunctionKind::new("source");
const MANIFEST: FunctionKind = FunctionKind::new("manifest");
const MODULE: FunctionKind = FunctionKind::new("module");

#[derive(Default)]
struct Inputs {
    files: RwLock<HashMap<String, String>>,
}

impl Inputs {
    fn set(&self, name: &str, content: &str) {
        self.files
            .write()
            .unwrap()
            .insert(name.to_string(), content.to_string());
    }

    fn get(&self, name: &str) -> Option<String> {
        self.files.read().unwrap().get(name).cloned()
    }
}

struct SourceFn {
    inputs: Arc<Inputs>,
    runs: Arc<AtomicUsize>,
}

impl Function for SourceFn {
    fn compute(&self, key: &KeyData, _ctx: &mut EvalContext<'_>) -> anyhow::Result<Step> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let name: &String = key.downcast().unwrap();
        match self.inputs.get(name) {
            Some(content) => Ok(Step::Done(Value::new(content))),
            None => anyhow::bail!("no such file: {name}"),
        }
    }
}

struct ManifestFn {
    runs: Arc<AtomicUsize>,
}

impl Function for ManifestFn {
    fn compute(&self, key: &KeyData, ctx: &mut EvalContext<'_>) -> anyhow::Result<Step> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let module: &String = key.downcast().unwrap();
        let source = ctx.intern(KeyData::new(SOURCE, format!("{module}.manifest")));
        let Some(listing) = ctx.request(source).ready() else {
            return Ok(Step::NotReady);
        };
        let files: Vec<String> = listing
            .downcast_ref::<String>()
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        Ok(Step::Done(Value::new(files)))
    }
}

struct ModuleFn {
    runs: Arc<AtomicUsize>,
}

impl Function for ModuleFn {
    fn compute(&self, key: &KeyData, ctx: &mut EvalContext<'_>) -> anyhow::Result<Step> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let module: &String = key.downcast().unwrap();
        let manifest = ctx.intern(KeyData::new(MANIFEST, module.clone()));
        let Some(files) = ctx.request(manifest).ready() else {
            return Ok(Step::NotReady);
        };
        let files = files.downcast_ref::<Vec<String>>().unwrap().clone();
        let keys: Vec<Key> = files
            .iter()
            .map(|f| ctx.intern(KeyData::new(SOURCE, f.clone())))
            .collect();
        let mut total = 0usize;
        let mut ready = true;
        for fetched in ctx.request_all(&keys) {
            match fetched.ready() {
                Some(content) => total += content.downcast_ref::<String>().unwrap().len(),
                None => ready = false,
            }
        }
        if !ready {
            return Ok(Step::NotReady);
        }
        Ok(Step::Done(Value::new(format!("{module}:{total}"))))
    }
}

struct Fixture {
    engine: Evaluator,
    inputs: Arc<Inputs>,
    source_runs: Arc<AtomicUsize>,
    manifest_runs: Arc<AtomicUsize>,
    module_runs: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        let inputs = Arc::new(Inputs::default());
        let source_runs = Arc::new(AtomicUsize::new(0));
        let manifest_runs = Arc::new(AtomicUsize::new(0));
        let module_runs = Arc::new(AtomicUsize::new(0));
        let engine = Evaluator::builder()
            .function(
                SOURCE,
                SourceFn {
                    inputs: inputs.clone(),
                    runs: source_runs.clone(),
                },
            )
            .function(
                MANIFEST,
                ManifestFn {
                    runs: manifest_runs.clone(),
                },
            )
            .function(
                MODULE,
                ModuleFn {
                    runs: module_runs.clone(),
                },
            )
            .parallelism(4)
            .build();
        Self {
            engine,
            inputs,
            source_runs,
            manifest_runs,
            module_runs,
        }
    }

    fn with_lib() -> Self {
        let fixture = Self::new();
        fixture.inputs.set("lib.manifest", "a.txt\nb.txt");
        fixture.inputs.set("a.txt", "hello");
        fixture.inputs.set("b.txt", "worlds!");
        fixture
    }

    fn module(&self, name: &str) -> Key {
        self.engine.intern(KeyData::new(MODULE, name.to_string()))
    }

    fn source(&self, name: &str) -> Key {
        self.engine.intern(KeyData::new(SOURCE, name.to_string()))
    }

    fn build(&self, roots: &[Key]) {
        let results = self.engine.evaluate(roots, EvalMode::KeepGoing).unwrap();
        assert!(results.is_success());
    }

    fn counts(&self) -> (usize, usize, usize) {
        (
            self.source_runs.load(Ordering::SeqCst),
            self.manifest_runs.load(Ordering::SeqCst),
            self.module_runs.load(Ordering::SeqCst),
        )
    }
}

// ============================================================================
// Change pruning
// ============================================================================

#[test]
fn test_unchanged_leaf_prunes_dependents() {
    let fixture = Fixture::with_lib();
    let root = fixture.module("lib");
    let leaf = fixture.source("a.txt");
    fixture.build(&[root]);

    let value_before = fixture.engine.value_of(root).unwrap();
    let version_before = fixture.engine.version_of(root).unwrap();
    let (sources, manifests, modules) = fixture.counts();

    // Re-download the same bytes: the leaf must re-run, dependents must not.
    let dirtied = fixture.engine.invalidate(&[leaf]);
    assert_eq!(dirtied, 2); // the leaf and the module

    assert_eq!(fixture.engine.state_of(leaf), Some(NodeState::Changed));
    assert_eq!(fixture.engine.state_of(root), Some(NodeState::Dirty));

    fixture.build(&[root]);

    assert_eq!(fixture.source_runs.load(Ordering::SeqCst), sources + 1);
    assert_eq!(fixture.manifest_runs.load(Ordering::SeqCst), manifests);
    assert_eq!(fixture.module_runs.load(Ordering::SeqCst), modules);

    // The pruned node keeps its value identity and its change version.
    let value_after = fixture.engine.value_of(root).unwrap();
    assert!(Value::ptr_eq(&value_before, &value_after));
    assert_eq!(fixture.engine.version_of(root), Some(version_before));
}

#[test]
fn test_changed_leaf_rebuilds_dependents() {
    let fixture = Fixture::with_lib();
    let root = fixture.module("lib");
    let leaf = fixture.source("a.txt");
    fixture.build(&[root]);

    let version_before = fixture.engine.version_of(root).unwrap();
    let (_, _, modules) = fixture.counts();

    fixture.inputs.set("a.txt", "hello again");
    fixture.engine.invalidate(&[leaf]);
    fixture.build(&[root]);

    assert_eq!(fixture.module_runs.load(Ordering::SeqCst), modules + 1);
    let value = fixture.engine.value_of(root).unwrap();
    assert_eq!(value.downcast_ref::<String>().unwrap(), "lib:18");
    assert!(fixture.engine.version_of(root).unwrap() > version_before);
}

#[test]
fn test_pruning_cascades_through_intermediate_nodes() {
    let fixture = Fixture::with_lib();
    let root = fixture.module("lib");
    let manifest_file = fixture.source("lib.manifest");
    fixture.build(&[root]);

    let (sources, manifests, modules) = fixture.counts();

    // The manifest file re-verifies byte-identical, so neither the manifest
    // parse nor the module digest re-runs.
    fixture.engine.invalidate(&[manifest_file]);
    fixture.build(&[root]);

    assert_eq!(fixture.source_runs.load(Ordering::SeqCst), sources + 1);
    assert_eq!(fixture.manifest_runs.load(Ordering::SeqCst), manifests);
    assert_eq!(fixture.module_runs.load(Ordering::SeqCst), modules);
}

#[test]
fn test_early_cutoff_keeps_leaf_version() {
    let fixture = Fixture::with_lib();
    let root = fixture.module("lib");
    let leaf = fixture.source("a.txt");
    fixture.build(&[root]);

    let leaf_version = fixture.engine.version_of(leaf).unwrap();
    fixture.engine.invalidate(&[leaf]);
    fixture.build(&[root]);

    // The leaf re-ran but produced an equal value, so its version must not
    // advance.
    assert_eq!(fixture.engine.version_of(leaf), Some(leaf_version));
}

#[test]
fn test_rebuild_increments_generation_pruning_does_not() {
    let fixture = Fixture::with_lib();
    let root = fixture.module("lib");
    let leaf = fixture.source("a.txt");
    fixture.build(&[root]);
    assert_eq!(fixture.engine.generation_of(leaf), Some(1));
    assert_eq!(fixture.engine.generation_of(root), Some(1));

    fixture.engine.invalidate(&[leaf]);
    fixture.build(&[root]);

    assert_eq!(fixture.engine.generation_of(leaf), Some(2));
    assert_eq!(fixture.engine.generation_of(root), Some(1));
}

// ============================================================================
// Propagation exactness
// ============================================================================

#[test]
fn test_independent_subgraph_untouched() {
    let fixture = Fixture::new();
    fixture.inputs.set("lib.manifest", "a.txt");
    fixture.inputs.set("a.txt", "aaa");
    fixture.inputs.set("app.manifest", "b.txt");
    fixture.inputs.set("b.txt", "bbb");

    let lib = fixture.module("lib");
    let app = fixture.module("app");
    fixture.build(&[lib, app]);

    let dirtied = fixture.engine.invalidate(&[fixture.source("a.txt")]);
    assert_eq!(dirtied, 2);

    // Everything under `app` stays settled.
    assert_eq!(fixture.engine.state_of(app), Some(NodeState::Done));
    assert_eq!(
        fixture.engine.state_of(fixture.source("b.txt")),
        Some(NodeState::Done)
    );

    let (sources, _, _) = fixture.counts();
    fixture.build(&[lib, app]);
    // Only the invalidated source re-ran.
    assert_eq!(fixture.source_runs.load(Ordering::SeqCst), sources + 1);
}

#[test]
fn test_manifest_change_rediscovers_deps() {
    let fixture = Fixture::with_lib();
    let root = fixture.module("lib");
    fixture.build(&[root]);
    assert_eq!(fixture.engine.deps_of(root).unwrap().len(), 3);

    // Drop b.txt from the manifest; the module must lose that edge.
    fixture.inputs.set("lib.manifest", "a.txt");
    fixture.engine.invalidate(&[fixture.source("lib.manifest")]);
    fixture.build(&[root]);

    let deps = fixture.engine.deps_of(root).unwrap();
    assert_eq!(deps.len(), 2);
    assert!(!deps.contains(&fixture.source("b.txt")));
    // The stale reverse edge is gone too.
    assert!(!fixture
        .engine
        .rdeps_of(fixture.source("b.txt"))
        .unwrap()
        .contains(&root));
    assert_eq!(
        fixture
            .engine
            .value_of(root)
            .unwrap()
            .downcast_ref::<String>()
            .unwrap(),
        "lib:5"
    );
}

#[test]
fn test_invalidate_unknown_key_is_noop() {
    let fixture = Fixture::with_lib();
    let ghost = fixture.source("ghost.txt");
    assert_eq!(fixture.engine.invalidate(&[ghost]), 0);
}

// ============================================================================
// Eviction
// ============================================================================

#[test]
fn test_evict_only_unused_nodes() {
    let fixture = Fixture::with_lib();
    let root = fixture.module("lib");
    let leaf = fixture.source("a.txt");
    fixture.build(&[root]);

    // The leaf has a dependent, so it must stay.
    assert!(!fixture.engine.evict_if_unused(leaf));
    // The root has none.
    assert!(fixture.engine.evict_if_unused(root));
    assert!(fixture.engine.state_of(root).is_none());
    // With the root gone the leaf is unused.
    assert!(fixture.engine.evict_if_unused(leaf));

    // A later round rebuilds evicted nodes from scratch.
    let (sources, _, modules) = fixture.counts();
    fixture.build(&[root]);
    assert!(fixture.source_runs.load(Ordering::SeqCst) > sources);
    assert!(fixture.module_runs.load(Ordering::SeqCst) > modules);
}
