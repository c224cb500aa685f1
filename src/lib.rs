#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod context;
mod driver;
mod error;
mod graph;
mod invalidation;
mod key;
mod node;
mod observer;
mod registry;
mod value;

pub use context::{EvalContext, Fetched};
pub use driver::{CancelToken, EvalMode, EvalResults, Evaluator, EvaluatorBuilder};
pub use error::EvalError;
pub use key::{DynEq, FunctionKind, Interner, Key, KeyData, KeyPart};
pub use node::{DepEdge, NodeState};
pub use observer::{EvalObserver, NoopObserver, SettleOutcome};
pub use registry::{Function, FunctionRegistry, Step};
pub use value::{AnyValue, Value};
