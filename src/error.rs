//! Error types for graph evaluation.

use std::sync::Arc;

use thiserror::Error;

/// Terminal failure recorded on a node or surfaced for a whole round.
///
/// `FunctionFailure` and `DependencyFailure` are data: in keep-going mode they
/// are stored on nodes and returned per root. `Cycle` is reported to the
/// caller and never retried automatically. `Cancelled` and `Inconsistency`
/// abort the round in either mode.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// The node's own function reported a failure.
    ///
    /// The payload is an [`anyhow::Error`], so hosts can downcast to their
    /// domain error types via [`EvalError::failure_reason`].
    #[error("{key}: {reason}")]
    FunctionFailure {
        /// Display form of the failing key.
        key: String,
        /// The failure reported by the function.
        reason: Arc<anyhow::Error>,
    },

    /// The node failed because one of its dependencies failed.
    ///
    /// `cause` chains down to the originating [`EvalError::FunctionFailure`],
    /// so the `Display` output reads root-to-origin.
    #[error("{key}: {cause}")]
    DependencyFailure {
        /// Display form of the failing key.
        key: String,
        /// The dependency-side failure.
        cause: Box<EvalError>,
    },

    /// A dynamic dependency cycle was discovered.
    ///
    /// `path` lists the keys along the cycle in request order; the first and
    /// last entries are the same key.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Display forms of the keys forming the cycle.
        path: Vec<String>,
    },

    /// The evaluation round was cancelled before this node settled.
    #[error("evaluation cancelled")]
    Cancelled,

    /// An engine invariant was violated.
    ///
    /// This is a defect report, not a build error; it always aborts the
    /// round.
    #[error("internal inconsistency: {0}")]
    Inconsistency(String),
}

impl EvalError {
    /// Walk the `DependencyFailure` chain down to the originating error.
    pub fn root_cause(&self) -> &EvalError {
        let mut current = self;
        while let EvalError::DependencyFailure { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// Returns the originating function failure, if this error bottoms out in
    /// one.
    pub fn failure_reason(&self) -> Option<&Arc<anyhow::Error>> {
        match self.root_cause() {
            EvalError::FunctionFailure { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Returns true if this error (or its root cause) is a cycle report.
    pub fn is_cycle(&self) -> bool {
        matches!(self.root_cause(), EvalError::Cycle { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_chains_to_origin() {
        let origin = EvalError::FunctionFailure {
            key: "file(lib/a.cfg)".to_string(),
            reason: Arc::new(anyhow::anyhow!("missing file")),
        };
        let chained = EvalError::DependencyFailure {
            key: "module(lib)".to_string(),
            cause: Box::new(origin),
        };

        let rendered = chained.to_string();
        assert!(rendered.starts_with("module(lib): "));
        assert!(rendered.contains("file(lib/a.cfg)"));
        assert!(rendered.ends_with("missing file"));
    }

    #[test]
    fn test_root_cause_unwraps_chain() {
        let origin = EvalError::FunctionFailure {
            key: "leaf".to_string(),
            reason: Arc::new(anyhow::anyhow!("boom")),
        };
        let mid = EvalError::DependencyFailure {
            key: "mid".to_string(),
            cause: Box::new(origin),
        };
        let top = EvalError::DependencyFailure {
            key: "top".to_string(),
            cause: Box::new(mid),
        };

        assert!(matches!(
            top.root_cause(),
            EvalError::FunctionFailure { key, .. } if key == "leaf"
        ));
        assert_eq!(top.failure_reason().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_cycle_display_lists_path() {
        let err = EvalError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert!(err.is_cycle());
    }
}
