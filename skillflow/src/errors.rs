//! Error types for the skillflow engine.
//!
//! The taxonomy separates truly fatal conditions (validation failures,
//! dependency cycles, budget exhaustion, cancellation) from ordinary
//! operational failures, which stay inside [`crate::agent::TaskOutcome`]
//! and never cross the public API as errors.

use std::time::Duration;
use thiserror::Error;

/// The main error type for skillflow operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A dependency cycle was detected in the workflow graph.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// The workflow definition failed structural validation.
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// One or more required tool groups are not available.
    #[error("required tools unavailable: {}", missing.join(", "))]
    ToolsUnavailable {
        /// The missing tool-group names.
        missing: Vec<String>,
    },

    /// A budget reservation or check failed.
    #[error(
        "budget exceeded: spent ${spent:.4} + reserved ${reserved:.4} + requested ${requested:.4} > budget ${budget:.4}"
    )]
    BudgetExceeded {
        /// Amount already spent.
        spent: f64,
        /// Amount currently reserved.
        reserved: f64,
        /// Amount that was being requested.
        requested: f64,
        /// The budget ceiling.
        budget: f64,
    },

    /// The run was cancelled via the abort signal.
    #[error("run cancelled: {0}")]
    Cancelled(String),

    /// A model invocation failed. The message text is used for
    /// retry classification.
    #[error("model call failed: {0}")]
    Model(String),

    /// A tool invocation failed.
    #[error("tool '{name}' failed: {reason}")]
    Tool {
        /// The tool name.
        name: String,
        /// The failure reason.
        reason: String,
    },

    /// A single call attempt exceeded its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns true for conditions that halt an entire run rather than
    /// a single stage branch.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BudgetExceeded { .. } | Self::Cancelled(_) | Self::ToolsUnavailable { .. }
        )
    }
}

/// Error raised when a cycle is detected in the workflow graph.
///
/// The path always starts and ends at the same stage name, e.g.
/// `a -> b -> a`.
#[derive(Debug, Clone, Error)]
#[error("dependency cycle detected: {}", path.join(" -> "))]
pub struct CycleError {
    /// The stages forming the cycle, first and last entries equal.
    pub path: Vec<String>,
}

impl CycleError {
    /// Creates a new cycle error from the reconstructed path.
    #[must_use]
    pub fn new(path: Vec<String>) -> Self {
        Self { path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_display() {
        let err = CycleError::new(vec!["a".to_string(), "b".to_string(), "a".to_string()]);
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::Cancelled("user".into()).is_fatal());
        assert!(EngineError::BudgetExceeded {
            spent: 1.0,
            reserved: 0.0,
            requested: 0.5,
            budget: 1.2
        }
        .is_fatal());
        assert!(!EngineError::Model("429 rate limited".into()).is_fatal());
        assert!(!EngineError::Timeout(Duration::from_secs(30)).is_fatal());
    }

    #[test]
    fn test_tools_unavailable_names_tools() {
        let err = EngineError::ToolsUnavailable {
            missing: vec!["market_data".to_string(), "filings".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("market_data"));
        assert!(msg.contains("filings"));
    }
}
