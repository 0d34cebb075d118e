use thiserror::Error;

use crate::diagnostics::{render, Diagnostic};

/// Errors raised while opening or driving an evaluation session.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("module {0} has been disposed")]
    ModuleDisposed(String),

    #[error("module {0} is already disposed")]
    AlreadyDisposed(String),

    #[error("evaluation cancelled after {fired} rule firing(s)")]
    Cancelled { fired: usize },

    #[error("firing limit of {limit} activations exceeded; rules may be looping")]
    FiringLimitExceeded { limit: usize },

    #[error("rule \"{rule}\" failed: {message}")]
    Action { rule: String, message: String },
}

/// A build that produced error diagnostics. Warnings are kept so callers can
/// report both.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("rule compilation failed with {} error(s)", .errors.len())]
pub struct CompilationError {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl CompilationError {
    /// Multi-line listing of every error.
    pub fn report(&self) -> String {
        render("Rule compilation errors:", &self.errors)
    }

    /// Paths of the sources that produced at least one error.
    pub fn failing_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.errors.iter().map(|d| d.path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        paths
    }
}
