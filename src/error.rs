// Structured error types for plan loading and orchestration runs

use thiserror::Error;

/// A plan document that cannot be executed as written.
///
/// Surfaced at load time; the store never coerces a malformed plan into shape.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to read plan {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse plan {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Step at position {0} has an empty id")]
    EmptyStepId(usize),

    #[error("Duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("Step '{step}' depends on non-existent step '{dependency}'")]
    DanglingDependency { step: String, dependency: String },

    #[error("Step '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Step '{step}' lists dependency '{dependency}' more than once")]
    DuplicateDependency { step: String, dependency: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
}

/// Structural failures that abort an orchestration run.
///
/// Worker-level failures never surface here; they are folded into plan state
/// as blocked steps.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Execution lock is held: {0}")]
    LockContention(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Plan store error: {0}")]
    Store(String),

    #[error("Isolation error: {0}")]
    Isolation(String),

    #[error("Repository has uncommitted changes ({0}); commit or stash them before running")]
    DirtyWorkTree(String),
}

impl RunError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = PlanError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_plan_error_converts_into_run_error() {
        let err: RunError = PlanError::SelfDependency("3".into()).into();
        assert_eq!(err.to_string(), "Step '3' cannot depend on itself");
        assert_eq!(err.exit_code(), 1);
    }
}
