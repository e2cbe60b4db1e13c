//! Engine-level error types.

use thiserror::Error;

/// Errors surfaced by the engine outside of a single step's own failure.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pool could not provide a browser (launch failed or pool closed).
    #[error("browser pool exhausted: {0}")]
    ResourceExhausted(String),

    /// A repair for this step is already in progress elsewhere.
    #[error("step '{step_id}' of workflow '{workflow}' is already being healed")]
    AlreadyHealing { workflow: String, step_id: String },

    /// A workflow update was rejected; the persisted document is untouched.
    #[error("workflow validation failed: {0}")]
    ValidationFailed(String),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("step '{step_id}' not found in workflow '{workflow}'")]
    StepNotFound { workflow: String, step_id: String },

    #[error("invalid workflow name '{0}'")]
    InvalidName(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Returns true if the caller may retry the operation after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exhaustion_is_retryable() {
        assert!(EngineError::ResourceExhausted("launch failed".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::ValidationFailed("dup".into()).is_retryable());
    }

    #[test]
    fn test_already_healing_message() {
        let err = EngineError::AlreadyHealing {
            workflow: "login".into(),
            step_id: "submit".into(),
        };
        assert_eq!(
            err.to_string(),
            "step 'submit' of workflow 'login' is already being healed"
        );
    }
}
