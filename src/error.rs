//! Error types for Scenecast.

use crate::pipeline::StepId;
use thiserror::Error;

/// Library-level error type for Scenecast operations.
#[derive(Error, Debug)]
pub enum ScenecastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Caption input error: {0}")]
    Captions(String),

    #[error("Step {step} cannot run: output of step {missing} is missing")]
    PrerequisiteMissing { step: StepId, missing: StepId },

    #[error("Step {step} failed after {attempts} attempt(s): {reason}")]
    StepGenerationFailed {
        step: StepId,
        attempts: u32,
        reason: String,
        /// Last raw response from the text generator, kept for diagnosis.
        raw_response: Option<String>,
    },

    #[error("Story model is incomplete: {0}")]
    ModelIncomplete(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Run '{0}' already exists. Use resume to continue it.")]
    RunExists(String),

    #[error("Run '{run_id}' was abandoned at step {step}")]
    RunAbandoned { run_id: String, step: StepId },

    #[error("Invalid task transition for {task_id}: {reason}")]
    InvalidTransition { task_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Generation service error: {0}")]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Failures reported by the external text and media generation services.
///
/// `RateLimited` and `TransientFault` are retryable; `Rejected` and
/// `AccountSuspended` are terminal for the request that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient fault: {0}")]
    TransientFault(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("account suspended: {0}")]
    AccountSuspended(String),
}

impl ServiceError {
    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::RateLimited(_) | ServiceError::TransientFault(_))
    }
}

/// Result type alias for Scenecast operations.
pub type Result<T> = std::result::Result<T, ScenecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ServiceError::RateLimited("429".into()).is_retryable());
        assert!(ServiceError::TransientFault("reset".into()).is_retryable());
        assert!(!ServiceError::Rejected("policy".into()).is_retryable());
        assert!(!ServiceError::AccountSuspended("banned".into()).is_retryable());
    }

    #[test]
    fn test_step_failure_message() {
        let err = ScenecastError::StepGenerationFailed {
            step: StepId::Characters,
            attempts: 3,
            reason: "missing field `name`".to_string(),
            raw_response: Some("{}".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Step 2 (characters) failed after 3 attempt(s): missing field `name`"
        );
    }
}
