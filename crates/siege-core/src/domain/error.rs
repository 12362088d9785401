//! Domain-level error taxonomy for Tower Siege.

use siege_state::StorageError;

use crate::reasoning::ProviderError;
use crate::sandbox::SandboxError;

/// Tower Siege domain errors.
#[derive(Debug, thiserror::Error)]
pub enum SiegeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for SiegeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunNotFound { run_id } => SiegeError::RunNotFound(run_id),
            other => SiegeError::Storage(other),
        }
    }
}

/// Result type for Tower Siege domain operations.
pub type Result<T> = std::result::Result<T, SiegeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_not_found_is_lifted_from_storage() {
        let err: SiegeError = StorageError::RunNotFound {
            run_id: "r-1".to_string(),
        }
        .into();
        assert!(matches!(err, SiegeError::RunNotFound(ref id) if id == "r-1"));
    }

    #[test]
    fn test_other_storage_errors_stay_wrapped() {
        let err: SiegeError = StorageError::Backend("connection reset".to_string()).into();
        assert!(matches!(err, SiegeError::Storage(_)));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_invalid_input_display() {
        let err = SiegeError::InvalidInput("agents must not be empty".to_string());
        assert!(err.to_string().contains("invalid input"));
    }
}
