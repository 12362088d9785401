//! Error types for the sandbox layer.

/// Errors produced while provisioning, driving, or tearing down sandboxes.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),

    #[error("command execution failed in sandbox {sandbox_id}: {reason}")]
    Exec { sandbox_id: String, reason: String },

    #[error("overlay network error: {0}")]
    Network(String),

    #[error("timed out after {elapsed_ms}ms: {what}")]
    Timeout { what: String, elapsed_ms: u64 },

    #[error("no sandbox registered for {0}")]
    NotFound(String),

    #[error("failed to destroy sandbox {sandbox_id}: {reason}")]
    Destroy { sandbox_id: String, reason: String },
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
