//! Error types for reasoning providers.

/// Errors from a single reasoning step.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("no credentials for {provider}: set {env_var}")]
    MissingCredentials { provider: String, env_var: String },

    #[error("no provider configured for {0}")]
    UnsupportedProvider(String),
}

/// Result type for reasoning provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
