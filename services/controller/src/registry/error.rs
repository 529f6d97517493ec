use std::time::Duration;

use thiserror::Error;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry {registry} returned {status}: {message}")]
    Status {
        registry: String,
        status: u16,
        message: String,
    },

    #[error("rate limited by {registry}")]
    RateLimited {
        registry: String,
        retry_after: Option<Duration>,
    },

    #[error("registry {registry} {}", auth_failure(.credentials_supplied))]
    Unauthorized {
        registry: String,
        credentials_supplied: bool,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid registry configuration: {0}")]
    Config(String),
}

fn auth_failure(credentials_supplied: &bool) -> &'static str {
    if *credentials_supplied {
        "rejected the configured credentials"
    } else {
        "requires credentials and none are configured"
    }
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }

    /// Returns true if retrying the same call may succeed without any
    /// configuration change.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Http(_) | RegistryError::RateLimited { .. } | RegistryError::Timeout(_) => true,
            RegistryError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
