//! Error types for reference parsing.

use thiserror::Error;

/// Errors that can occur when parsing an image reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The reference string is empty.
    #[error("image reference cannot be empty")]
    Empty,

    /// The reference contains whitespace or control characters.
    #[error("image reference '{0}' contains whitespace")]
    Whitespace(String),

    /// The repository path is malformed.
    #[error("invalid repository in '{reference}': {reason}")]
    InvalidRepository { reference: String, reason: String },

    /// The tag is malformed.
    #[error("invalid tag '{tag}' in '{reference}'")]
    InvalidTag { reference: String, tag: String },

    /// The digest is malformed.
    #[error("invalid digest '{digest}' in '{reference}'")]
    InvalidDigest { reference: String, digest: String },
}
