//! Common error types for rendezvous bus components.

use thiserror::Error;

/// Validation failures for names and signatures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Name is empty
    #[error("Name is empty")]
    Empty,

    /// Name exceeds the maximum length
    #[error("Name exceeds {max} bytes: {len}")]
    TooLong {
        /// Observed length in bytes
        len: usize,
        /// Maximum permitted length
        max: usize,
    },

    /// Name has too few dot-separated elements
    #[error("Name must have at least two elements: {0}")]
    TooFewElements(String),

    /// Name contains an empty element or a character outside the allowed class
    #[error("Name has an invalid element: {0}")]
    InvalidElement(String),

    /// Signature is malformed
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

/// Result type alias using `ValidationError`
pub type Result<T> = std::result::Result<T, ValidationError>;
