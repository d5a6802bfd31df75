//! Error types for data parsing in blescale-types.

use thiserror::Error;

/// Errors that can occur when parsing scale data.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in blescale-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Failed to parse data due to insufficient bytes.
    #[error("Insufficient bytes: expected at least {expected}, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// A field decoded to a value outside its valid range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A weight unit string could not be recognized.
    #[error("Unknown weight unit '{0}' (expected kg, lb, jin or st)")]
    UnknownUnit(String),
}

/// Result type alias using blescale-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
