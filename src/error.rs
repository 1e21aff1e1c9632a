//! Error types for index merge operations
//!
//! Every fallible operation in the crate returns [`IvfError`]. Structured variants
//! carry the fields a caller needs to react programmatically (which parameter
//! mismatched, which list was out of range), while the string variants carry
//! human-readable context accumulated through [`IvfError::with_file_context`].

use thiserror::Error;

/// Main error type for all index and merge operations
#[derive(Debug, Error)]
pub enum IvfError {
    /// IO operations failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Two structures that must agree on a parameter do not
    #[error("Configuration mismatch: {field} differs (expected {expected}, got {actual})")]
    ConfigurationMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// Operation requires a trained quantizer
    #[error("Index not trained: {operation} requires a trained index")]
    NotTrained { operation: String },

    /// Vector dimension mismatch
    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// Input validation failed
    #[error("Invalid input: {field} - {reason}. {suggestion}")]
    InvalidInput {
        field: String,
        reason: String,
        suggestion: String,
    },

    /// Inverted list number outside `[0, nlist)`
    #[error("List {list_no} out of range (nlist: {nlist})")]
    ListOutOfRange { list_no: usize, nlist: usize },

    /// Entry offset outside the current length of a list
    #[error("Entry {offset} out of bounds for list {list_no} (current length: {len})")]
    EntryOutOfRange { list_no: usize, offset: usize, len: usize },

    /// Mutation attempted on a store opened read-only
    #[error("Read-only store: {0}")]
    ReadOnly(String),

    /// Operation not available for this kind of shard or store
    #[error("Unsupported operation: {operation} - {reason}")]
    Unsupported { operation: String, reason: String },

    /// On-disk data corruption detected
    #[error("Index corruption detected: {0}")]
    Corruption(String),

    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Memory mapping operations failed
    #[error("Memory mapping error: {0}")]
    MemoryMapping(String),
}

impl IvfError {
    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a configuration mismatch error from any two displayable values
    pub fn configuration_mismatch(
        field: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ConfigurationMismatch {
            field: field.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a not-trained error naming the rejected operation
    pub fn not_trained(operation: impl Into<String>) -> Self {
        Self::NotTrained {
            operation: operation.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a detailed config error
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Config(format!("{} - {}: {}", field.into(), reason.into(), suggestion.into()))
    }

    /// Check if this error represents a recoverable condition
    ///
    /// Validation failures leave every structure untouched, so the caller can fix
    /// the input and try again. Corruption and mapping failures are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConfigurationMismatch { .. }
                | Self::NotTrained { .. }
                | Self::InvalidDimension { .. }
                | Self::InvalidInput { .. }
        )
    }

    /// Add file context to an error, preserving the original error information
    pub fn with_file_context(self, file_path: impl AsRef<std::path::Path>, operation: &str) -> Self {
        let context = format!("{} (file: {})", operation, file_path.as_ref().display());

        match self {
            Self::Io(ref err) => Self::Io(std::io::Error::new(err.kind(), format!("{}: {}", context, err))),
            Self::Config(ref msg) => Self::Config(format!("{}: {}", context, msg)),
            Self::MemoryMapping(ref msg) => Self::MemoryMapping(format!("{}: {}", context, msg)),
            Self::Corruption(ref msg) => Self::Corruption(format!("{}: {}", context, msg)),
            Self::ReadOnly(ref msg) => Self::ReadOnly(format!("{}: {}", context, msg)),
            _ => self,
        }
    }
}
