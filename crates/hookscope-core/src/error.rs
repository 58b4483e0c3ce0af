//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Required field missing or empty
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn parse(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseError {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
