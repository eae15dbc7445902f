//! Validation errors shared across Tidelog crates.

use snafu::Snafu;

/// Errors produced when validating request or keyspace values.
// Snafu generates fields for context selectors
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    /// Journal name failed validation.
    #[snafu(display("Invalid journal name {name:?}: {reason}"))]
    InvalidJournal { name: String, reason: &'static str },

    /// Broker identity failed validation.
    #[snafu(display("Invalid broker id ({zone:?}, {suffix:?}): {reason}"))]
    InvalidBrokerId { zone: String, suffix: String, reason: &'static str },

    /// Endpoint URL failed validation.
    #[snafu(display("Invalid endpoint {url:?}: {reason}"))]
    InvalidEndpoint { url: String, reason: &'static str },

    /// Request field is out of range.
    #[snafu(display("Invalid {field}: {reason}"))]
    InvalidField { field: &'static str, reason: &'static str },
}

/// Result type for validation operations.
pub type Result<T> = std::result::Result<T, ValidationError>;
