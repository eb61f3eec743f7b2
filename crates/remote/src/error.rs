//! Error types for the remote cache tiers

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use kiln_core::Cancelled;
use miette::Diagnostic;
use thiserror::Error;

/// Error type for remote tier operations
#[derive(Error, Debug, Diagnostic)]
pub enum RemoteError {
    /// Could not reach the remote endpoint
    #[error("connection to {endpoint} failed: {message}")]
    #[diagnostic(
        code(kiln::remote::connection_failed),
        help("Check the endpoint URL and network reachability")
    )]
    ConnectionFailed {
        /// Endpoint that could not be reached
        endpoint: String,
        /// Transport-level failure description
        message: String,
    },

    /// The request exceeded the configured timeout
    #[error("{operation} timed out after {seconds}s")]
    #[diagnostic(code(kiln::remote::timeout))]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured per-request timeout
        seconds: u64,
    },

    /// The store answered with a non-success HTTP status
    #[error("{operation} returned HTTP status {status}")]
    #[diagnostic(code(kiln::remote::status))]
    Status {
        /// Operation that failed
        operation: String,
        /// HTTP status code
        status: u16,
    },

    /// The store rejected the configured credentials
    #[error("authentication rejected: {message}")]
    #[diagnostic(
        code(kiln::remote::auth),
        help("Check the configured bearer token or API key")
    )]
    Auth {
        /// Rejection description
        message: String,
    },

    /// A key the operation needs is absent from the remote store
    #[error("{key} not found in remote store")]
    #[diagnostic(code(kiln::remote::not_found))]
    NotFound {
        /// The absent uid or hash
        key: String,
    },

    /// The remote returned metadata that does not parse
    #[error("malformed metadata for {key}: {message}")]
    #[diagnostic(code(kiln::remote::invalid_metadata))]
    InvalidMetadata {
        /// Uid or hash whose metadata is broken
        key: String,
        /// Parse failure description
        message: String,
    },

    /// Local I/O error while staging or materializing files
    #[error("I/O error: {message}")]
    #[diagnostic(code(kiln::remote::io))]
    Io {
        /// What was being done
        message: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The tier configuration is unusable
    #[error("remote configuration error: {message}")]
    #[diagnostic(code(kiln::remote::configuration))]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(code(kiln::remote::serialization))]
    Serialization {
        /// Description of the serialization issue
        message: String,
    },

    /// Every retry attempt failed
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    #[diagnostic(
        code(kiln::remote::retry_exhausted),
        help("The tier is disabled for the remainder of the run")
    )]
    RetryExhausted {
        /// Operation that kept failing
        operation: String,
        /// Number of attempts made
        attempts: usize,
        /// Message of the final failure
        last_error: String,
    },

    /// Operation was cancelled by the process-wide token
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cancelled(#[from] Cancelled),
}

impl RemoteError {
    /// Create a connection failure error
    #[must_use]
    pub fn connection_failed(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create an HTTP status error
    #[must_use]
    pub fn status(operation: impl Into<String>, status: u16) -> Self {
        Self::Status {
            operation: operation.into(),
            status,
        }
    }

    /// Create an authentication error
    #[must_use]
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth {
            message: msg.into(),
        }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a malformed-metadata error
    #[must_use]
    pub fn invalid_metadata(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an I/O error with context
    #[must_use]
    pub fn io(msg: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: msg.into(),
            source,
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a retry-exhaustion error
    #[must_use]
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: usize,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Classify a reqwest transport error
    ///
    /// Status-code handling happens on the response path; this only sees
    /// errors raised before a response arrived (or while reading its body).
    #[must_use]
    pub fn from_reqwest(
        operation: &str,
        endpoint: &str,
        timeout_secs: u64,
        err: &reqwest::Error,
    ) -> Self {
        if err.is_timeout() {
            return Self::timeout(operation, timeout_secs);
        }
        if let Some(status) = err.status() {
            return Self::status(operation, status.as_u16());
        }
        Self::connection_failed(endpoint, err.to_string())
    }
}

/// Result type for remote tier operations
pub type Result<T> = std::result::Result<T, RemoteError>;
