//! Error types shared across kiln crates

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::cancel::Cancelled;
use miette::Diagnostic;
use thiserror::Error;

/// Error type for core operations and the [`crate::CacheTier`] contract
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid identifier or malformed input
    #[error("validation error: {message}")]
    #[diagnostic(code(kiln::core::validation))]
    Validation {
        /// Description of what failed validation
        message: String,
    },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(code(kiln::core::serialization))]
    Serialization {
        /// Description of the serialization issue
        message: String,
    },

    /// A cache tier operation failed
    #[error("cache tier {tier} failed during {operation}: {message}")]
    #[diagnostic(
        code(kiln::core::tier),
        help("The tier keeps serving other keys; check connectivity or on-disk state")
    )]
    Tier {
        /// Name of the tier that failed
        tier: String,
        /// Operation that failed (e.g., "has", "put", "restore")
        operation: String,
        /// Description of the failure
        message: String,
    },

    /// Operation was cancelled by the process-wide token
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Error {
    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
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

    /// Create a tier error
    #[must_use]
    pub fn tier(
        tier: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Tier {
            tier: tier.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
