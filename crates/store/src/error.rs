//! Error types for the local store layer

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use std::path::{Path, PathBuf};

use kiln_core::Cancelled;
use miette::Diagnostic;
use thiserror::Error;

/// Errors from the local store layer.
///
/// `NotInCache` is an expected, recoverable condition: restore paths treat
/// it as a miss and fall through to the next tier or the real build
/// action. The remaining variants indicate real faults.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("{message}")]
    #[diagnostic(code(kiln::store::io))]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{key}' is not in the cache")]
    #[diagnostic(code(kiln::store::not_in_cache))]
    NotInCache { key: String },

    #[error("source file not found: {path}")]
    #[diagnostic(
        code(kiln::store::file_not_found),
        help("the build action declared this output but never produced it")
    )]
    FileNotFound { path: PathBuf },

    #[error("cache entry '{key}' is corrupt: {message}")]
    #[diagnostic(
        code(kiln::store::corrupt),
        help("the entry will be treated as a miss; compaction removes it eventually")
    )]
    Corrupt { key: String, message: String },

    #[error("store configuration error: {message}")]
    #[diagnostic(code(kiln::store::configuration))]
    Configuration { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(code(kiln::store::serialization))]
    Serialization { message: String },

    #[error(transparent)]
    #[diagnostic(code(kiln::store::cancelled))]
    Cancelled(#[from] Cancelled),
}

impl Error {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn not_in_cache(key: impl Into<String>) -> Self {
        Self::NotInCache { key: key.into() }
    }

    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether this error means "not present" rather than "broken".
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NotInCache { .. })
    }
}

/// Attach a path to an I/O error.
pub(crate) fn io_at(action: &str, path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let message = format!("failed to {action} {}", path.display());
    move |source| Error::io(message, source)
}

impl From<Error> for kiln_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Cancelled(c) => Self::Cancelled(c),
            other => Self::tier("local", "store", other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
