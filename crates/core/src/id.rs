//! Stable identifiers: opaque task uids and content-addressed blob hashes
//!
//! A [`Uid`] names a task's output set and is chosen by the build layer; a
//! [`ContentHash`] names an immutable blob and is derived from the bytes
//! themselves. The two are independent: many uids may reference the same
//! blob, and a uid never changes when its blob contents do.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque stable identifier for a cacheable build task's output set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Create a uid from a raw key
    ///
    /// Uids become file names inside the hex-bucketed uid store, so the key
    /// must be at least two characters of `[A-Za-z0-9._-]` with no path
    /// separators.
    ///
    /// # Errors
    ///
    /// Returns a validation error for keys that cannot be used as store
    /// file names.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let s = raw.into();
        if s.len() < 2 {
            return Err(Error::validation(format!(
                "uid must be at least 2 characters, got {:?}",
                s
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::validation(format!(
                "uid {:?} contains characters outside [A-Za-z0-9._-]",
                s
            )));
        }
        // "." and ".." are valid per the character set but unusable as
        // store file names.
        if s.chars().all(|c| c == '.') {
            return Err(Error::validation(format!(
                "uid {:?} is not a usable file name",
                s
            )));
        }
        Ok(Self(s))
    }

    /// Get the raw key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A blob identifier (SHA-256 hash as lowercase hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the hash of a byte slice
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hex::encode(hash))
    }

    /// Wrap a finalized SHA-256 digest
    #[must_use]
    pub fn from_digest(digest: Sha256) -> Self {
        Self(hex::encode(digest.finalize()))
    }

    /// Create from a hex string (validated)
    ///
    /// # Errors
    ///
    /// Returns a validation error if the string is not 64 hex characters.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != 64 {
            return Err(Error::validation(format!(
                "content hash must be 64 hex characters, got {}",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::validation(
                "content hash must contain only hex digits",
            ));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Get the hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
