//! Output manifests: the uid-to-files metadata record
//!
//! A manifest maps each relative output path of a build task to the blob
//! holding its bytes, plus the size, permission bits, and codec needed to
//! materialize it. Manifests are the JSON payload published to the uid
//! store of every cache tier, and publishing one is what makes a uid
//! visible for restore.

use crate::codec::Codec;
use crate::id::ContentHash;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One output file inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content hash of the stored (possibly encoded) bytes
    pub hash: ContentHash,
    /// Size of the stored bytes
    pub size: u64,
    /// Unix permission bits of the original file
    pub mode: u32,
    /// Codec the stored bytes were encoded with
    #[serde(default)]
    pub codec: Codec,
}

impl FileEntry {
    /// Whether the original file had any execute bit set
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Relative-path to blob mapping for one uid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputManifest {
    files: BTreeMap<String, FileEntry>,
}

impl OutputManifest {
    /// Create an empty manifest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file entry under a relative path
    pub fn insert(&mut self, path: impl Into<String>, entry: FileEntry) {
        self.files.insert(path.into(), entry);
    }

    /// Look up an entry by relative path
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Iterate entries in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(p, e)| (p.as_str(), e))
    }

    /// Iterate the referenced blob hashes (with duplicates)
    pub fn hashes(&self) -> impl Iterator<Item = &ContentHash> {
        self.files.values().map(|e| &e.hash)
    }

    /// Number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the manifest has no files
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of stored sizes across all entries
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }

    /// Serialize to the JSON wire form
    ///
    /// # Errors
    ///
    /// Returns a serialization error if JSON encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Parse from the JSON wire form
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::serialization(e.to_string()))
    }
}

impl<'a> IntoIterator for &'a OutputManifest {
    type Item = (&'a String, &'a FileEntry);
    type IntoIter = std::collections::btree_map::Iter<'a, String, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}
