//! Blob compression codecs
//!
//! A codec is applied when a blob enters a store: the stored bytes (and the
//! content hash) are the encoded form. Restores decode back to the original
//! file contents. `Codec::None` blobs can be materialized by hardlink;
//! encoded blobs always go through a decoding copy.

use serde::{Deserialize, Serialize};

/// Compression applied to a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Store the raw bytes
    #[default]
    None,
    /// Zstandard compression
    Zstd,
}

impl Codec {
    /// Short name used in logs and manifests
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Codec::Zstd).unwrap(), "\"zstd\"");
        assert_eq!(
            serde_json::from_str::<Codec>("\"none\"").unwrap(),
            Codec::None
        );
    }
}
