//! Local store configuration

use std::path::{Path, PathBuf};

use kiln_core::Codec;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the local cache tier.
///
/// All fields have serde defaults, so an empty config section opens a
/// writable store under the platform cache directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Explicit store root. Overrides `KILN_CACHE_DIR` and the platform
    /// cache directory.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Codec applied to blobs on put.
    #[serde(default)]
    pub codec: Codec,

    /// Read-only mode: puts, recency updates, and eviction are skipped.
    #[serde(default)]
    pub readonly: bool,

    /// Postpone blob re-touches on restore to sweep time.
    #[serde(default = "default_defer_blob_touch")]
    pub defer_blob_touch: bool,

    /// Compaction age bound.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Compaction size budget.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            codec: Codec::default(),
            readonly: false,
            defer_blob_touch: default_defer_blob_touch(),
            ttl_hours: default_ttl_hours(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

impl StoreConfig {
    /// The compaction TTL as a duration. Absurdly large values clamp to
    /// the representable maximum, which never ages anything out.
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        i64::try_from(self.ttl_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Resolves the store root from this config and the environment.
    pub fn resolve_root(&self) -> Result<PathBuf> {
        resolve_store_root(
            self.root.clone(),
            std::env::var_os("KILN_CACHE_DIR").map(PathBuf::from),
            dirs::cache_dir(),
            std::env::temp_dir(),
        )
    }
}

/// Root resolution with injectable inputs.
///
/// Resolution order (first writable wins):
/// 1. explicit config root
/// 2. `KILN_CACHE_DIR` (empty values are ignored)
/// 3. `<platform cache dir>/kiln`
/// 4. `<temp dir>/kiln`
///
/// Existing candidates are probed with a throwaway file before being
/// accepted; absent ones must be creatable. A read-only candidate falls
/// through to the next one instead of failing every later put.
pub fn resolve_store_root(
    explicit: Option<PathBuf>,
    env_override: Option<PathBuf>,
    platform_cache_dir: Option<PathBuf>,
    mut temp_dir: PathBuf,
) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(root) = explicit {
        candidates.push(root);
    }
    if let Some(root) = env_override
        && !root.as_os_str().is_empty()
    {
        candidates.push(root);
    }
    if let Some(base) = platform_cache_dir {
        candidates.push(base.join("kiln"));
    }
    temp_dir.push("kiln");
    candidates.push(temp_dir);

    for path in candidates {
        // An existing directory may still be read-only; some CI images
        // mount the platform cache dir that way.
        if path.exists() {
            if probe_writable(&path) {
                return Ok(path);
            }
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        // Permission denied or a file in the way, try the next candidate.
    }
    Err(Error::configuration(
        "no writable cache root: set a store root or KILN_CACHE_DIR",
    ))
}

fn probe_writable(path: &Path) -> bool {
    let probe = path.join(".write_probe");
    let ok = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&probe)
        .is_ok();
    if ok {
        let _ = std::fs::remove_file(&probe);
    }
    ok
}

// Default value functions for serde

fn default_defer_blob_touch() -> bool {
    true
}

fn default_ttl_hours() -> u64 {
    168
}

fn default_max_size_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}
