//! Content-service tier
//!
//! Same wire shape as the HTTP object store but aimed at content services
//! that keep an action-cache namespace (`/ac/<uid>`) next to a CAS
//! namespace (`/cas/<hash>`) and deduplicate on the server side. Blob
//! uploads are therefore sent unconditionally instead of being prechecked
//! with `HEAD`.

use std::path::Path;

use kiln_core::{CacheTier, CancelToken, Codec, PathFilter, TierProbe, TierStatsSnapshot, Uid};

use crate::config::RemoteConfig;
use crate::error::Result;
use crate::http::HttpTierCore;

/// Action-cache/CAS tier (`/ac/<uid>`, `/cas/<hash>`).
pub struct ContentServiceTier {
    core: HttpTierCore,
}

impl ContentServiceTier {
    /// Creates the tier against the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-http(s) endpoint or an
    /// unbuildable client.
    pub fn new(config: &RemoteConfig, cancel: CancelToken) -> Result<Self> {
        Ok(Self {
            core: HttpTierCore::new("content-service", config, cancel, "ac", "cas", false)?,
        })
    }
}

impl CacheTier for ContentServiceTier {
    fn name(&self) -> &str {
        self.core.common.name
    }

    fn readonly(&self) -> bool {
        self.core.common.readonly
    }

    fn has(&self, uid: &Uid) -> kiln_core::Result<bool> {
        self.core.has(uid)
    }

    fn put(
        &self,
        uid: &Uid,
        root: &Path,
        files: &[String],
        codec: Codec,
    ) -> kiln_core::Result<bool> {
        self.core.put(uid, root, files, codec)
    }

    fn try_restore(
        &self,
        uid: &Uid,
        into: &Path,
        filter: Option<PathFilter<'_>>,
    ) -> kiln_core::Result<bool> {
        self.core.try_restore(uid, into, filter)
    }

    fn fits(&self, probe: &TierProbe<'_>) -> bool {
        self.core.common.fits(probe)
    }

    fn stats(&self) -> TierStatsSnapshot {
        self.core.common.snapshot()
    }
}
