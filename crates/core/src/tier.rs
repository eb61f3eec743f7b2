//! The cache tier capability trait
//!
//! Each backend (local disk, HTTP object store, table store, content
//! service) implements [`CacheTier`]; the build driver holds an ordered
//! chain of boxed tiers and walks it on restore, falling through tiers on
//! misses. Tiers are selected at configuration time, never by runtime type
//! inspection.

use crate::codec::Codec;
use crate::error::Result;
use crate::id::Uid;
use crate::stats::TierStatsSnapshot;
use std::path::Path;

/// Predicate over relative output paths used to restrict a restore
pub type PathFilter<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// What a put would publish, for admission filtering
#[derive(Debug, Clone, Copy)]
pub struct TierProbe<'a> {
    /// Uid the outputs would be published under
    pub uid: &'a Uid,
    /// Declared total output size in bytes
    pub total_size: u64,
    /// Declared relative output paths
    pub paths: &'a [String],
}

/// One cache backend in the fallback chain
///
/// Expected misses are `Ok(false)`, never errors; an `Err` from a tier
/// means the tier itself is unhealthy and the caller should fall through
/// to the next one.
pub trait CacheTier: Send + Sync {
    /// Stable tier name for logs and stats
    fn name(&self) -> &str;

    /// Whether the tier rejects writes (heater/seed-only deployments)
    ///
    /// `put` on a readonly tier is a success-shaped no-op.
    fn readonly(&self) -> bool;

    /// Probe whether outputs for `uid` are present
    ///
    /// # Errors
    ///
    /// Returns a tier error when the backend is unhealthy.
    fn has(&self, uid: &Uid) -> Result<bool>;

    /// Publish the files under `root` as the outputs of `uid`
    ///
    /// Blob writes complete before the manifest is published, so a
    /// concurrent reader never sees a restorable uid with missing blobs.
    /// Returns whether anything was stored.
    ///
    /// # Errors
    ///
    /// Returns a tier error when the backend is unhealthy; a source file
    /// missing under `root` is also an error.
    fn put(&self, uid: &Uid, root: &Path, files: &[String], codec: Codec) -> Result<bool>;

    /// Materialize the outputs of `uid` under `into`
    ///
    /// `filter` restricts which relative paths are materialized. Returns
    /// `Ok(false)` on a miss.
    ///
    /// # Errors
    ///
    /// Returns a tier error when the backend is unhealthy.
    fn try_restore(&self, uid: &Uid, into: &Path, filter: Option<PathFilter<'_>>)
    -> Result<bool>;

    /// Admission filter consulted before `put` is attempted
    fn fits(&self, probe: &TierProbe<'_>) -> bool;

    /// Telemetry snapshot
    fn stats(&self) -> TierStatsSnapshot;
}
