//! The local disk cache tier
//!
//! Wires the blob store, the uid manifest store, and the usage journal
//! into one [`CacheTier`]. Layout under the store root:
//!
//! ```text
//! <root>/cas/<hex0>/<hex1>/<hash>   content-addressed blobs
//! <root>/uid/<c0>/<c1>/<uid>       manifests
//! <root>/usage.log                  recency journal
//! ```
//!
//! Publishing order is blobs first, manifest last, so a concurrently
//! reading process never sees a restorable uid whose blobs are missing.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use kiln_core::{
    CacheTier, CancelToken, Codec, FileEntry, OpKind, OutputManifest, PathFilter, TierCounters,
    TierProbe, TierStatsSnapshot, Uid,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cas::BlobStore;
use crate::compact::{self, CompactSummary, StripSummary};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::lru::{hash_key, uid_key, LruIndex};
use crate::meta::UidStore;

/// Outcome of an integrity walk over every manifest.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IntegrityReport {
    pub checked_uids: u64,
    pub checked_files: u64,
    pub missing_blobs: u64,
    pub size_mismatches: u64,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing_blobs == 0 && self.size_mismatches == 0
    }
}

pub struct LocalCacheTier {
    blobs: BlobStore,
    metas: UidStore,
    lru: Mutex<LruIndex>,
    counters: TierCounters,
    readonly: bool,
    defer_blob_touch: bool,
    ttl: chrono::Duration,
    max_size_bytes: u64,
}

impl LocalCacheTier {
    /// Opens the tier at the root the config resolves to.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let root = config.resolve_root()?;
        Self::open_at(&root, config)
    }

    /// Opens the tier at an explicit root.
    pub fn open_at(root: &Path, config: &StoreConfig) -> Result<Self> {
        let blobs = BlobStore::open(root.join("cas"))?;
        let metas = UidStore::open(root.join("uid"))?;
        let lru = LruIndex::load(root.join("usage.log"))?;
        info!(
            root = %root.display(),
            readonly = config.readonly,
            "opened local cache tier"
        );
        Ok(Self {
            blobs,
            metas,
            lru: Mutex::new(lru),
            counters: TierCounters::new(),
            readonly: config.readonly,
            defer_blob_touch: config.defer_blob_touch,
            ttl: config.ttl(),
            max_size_bytes: config.max_size_bytes,
        })
    }

    fn lru(&self) -> MutexGuard<'_, LruIndex> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    #[must_use]
    pub fn metas(&self) -> &UidStore {
        &self.metas
    }

    /// Recorded on-disk footprint of the store.
    #[must_use]
    pub fn recorded_size(&self) -> u64 {
        self.lru().total_size()
    }

    /// Runs the age/size sweep with the configured bounds.
    ///
    /// A no-op in readonly mode.
    pub fn compact(&self, cancel: &CancelToken) -> Result<CompactSummary> {
        if self.readonly {
            return Ok(CompactSummary::default());
        }
        let mut lru = self.lru();
        compact::compact(
            &self.blobs,
            &self.metas,
            &mut lru,
            self.ttl,
            self.max_size_bytes,
            cancel,
        )
    }

    /// Runs the reference-checked shrink. A no-op in readonly mode.
    ///
    /// Callers must quiesce cache traffic for the duration.
    pub fn strip<P>(&self, cancel: &CancelToken, predicate: P) -> Result<StripSummary>
    where
        P: FnMut(&str, DateTime<Utc>, u64) -> bool,
    {
        if self.readonly {
            return Ok(StripSummary::default());
        }
        let mut lru = self.lru();
        compact::strip(&self.blobs, &self.metas, &mut lru, cancel, predicate)
    }

    /// Checks every manifest against the blob store.
    pub fn verify(&self, cancel: &CancelToken) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        for uid in self.metas.list()? {
            cancel.check()?;
            let manifest = match self.metas.get(&uid) {
                Ok(manifest) => manifest,
                Err(e) if e.is_miss() => continue,
                Err(e) => return Err(e),
            };
            report.checked_uids += 1;
            for (path, entry) in manifest.iter() {
                report.checked_files += 1;
                match self.blobs.size_of(&entry.hash) {
                    Ok(size) if size == entry.size => {}
                    Ok(size) => {
                        warn!(
                            uid = %uid,
                            path,
                            expected = entry.size,
                            actual = size,
                            "blob size mismatch"
                        );
                        report.size_mismatches += 1;
                    }
                    Err(e) if e.is_miss() => {
                        warn!(uid = %uid, path, hash = %entry.hash, "manifest references missing blob");
                        report.missing_blobs += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(report)
    }

    /// Refreshes the uid's recency, re-seeding the journal entry if it was
    /// lost.
    fn touch_uid(&self, lru: &mut LruIndex, uid: &Uid) {
        let key = uid_key(uid);
        let touched = match lru.retouch(&key) {
            Ok(touched) => touched,
            Err(e) => {
                warn!(uid = %uid, error = %e, "usage touch failed");
                return;
            }
        };
        if !touched
            && let Ok(size) = self.metas.size_of(uid)
            && let Err(e) = lru.touch(&key, size)
        {
            warn!(uid = %uid, error = %e, "usage touch failed");
        }
    }

    fn put_inner(&self, uid: &Uid, root: &Path, files: &[String], codec: Codec) -> Result<bool> {
        if self.readonly {
            debug!(uid = %uid, "readonly tier, skipping put");
            return Ok(false);
        }

        let mut manifest = OutputManifest::new();
        let mut stored_blobs = Vec::with_capacity(files.len());
        let mut uploaded = 0u64;
        for rel in files {
            let source = root.join(rel);
            let stored = self.blobs.put_file(&source, codec)?;
            manifest.insert(
                rel.clone(),
                FileEntry {
                    hash: stored.hash.clone(),
                    size: stored.size,
                    mode: stored.source_mode,
                    codec,
                },
            );
            uploaded += stored.size;
            stored_blobs.push((stored.hash, stored.size));
        }

        // Blobs are durable; publishing the manifest makes the uid visible.
        let meta_bytes = self.metas.put(uid, &manifest)?;

        let mut lru = self.lru();
        if let Err(e) = lru.touch(&uid_key(uid), meta_bytes) {
            warn!(uid = %uid, error = %e, "usage touch failed");
        }
        for (hash, size) in &stored_blobs {
            if let Err(e) = lru.touch(&hash_key(hash), *size) {
                warn!(hash = %hash, error = %e, "usage touch failed");
            }
        }
        drop(lru);

        self.counters.add_bytes_up(uploaded);
        debug!(uid = %uid, files = files.len(), bytes = uploaded, "published to local tier");
        Ok(true)
    }

    fn restore_inner(
        &self,
        uid: &Uid,
        into: &Path,
        filter: Option<PathFilter<'_>>,
    ) -> Result<bool> {
        let manifest = match self.metas.get(uid) {
            Ok(manifest) => manifest,
            Err(e) if e.is_miss() => return Ok(false),
            Err(Error::Corrupt { key, message }) => {
                warn!(uid = %key, message, "corrupt manifest, treating as miss");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut restored = 0u64;
        for (path, entry) in manifest.iter() {
            if let Some(filter) = filter
                && !filter(path)
            {
                continue;
            }
            match self.blobs.size_of(&entry.hash) {
                Ok(size) if size == entry.size => {}
                Ok(size) => {
                    warn!(
                        uid = %uid,
                        path,
                        expected = entry.size,
                        actual = size,
                        "blob size mismatch, treating as miss"
                    );
                    return Ok(false);
                }
                Err(e) if e.is_miss() => {
                    warn!(uid = %uid, path, "missing blob, treating as miss");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
            let dest = into.join(path);
            match self
                .blobs
                .extract_file(&entry.hash, &dest, entry.codec, Some(entry.mode))
            {
                Ok(written) => restored += written,
                // Evicted between the size check and the extract.
                Err(e) if e.is_miss() => {
                    warn!(uid = %uid, path, "blob vanished mid-restore, treating as miss");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        self.counters.add_bytes_down(restored);
        if !self.readonly {
            let mut lru = self.lru();
            self.touch_uid(&mut lru, uid);
            if self.defer_blob_touch {
                lru.defer(uid);
            } else {
                for hash in manifest.hashes() {
                    if let Err(e) = lru.retouch(&hash_key(hash)) {
                        warn!(hash = %hash, error = %e, "usage touch failed");
                    }
                }
            }
        }
        debug!(uid = %uid, bytes = restored, "restored from local tier");
        Ok(true)
    }
}

impl CacheTier for LocalCacheTier {
    fn name(&self) -> &str {
        "local"
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn has(&self, uid: &Uid) -> kiln_core::Result<bool> {
        let started = Instant::now();
        let present = self.metas.contains(uid);
        if present {
            if !self.readonly {
                let mut lru = self.lru();
                self.touch_uid(&mut lru, uid);
            }
            self.counters.record_hit();
        } else {
            self.counters.record_miss();
        }
        self.counters.record(OpKind::Has, started, true);
        Ok(present)
    }

    fn put(
        &self,
        uid: &Uid,
        root: &Path,
        files: &[String],
        codec: Codec,
    ) -> kiln_core::Result<bool> {
        let started = Instant::now();
        let outcome = self.put_inner(uid, root, files, codec);
        self.counters.record(OpKind::Put, started, outcome.is_ok());
        outcome.map_err(Into::into)
    }

    fn try_restore(
        &self,
        uid: &Uid,
        into: &Path,
        filter: Option<PathFilter<'_>>,
    ) -> kiln_core::Result<bool> {
        let started = Instant::now();
        let outcome = self.restore_inner(uid, into, filter);
        self.counters.record(OpKind::Get, started, outcome.is_ok());
        match outcome {
            Ok(true) => {
                self.counters.record_hit();
                Ok(true)
            }
            Ok(false) => {
                self.counters.record_miss();
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fits(&self, _probe: &TierProbe<'_>) -> bool {
        !self.readonly
    }

    fn stats(&self) -> TierStatsSnapshot {
        self.counters.snapshot("local", false)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use walkdir::WalkDir;

    use super::*;

    fn open_tier(root: &Path) -> LocalCacheTier {
        LocalCacheTier::open_at(root, &StoreConfig::default()).unwrap()
    }

    fn write_file(dir: &Path, rel: &str, data: &[u8], mode: u32) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn blob_file_count(tier: &LocalCacheTier) -> usize {
        WalkDir::new(tier.blobs().root())
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_round_trip_preserves_bytes_paths_and_modes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let src = tmp.path().join("src");
        write_file(&src, "dir/a.txt", b"hello", 0o644);
        write_file(&src, "bin/tool", b"#!/bin/sh\nexit 0\n", 0o755);

        let uid = Uid::new("u1").unwrap();
        let files = vec!["dir/a.txt".to_string(), "bin/tool".to_string()];
        assert!(tier.put(&uid, &src, &files, Codec::None).unwrap());
        assert!(tier.has(&uid).unwrap());

        let out = tmp.path().join("out");
        assert!(tier.try_restore(&uid, &out, None).unwrap());
        assert_eq!(fs::read(out.join("dir/a.txt")).unwrap(), b"hello");
        assert_eq!(
            fs::read(out.join("bin/tool")).unwrap(),
            b"#!/bin/sh\nexit 0\n"
        );
        let mode = fs::metadata(out.join("bin/tool"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_repeated_put_does_not_grow_the_blob_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let src = tmp.path().join("src");
        write_file(&src, "a.txt", b"stable content", 0o644);

        let uid = Uid::new("u1").unwrap();
        let files = vec!["a.txt".to_string()];
        tier.put(&uid, &src, &files, Codec::None).unwrap();
        let count = blob_file_count(&tier);

        tier.put(&uid, &src, &files, Codec::None).unwrap();
        tier.put(&Uid::new("u2").unwrap(), &src, &files, Codec::None)
            .unwrap();
        assert_eq!(blob_file_count(&tier), count);
    }

    #[test]
    fn test_missing_uid_is_a_clean_miss() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let uid = Uid::new("absent").unwrap();

        assert!(!tier.has(&uid).unwrap());
        assert!(!tier.try_restore(&uid, &tmp.path().join("out"), None).unwrap());

        let stats = tier.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_filtered_restore_materializes_a_subset() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let src = tmp.path().join("src");
        write_file(&src, "keep.txt", b"keep", 0o644);
        write_file(&src, "skip.txt", b"skip", 0o644);

        let uid = Uid::new("u1").unwrap();
        tier.put(
            &uid,
            &src,
            &["keep.txt".to_string(), "skip.txt".to_string()],
            Codec::None,
        )
        .unwrap();

        let out = tmp.path().join("out");
        let filter = |path: &str| path.starts_with("keep");
        assert!(tier.try_restore(&uid, &out, Some(&filter)).unwrap());
        assert!(out.join("keep.txt").is_file());
        assert!(!out.join("skip.txt").exists());
    }

    #[test]
    fn test_readonly_tier_skips_puts_but_serves_reads() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let src = tmp.path().join("src");
        write_file(&src, "a.txt", b"seeded", 0o644);
        let uid = Uid::new("u1").unwrap();

        {
            let tier = open_tier(&root);
            tier.put(&uid, &src, &["a.txt".to_string()], Codec::None)
                .unwrap();
        }

        let config = StoreConfig {
            readonly: true,
            ..StoreConfig::default()
        };
        let tier = LocalCacheTier::open_at(&root, &config).unwrap();
        assert!(tier.readonly());
        assert!(!tier.fits(&TierProbe {
            uid: &uid,
            total_size: 6,
            paths: &[],
        }));

        // Writes are success-shaped no-ops.
        assert!(!tier
            .put(&Uid::new("u2").unwrap(), &src, &["a.txt".to_string()], Codec::None)
            .unwrap());
        assert!(!tier.has(&Uid::new("u2").unwrap()).unwrap());

        // Reads still work.
        let out = tmp.path().join("out");
        assert!(tier.try_restore(&uid, &out, None).unwrap());
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"seeded");

        // Eviction is also a no-op.
        let summary = tier.compact(&CancelToken::new()).unwrap();
        assert_eq!(summary.erased_uids, 0);
    }

    #[test]
    fn test_size_mismatch_is_a_miss_not_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let src = tmp.path().join("src");
        write_file(&src, "a.txt", b"payload", 0o644);
        let uid = Uid::new("u1").unwrap();
        tier.put(&uid, &src, &["a.txt".to_string()], Codec::None)
            .unwrap();

        // Grow the stored blob behind the manifest's back.
        let manifest = tier.metas().get(&uid).unwrap();
        let hash = manifest.hashes().next().unwrap().clone();
        let blob_path = tier
            .blobs()
            .root()
            .join(&hash.as_hex()[0..1])
            .join(&hash.as_hex()[1..2])
            .join(hash.as_hex());
        fs::write(&blob_path, b"payload plus junk").unwrap();

        assert!(!tier.try_restore(&uid, &tmp.path().join("out"), None).unwrap());
        assert!(!tier.verify(&CancelToken::new()).unwrap().is_clean());
    }

    #[test]
    fn test_put_then_probe_then_restore_scenario() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let src = tmp.path().join("build");
        write_file(&src, "dir/a.txt", b"hello", 0o644);

        let uid = Uid::new("u1").unwrap();
        assert!(tier
            .put(&uid, &src, &["dir/a.txt".to_string()], Codec::None)
            .unwrap());
        assert!(tier.has(&uid).unwrap());

        let out = tmp.path().join("out");
        assert!(tier.try_restore(&uid, &out, None).unwrap());
        assert_eq!(fs::read(out.join("dir/a.txt")).unwrap(), b"hello");

        let stats = tier.stats();
        assert_eq!(stats.hits, 2);
        assert!(stats.bytes_uploaded > 0);
        assert!(stats.bytes_downloaded > 0);
        assert_eq!(stats.ops["put"].calls, 1);
        assert_eq!(stats.ops["get"].calls, 1);
        assert_eq!(stats.ops["has"].calls, 1);
    }

    #[test]
    fn test_verify_reports_clean_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let src = tmp.path().join("src");
        write_file(&src, "a.txt", b"data", 0o644);
        write_file(&src, "b.txt", b"more data", 0o644);

        tier.put(
            &Uid::new("u1").unwrap(),
            &src,
            &["a.txt".to_string(), "b.txt".to_string()],
            Codec::None,
        )
        .unwrap();

        let report = tier.verify(&CancelToken::new()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.checked_uids, 1);
        assert_eq!(report.checked_files, 2);
    }

    #[test]
    fn test_zstd_round_trip_through_the_tier() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tier = open_tier(&tmp.path().join("store"));
        let src = tmp.path().join("src");
        let data = b"log line log line log line\n".repeat(200);
        write_file(&src, "build.log", &data, 0o644);

        let uid = Uid::new("u1").unwrap();
        tier.put(&uid, &src, &["build.log".to_string()], Codec::Zstd)
            .unwrap();

        let out = tmp.path().join("out");
        assert!(tier.try_restore(&uid, &out, None).unwrap());
        assert_eq!(fs::read(out.join("build.log")).unwrap(), data);
    }
}
