//! Table-backed tier
//!
//! Stores cache entries in a key-value table with bounded row sizes. Rows:
//!
//! - `meta:<uid>` holds the manifest JSON
//! - `blob:<hash>` holds a small descriptor (`{"size":..,"chunks":..}`)
//! - `blob:<hash>:<i>` holds the i-th chunk of the encoded blob
//!
//! Blobs larger than the chunk size are split across numbered rows. The
//! descriptor row is written after all chunk rows, and the manifest row
//! after all blobs, so a reader never follows a reference to data that is
//! not durable yet.
//!
//! [`TableClient`] abstracts the table itself; [`RestTableClient`] speaks
//! to a `<base>/row/<key>` HTTP endpoint and [`MemoryTableClient`] backs
//! tests and local experiments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use kiln_core::{
    CacheTier, CancelToken, Codec, ContentHash, OpKind, PathFilter, TierProbe,
    TierStatsSnapshot, Uid,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{self, TierCommon};
use crate::config::{RemoteConfig, RetryConfig};
use crate::error::{RemoteError, Result};
use crate::http::HttpEngine;
use crate::retry::retry_with_backoff;

/// Chunk size used when none is configured. Comfortably below common
/// row-size caps.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Row-level access to a key-value table.
pub trait TableClient: Send + Sync {
    /// Reads a row, `None` when absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a row, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Probes a row without reading it.
    fn exists(&self, key: &str) -> Result<bool>;
}

fn meta_row(uid: &Uid) -> String {
    format!("meta:{uid}")
}

fn blob_row(hash: &ContentHash) -> String {
    format!("blob:{hash}")
}

fn chunk_row(hash: &ContentHash, index: u64) -> String {
    format!("blob:{hash}:{index}")
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobRecord {
    size: u64,
    chunks: u64,
}

/// [`TableClient`] over HTTP rows at `<base>/row/<key>`.
pub struct RestTableClient {
    engine: HttpEngine,
}

impl RestTableClient {
    /// Creates a client against the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-http(s) endpoint or an
    /// unbuildable client.
    pub fn new(config: &RemoteConfig, cancel: CancelToken) -> Result<Self> {
        Ok(Self {
            engine: HttpEngine::new(config, cancel)?,
        })
    }
}

impl TableClient for RestTableClient {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.engine.get_once("get", &self.engine.url("row", key))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.engine.put_once("put", &self.engine.url("row", key), value)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.engine.head_once("head", &self.engine.url("row", key))
    }
}

/// In-memory [`TableClient`].
#[derive(Default)]
pub struct MemoryTableClient {
    rows: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTableClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a row, reporting whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.rows().remove(key).is_some()
    }

    /// All row keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.rows().keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }
}

impl TableClient for MemoryTableClient {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.rows().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.rows().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.rows().contains_key(key))
    }
}

/// Cache tier over a [`TableClient`], chunking blobs across rows.
pub struct TableStoreTier {
    client: Arc<dyn TableClient>,
    common: TierCommon,
    retry: RetryConfig,
    cancel: CancelToken,
    chunk_size: usize,
}

impl TableStoreTier {
    /// Creates the tier over an already-built client.
    #[must_use]
    pub fn new(client: Arc<dyn TableClient>, config: &RemoteConfig, cancel: CancelToken) -> Self {
        Self {
            client,
            common: TierCommon::new("table", config),
            retry: config.retry.clone(),
            cancel,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Creates the tier over a [`RestTableClient`] for the configured
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-http(s) endpoint or an
    /// unbuildable client.
    pub fn rest(config: &RemoteConfig, cancel: CancelToken) -> Result<Self> {
        let client = RestTableClient::new(config, cancel.clone())?;
        Ok(Self::new(Arc::new(client), config, cancel))
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn call<T>(&self, operation: &str, f: impl FnMut() -> Result<T>) -> Result<T> {
        retry_with_backoff(&self.retry, &self.cancel, operation, f)
    }

    fn put_inner(&self, uid: &Uid, root: &Path, files: &[String], codec: Codec) -> Result<()> {
        let (manifest, blobs) = backend::collect_outputs(root, files, codec)?;
        let mut uploaded = 0u64;
        for (hash, bytes) in &blobs {
            let descriptor = blob_row(hash);
            // The descriptor is written last, so its presence implies the
            // chunks are already there.
            if self.call("put", || self.client.exists(&descriptor))? {
                debug!(tier = self.common.name, hash = %hash, "table already has blob");
                continue;
            }
            let mut chunks = 0u64;
            for (chunk, index) in bytes.chunks(self.chunk_size).zip(0u64..) {
                self.call("put", || self.client.put(&chunk_row(hash, index), chunk))?;
                chunks += 1;
            }
            let record = BlobRecord {
                size: bytes.len() as u64,
                chunks,
            };
            let record_bytes = serde_json::to_vec(&record)
                .map_err(|e| RemoteError::serialization(e.to_string()))?;
            self.call("put", || self.client.put(&descriptor, &record_bytes))?;
            uploaded += bytes.len() as u64;
        }

        let meta = backend::manifest_bytes(&manifest)?;
        self.call("put", || self.client.put(&meta_row(uid), &meta))?;
        uploaded += meta.len() as u64;

        self.common.counters.add_bytes_up(uploaded);
        debug!(
            tier = self.common.name,
            uid = %uid,
            files = files.len(),
            bytes = uploaded,
            "published to table tier"
        );
        Ok(())
    }

    fn fetch_blob(&self, uid: &Uid, path: &str, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let Some(record_bytes) = self.call("get", || self.client.get(&blob_row(hash)))? else {
            warn!(
                tier = self.common.name,
                uid = %uid,
                path,
                hash = %hash,
                "manifest references a blob the table no longer has, treating as miss"
            );
            return Ok(None);
        };
        let record: BlobRecord = serde_json::from_slice(&record_bytes).map_err(|e| {
            RemoteError::invalid_metadata(hash.as_hex(), format!("bad blob descriptor: {e}"))
        })?;

        let mut bytes = Vec::new();
        for index in 0..record.chunks {
            match self.call("get", || self.client.get(&chunk_row(hash, index)))? {
                Some(chunk) => bytes.extend_from_slice(&chunk),
                None => {
                    warn!(
                        tier = self.common.name,
                        uid = %uid,
                        path,
                        hash = %hash,
                        index,
                        "blob chunk vanished, treating as miss"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(bytes))
    }
}

impl CacheTier for TableStoreTier {
    fn name(&self) -> &str {
        self.common.name
    }

    fn readonly(&self) -> bool {
        self.common.readonly
    }

    fn has(&self, uid: &Uid) -> kiln_core::Result<bool> {
        if self.common.is_disabled() {
            return Ok(false);
        }
        let started = Instant::now();
        let outcome = self.call("has", || self.client.exists(&meta_row(uid)));
        self.common
            .counters
            .record(OpKind::Has, started, outcome.is_ok());
        match outcome {
            Ok(true) => {
                self.common.counters.record_hit();
                Ok(true)
            }
            Ok(false) => {
                self.common.counters.record_miss();
                Ok(false)
            }
            Err(e) => Err(self.common.fail("has", e)),
        }
    }

    fn put(
        &self,
        uid: &Uid,
        root: &Path,
        files: &[String],
        codec: Codec,
    ) -> kiln_core::Result<bool> {
        if self.common.is_disabled() {
            return Ok(false);
        }
        if self.common.readonly {
            debug!(tier = self.common.name, uid = %uid, "readonly tier, skipping put");
            return Ok(false);
        }
        let started = Instant::now();
        let outcome = self.put_inner(uid, root, files, codec);
        self.common
            .counters
            .record(OpKind::Put, started, outcome.is_ok());
        match outcome {
            Ok(()) => Ok(true),
            Err(e) => Err(self.common.fail("put", e)),
        }
    }

    fn try_restore(
        &self,
        uid: &Uid,
        into: &Path,
        filter: Option<PathFilter<'_>>,
    ) -> kiln_core::Result<bool> {
        if self.common.is_disabled() {
            return Ok(false);
        }

        let meta_started = Instant::now();
        let fetched = self.call("get-meta", || self.client.get(&meta_row(uid)));
        self.common
            .counters
            .record(OpKind::GetMeta, meta_started, fetched.is_ok());
        let manifest = match fetched {
            Ok(Some(bytes)) => match backend::parse_manifest(uid, &bytes) {
                Ok(manifest) => manifest,
                Err(e) => return Err(self.common.fail("get-meta", e)),
            },
            Ok(None) => {
                self.common.counters.record_miss();
                return Ok(false);
            }
            Err(e) => return Err(self.common.fail("get-meta", e)),
        };

        let mut restored = 0u64;
        for (path, entry) in manifest.iter() {
            if let Some(filter) = filter
                && !filter(path)
            {
                continue;
            }
            let blob_started = Instant::now();
            let fetched = self.fetch_blob(uid, path, &entry.hash);
            self.common
                .counters
                .record(OpKind::Get, blob_started, fetched.is_ok());
            let bytes = match fetched {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    self.common.counters.record_miss();
                    return Ok(false);
                }
                Err(e) => return Err(self.common.fail("get", e)),
            };
            if bytes.len() as u64 != entry.size {
                warn!(
                    tier = self.common.name,
                    uid = %uid,
                    path,
                    expected = entry.size,
                    actual = bytes.len(),
                    "blob size mismatch, treating as miss"
                );
                self.common.counters.record_miss();
                return Ok(false);
            }
            backend::decode_to_file(&bytes, &into.join(path), entry.codec, entry.mode)
                .map_err(|e| self.common.fail("get", e))?;
            restored += bytes.len() as u64;
        }

        self.common.counters.add_bytes_down(restored);
        self.common.counters.record_hit();
        debug!(tier = self.common.name, uid = %uid, bytes = restored, "restored from table tier");
        Ok(true)
    }

    fn fits(&self, probe: &TierProbe<'_>) -> bool {
        self.common.fits(probe)
    }

    fn stats(&self) -> TierStatsSnapshot {
        self.common.snapshot()
    }
}
