//! HTTP object-store tier
//!
//! Talks plain HTTP to a store serving uid manifests at `<base>/meta/<uid>`
//! and blobs at `<base>/blob/<hash>`: `HEAD` probes, `GET` reads, `PUT`
//! writes. Blob uploads are prechecked with `HEAD` so already-present
//! content is never re-sent, and the manifest is published only after every
//! blob write completed.
//!
//! `HttpEngine` is the request layer shared with the content-service
//! tier and the REST table client: auth header application, transport
//! error classification, and a retried and an unretried call surface.

use std::path::Path;
use std::time::{Duration, Instant};

use kiln_core::{
    CacheTier, CancelToken, Codec, ContentHash, OpKind, PathFilter, TierProbe,
    TierStatsSnapshot, Uid,
};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use crate::backend::{self, TierCommon};
use crate::config::{AuthConfig, RemoteConfig, RetryConfig};
use crate::error::{RemoteError, Result};
use crate::retry::retry_with_backoff;

enum Outcome {
    Found,
    Missing,
    Fail(RemoteError),
}

fn classify(operation: &str, status: StatusCode) -> Outcome {
    if status.is_success() {
        return Outcome::Found;
    }
    if status == StatusCode::NOT_FOUND {
        return Outcome::Missing;
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Outcome::Fail(RemoteError::auth(format!(
            "{operation} rejected with HTTP {}",
            status.as_u16()
        )));
    }
    Outcome::Fail(RemoteError::status(operation, status.as_u16()))
}

/// Blocking HTTP request layer shared by the http-shaped backends.
pub(crate) struct HttpEngine {
    client: Client,
    base: String,
    auth: Option<AuthConfig>,
    retry: RetryConfig,
    timeout_secs: u64,
    cancel: CancelToken,
}

impl HttpEngine {
    pub(crate) fn new(config: &RemoteConfig, cancel: CancelToken) -> Result<Self> {
        let base = config.endpoint.trim_end_matches('/').to_string();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(RemoteError::configuration(format!(
                "endpoint {:?} is not an http(s) URL",
                config.endpoint
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RemoteError::configuration(e.to_string()))?;
        Ok(Self {
            client,
            base,
            auth: config.auth.clone(),
            retry: config.retry.clone(),
            timeout_secs: config.timeout_secs,
            cancel,
        })
    }

    pub(crate) fn url(&self, kind: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base, kind, key)
    }

    fn apply_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(AuthConfig::Bearer { token }) => req.bearer_auth(token),
            Some(AuthConfig::Header { name, value }) => req.header(name.as_str(), value.as_str()),
            None => req,
        }
    }

    fn send(&self, operation: &str, req: RequestBuilder) -> Result<Response> {
        self.apply_auth(req)
            .send()
            .map_err(|e| RemoteError::from_reqwest(operation, &self.base, self.timeout_secs, &e))
    }

    /// One `HEAD`, no retry. `Ok(false)` on 404.
    pub(crate) fn head_once(&self, operation: &str, url: &str) -> Result<bool> {
        let resp = self.send(operation, self.client.head(url))?;
        match classify(operation, resp.status()) {
            Outcome::Found => Ok(true),
            Outcome::Missing => Ok(false),
            Outcome::Fail(e) => Err(e),
        }
    }

    /// One `GET`, no retry. `Ok(None)` on 404.
    pub(crate) fn get_once(&self, operation: &str, url: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.send(operation, self.client.get(url))?;
        match classify(operation, resp.status()) {
            Outcome::Found => {
                let bytes = resp.bytes().map_err(|e| {
                    RemoteError::from_reqwest(operation, &self.base, self.timeout_secs, &e)
                })?;
                Ok(Some(bytes.to_vec()))
            }
            Outcome::Missing => Ok(None),
            Outcome::Fail(e) => Err(e),
        }
    }

    /// One `PUT`, no retry.
    pub(crate) fn put_once(&self, operation: &str, url: &str, body: &[u8]) -> Result<()> {
        let resp = self.send(operation, self.client.put(url).body(body.to_vec()))?;
        match classify(operation, resp.status()) {
            Outcome::Found => Ok(()),
            Outcome::Missing => Err(RemoteError::status(operation, 404)),
            Outcome::Fail(e) => Err(e),
        }
    }

    pub(crate) fn head(&self, operation: &str, url: &str) -> Result<bool> {
        retry_with_backoff(&self.retry, &self.cancel, operation, || {
            self.head_once(operation, url)
        })
    }

    pub(crate) fn get(&self, operation: &str, url: &str) -> Result<Option<Vec<u8>>> {
        retry_with_backoff(&self.retry, &self.cancel, operation, || {
            self.get_once(operation, url)
        })
    }

    pub(crate) fn put(&self, operation: &str, url: &str, body: &[u8]) -> Result<()> {
        retry_with_backoff(&self.retry, &self.cancel, operation, || {
            self.put_once(operation, url, body)
        })
    }
}

/// The manifest/blob flows shared by the two http-shaped tiers.
///
/// The tiers differ only in their route names and whether blob uploads are
/// prechecked with `HEAD` (a content service deduplicates server-side, an
/// object store does not).
pub(crate) struct HttpTierCore {
    pub(crate) engine: HttpEngine,
    pub(crate) common: TierCommon,
    meta_kind: &'static str,
    blob_kind: &'static str,
    precheck_blobs: bool,
}

impl HttpTierCore {
    pub(crate) fn new(
        name: &'static str,
        config: &RemoteConfig,
        cancel: CancelToken,
        meta_kind: &'static str,
        blob_kind: &'static str,
        precheck_blobs: bool,
    ) -> Result<Self> {
        Ok(Self {
            engine: HttpEngine::new(config, cancel)?,
            common: TierCommon::new(name, config),
            meta_kind,
            blob_kind,
            precheck_blobs,
        })
    }

    pub(crate) fn meta_url(&self, uid: &Uid) -> String {
        self.engine.url(self.meta_kind, uid.as_str())
    }

    pub(crate) fn blob_url(&self, hash: &ContentHash) -> String {
        self.engine.url(self.blob_kind, hash.as_hex())
    }

    pub(crate) fn has(&self, uid: &Uid) -> kiln_core::Result<bool> {
        if self.common.is_disabled() {
            return Ok(false);
        }
        let started = Instant::now();
        let outcome = self.engine.head("has", &self.meta_url(uid));
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

    pub(crate) fn put(
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

    fn put_inner(&self, uid: &Uid, root: &Path, files: &[String], codec: Codec) -> Result<()> {
        let (manifest, blobs) = backend::collect_outputs(root, files, codec)?;
        let mut uploaded = 0u64;
        for (hash, bytes) in &blobs {
            let url = self.blob_url(hash);
            if self.precheck_blobs && self.engine.head("put", &url)? {
                debug!(tier = self.common.name, hash = %hash, "remote already has blob");
                continue;
            }
            self.engine.put("put", &url, bytes)?;
            uploaded += bytes.len() as u64;
        }

        // Blobs are durable on the remote; publishing the manifest makes
        // the uid visible.
        let meta = backend::manifest_bytes(&manifest)?;
        self.engine.put("put", &self.meta_url(uid), &meta)?;
        uploaded += meta.len() as u64;

        self.common.counters.add_bytes_up(uploaded);
        debug!(
            tier = self.common.name,
            uid = %uid,
            files = files.len(),
            bytes = uploaded,
            "published to remote tier"
        );
        Ok(())
    }

    pub(crate) fn try_restore(
        &self,
        uid: &Uid,
        into: &Path,
        filter: Option<PathFilter<'_>>,
    ) -> kiln_core::Result<bool> {
        if self.common.is_disabled() {
            return Ok(false);
        }

        let meta_started = Instant::now();
        let fetched = self.engine.get("get-meta", &self.meta_url(uid));
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
            let fetched = self.engine.get("get", &self.blob_url(&entry.hash));
            self.common
                .counters
                .record(OpKind::Get, blob_started, fetched.is_ok());
            let bytes = match fetched {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    warn!(
                        tier = self.common.name,
                        uid = %uid,
                        path,
                        hash = %entry.hash,
                        "manifest references a blob the remote no longer has, treating as miss"
                    );
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
        debug!(tier = self.common.name, uid = %uid, bytes = restored, "restored from remote tier");
        Ok(true)
    }
}

/// Plain-HTTP object store tier (`/meta/<uid>`, `/blob/<hash>`).
pub struct HttpStoreTier {
    core: HttpTierCore,
}

impl HttpStoreTier {
    /// Creates the tier against the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-http(s) endpoint or an
    /// unbuildable client.
    pub fn new(config: &RemoteConfig, cancel: CancelToken) -> Result<Self> {
        Ok(Self {
            core: HttpTierCore::new("http", config, cancel, "meta", "blob", true)?,
        })
    }
}

impl CacheTier for HttpStoreTier {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> RemoteConfig {
        RemoteConfig {
            endpoint: endpoint.to_string(),
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn test_urls_trim_the_trailing_slash() {
        let tier =
            HttpStoreTier::new(&config("http://localhost:9090/"), CancelToken::new()).unwrap();
        let uid = Uid::new("u1").unwrap();
        let hash = ContentHash::from_data(b"x");

        assert_eq!(
            tier.core.meta_url(&uid),
            "http://localhost:9090/meta/u1"
        );
        assert_eq!(
            tier.core.blob_url(&hash),
            format!("http://localhost:9090/blob/{hash}")
        );
    }

    #[test]
    fn test_non_http_endpoint_is_a_configuration_error() {
        assert!(matches!(
            HttpStoreTier::new(&config("ftp://cache.example.com"), CancelToken::new()),
            Err(RemoteError::Configuration { .. })
        ));
        assert!(matches!(
            HttpStoreTier::new(&config(""), CancelToken::new()),
            Err(RemoteError::Configuration { .. })
        ));
    }

    #[test]
    fn test_classify_maps_statuses() {
        assert!(matches!(classify("op", StatusCode::OK), Outcome::Found));
        assert!(matches!(
            classify("op", StatusCode::NOT_FOUND),
            Outcome::Missing
        ));
        assert!(matches!(
            classify("op", StatusCode::UNAUTHORIZED),
            Outcome::Fail(RemoteError::Auth { .. })
        ));
        assert!(matches!(
            classify("op", StatusCode::SERVICE_UNAVAILABLE),
            Outcome::Fail(RemoteError::Status { status: 503, .. })
        ));
    }

    #[test]
    fn test_readonly_tier_never_publishes() {
        let mut cfg = config("http://localhost:9090");
        cfg.readonly = true;
        let tier = HttpStoreTier::new(&cfg, CancelToken::new()).unwrap();
        let uid = Uid::new("u1").unwrap();

        // No server is listening; a no-op proves nothing was sent.
        let stored = tier
            .put(&uid, Path::new("/nonexistent"), &["a".to_string()], Codec::None)
            .unwrap();
        assert!(!stored);
        assert!(!tier.fits(&TierProbe {
            uid: &uid,
            total_size: 1 << 20,
            paths: &[],
        }));
    }

    #[test]
    fn test_disabled_tier_short_circuits_to_misses() {
        let tier =
            HttpStoreTier::new(&config("http://localhost:9090"), CancelToken::new()).unwrap();
        let uid = Uid::new("u1").unwrap();
        tier.core.common.fail("has", RemoteError::auth("denied"));

        // No server is listening; an instant miss proves no call was made.
        assert!(!tier.has(&uid).unwrap());
        assert!(!tier
            .try_restore(&uid, Path::new("/tmp/out"), None)
            .unwrap());
        assert!(!tier.fits(&TierProbe {
            uid: &uid,
            total_size: 1 << 20,
            paths: &[],
        }));
        assert!(tier.stats().disabled);
    }
}
