//! Per-tier telemetry counters
//!
//! Every cache tier counts and times its network/disk calls into one
//! [`TierCounters`] value. Counters feed telemetry snapshots only; no
//! control flow ever depends on them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// The four counted tier operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Existence probe
    Has,
    /// Publish outputs
    Put,
    /// Blob download / materialization
    Get,
    /// Manifest fetch
    GetMeta,
}

impl OpKind {
    /// Stable name used as the snapshot map key
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Has => "has",
            Self::Put => "put",
            Self::Get => "get",
            Self::GetMeta => "get-meta",
        }
    }
}

#[derive(Debug, Default)]
struct OpCounter {
    calls: AtomicU64,
    failures: AtomicU64,
    nanos: AtomicU64,
}

impl OpCounter {
    fn record(&self, started: Instant, ok: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn snapshot(&self) -> OpStats {
        OpStats {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_ms: self.nanos.load(Ordering::Relaxed) / 1_000_000,
        }
    }
}

/// Counters shared by every tier implementation
#[derive(Debug, Default)]
pub struct TierCounters {
    has: OpCounter,
    put: OpCounter,
    get: OpCounter,
    get_meta: OpCounter,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl TierCounters {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&self, kind: OpKind) -> &OpCounter {
        match kind {
            OpKind::Has => &self.has,
            OpKind::Put => &self.put,
            OpKind::Get => &self.get,
            OpKind::GetMeta => &self.get_meta,
        }
    }

    /// Record one call of `kind` started at `started`
    pub fn record(&self, kind: OpKind, started: Instant, ok: bool) {
        self.op(kind).record(started, ok);
    }

    /// Count a successful restore or probe hit
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a miss
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Account bytes written to the tier
    pub fn add_bytes_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    /// Account bytes read from the tier
    pub fn add_bytes_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    /// Produce a serializable snapshot
    #[must_use]
    pub fn snapshot(&self, tier: impl Into<String>, disabled: bool) -> TierStatsSnapshot {
        let mut ops = BTreeMap::new();
        for kind in [OpKind::Has, OpKind::Put, OpKind::Get, OpKind::GetMeta] {
            ops.insert(kind.as_str().to_string(), self.op(kind).snapshot());
        }
        TierStatsSnapshot {
            tier: tier.into(),
            disabled,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_up.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_down.load(Ordering::Relaxed),
            ops,
        }
    }
}

/// Call statistics for one operation kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStats {
    /// Total calls
    pub calls: u64,
    /// Calls that returned an error
    pub failures: u64,
    /// Accumulated wall time in milliseconds
    pub total_ms: u64,
}

/// Point-in-time view of one tier's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStatsSnapshot {
    /// Tier name
    pub tier: String,
    /// Whether the tier has been disabled for the rest of the run
    pub disabled: bool,
    /// Successful restores/probes
    pub hits: u64,
    /// Misses
    pub misses: u64,
    /// Bytes written to the tier
    pub bytes_uploaded: u64,
    /// Bytes read from the tier
    pub bytes_downloaded: u64,
    /// Per-operation call counts keyed by operation name
    pub ops: BTreeMap<String, OpStats>,
}
