//! Session outcome report

use kiln_core::TierStatsSnapshot;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a drained build session left behind.
///
/// `uncompleted` is the load-bearing field: a failed action never signals
/// completion, so everything downstream of it silently stays pending and
/// this set difference is the only place that shows up. Check it even when
/// `first_error` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// Uids whose action node completed, sorted.
    pub completed: Vec<String>,

    /// Uids that never completed: failed actions and everything downstream
    /// of them, sorted.
    pub uncompleted: Vec<String>,

    /// Nodes restored from a cache tier.
    pub hits: u64,

    /// Nodes whose action had to run.
    pub misses: u64,

    /// The first task failure the queue observed, if any.
    pub first_error: Option<String>,

    /// Completion order: one entry per completed group, action uids only.
    pub completion_order: Vec<Vec<String>>,

    /// Per-tier counters at session end, in chain order.
    pub tier_stats: Vec<TierStatsSnapshot>,
}

impl BuildReport {
    /// True when every node completed and no task failed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.first_error.is_none() && self.uncompleted.is_empty()
    }

    /// Pretty-printed JSON rendering.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::serialization(e.to_string()))
    }
}
