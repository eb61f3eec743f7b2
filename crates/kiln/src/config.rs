//! Session and queue configuration

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use kiln_core::Codec;
use kiln_runner::ResourceVector;
use serde::{Deserialize, Serialize};

/// Worker pool sizing and the shared resource capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Resource capacity by dimension. Empty means one `cpu` unit per
    /// worker.
    #[serde(default)]
    pub cap: BTreeMap<String, u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cap: BTreeMap::new(),
        }
    }
}

impl QueueConfig {
    /// The configured capacity as a [`ResourceVector`].
    #[must_use]
    pub fn cap_vector(&self) -> ResourceVector {
        if self.cap.is_empty() {
            return ResourceVector::new().with("cpu", self.workers as u64);
        }
        let mut cap = ResourceVector::new();
        for (kind, amount) in &self.cap {
            cap.set(kind.clone(), *amount);
        }
        cap
    }
}

/// Everything a [`crate::BuildSession`] needs besides nodes and tiers.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Workspace root: actions write their outputs here and cache hits are
    /// restored into it.
    pub root: PathBuf,

    /// Codec applied to blobs published from this session.
    pub codec: Codec,

    /// Worker pool sizing.
    pub queue: QueueConfig,
}

impl SessionOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            codec: Codec::default(),
            queue: QueueConfig::default(),
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

// Default value functions

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, NonZeroUsize::get)
}
