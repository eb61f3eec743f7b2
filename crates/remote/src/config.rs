//! Configuration types for the remote cache tiers

use kiln_core::TierProbe;
use serde::{Deserialize, Serialize};

/// Configuration shared by every remote tier implementation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Store endpoint (e.g., "https://cache.example.com:9090")
    pub endpoint: String,

    /// Authentication, when the store requires it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Read-only deployments probe and restore but never publish
    #[serde(default)]
    pub readonly: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Admission filter consulted before puts
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth: None,
            readonly: false,
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

/// Authentication configuration (resolved, ready to use)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Bearer token authentication (Authorization: Bearer <token>)
    Bearer {
        /// Resolved token value
        token: String,
    },

    /// Arbitrary header authentication (e.g., an API-key header)
    Header {
        /// Header name
        name: String,
        /// Resolved header value
        value: String,
    },
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Admission filter for puts: which outputs are worth a network publish
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Outputs totalling fewer bytes than this are not published
    #[serde(default)]
    pub min_size_bytes: u64,

    /// When non-empty, every output path must match one of these prefixes
    #[serde(default)]
    pub allow_prefixes: Vec<String>,

    /// Outputs with any path matching one of these prefixes are never
    /// published. Deny wins over allow.
    #[serde(default)]
    pub deny_prefixes: Vec<String>,
}

impl AdmissionConfig {
    /// Whether the probed output set should be published to this tier
    #[must_use]
    pub fn admits(&self, probe: &TierProbe<'_>) -> bool {
        if probe.total_size < self.min_size_bytes {
            return false;
        }
        if probe
            .paths
            .iter()
            .any(|p| self.deny_prefixes.iter().any(|d| p.starts_with(d)))
        {
            return false;
        }
        if !self.allow_prefixes.is_empty()
            && !probe
                .paths
                .iter()
                .all(|p| self.allow_prefixes.iter().any(|a| p.starts_with(a)))
        {
            return false;
        }
        true
    }
}

// Default value functions
fn default_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
